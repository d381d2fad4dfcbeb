use std::sync::Arc;

use dd_expect::{
    Condition, ConditionCatalog, FixtureRegistry, OutcomeCategory, OutcomeResolver, Resolution,
};
use dd_types::{
    CellAxes, CompilationMode, CompilerUnderTest, ConfigurationError, InputToolchain,
    RuntimeIdentity, RuntimeKind, RuntimeVersion,
};
use proptest::prelude::*;

const NAMES: [&str; 3] = ["001-HelloWorld", "086-null-super", "800-smali"];

fn registry() -> FixtureRegistry {
    let body = r#"
snapshots:
  current: current
  legacy: legacy
tests:
  001-HelloWorld:
    toolchains: [none, dx, jack]
  086-null-super:
    toolchains: [none, dx, jack]
  800-smali:
    toolchains: [none, dx, jack]
"#;
    FixtureRegistry::from_yaml_str("/fixtures", body).expect("registry")
}

fn version() -> impl Strategy<Value = RuntimeVersion> {
    proptest::sample::select(RuntimeVersion::ALL.to_vec())
}

fn axes() -> impl Strategy<Value = CellAxes> {
    (
        proptest::sample::select(InputToolchain::ALL.to_vec()),
        proptest::sample::select(CompilerUnderTest::ALL.to_vec()),
        version(),
        proptest::sample::select(RuntimeKind::ALL.to_vec()),
        proptest::sample::select(CompilationMode::ALL.to_vec()),
    )
        .prop_map(|(toolchain, compiler, version, kind, mode)| {
            CellAxes::new(toolchain, compiler, RuntimeIdentity { version, kind }, mode)
        })
}

fn condition() -> impl Strategy<Value = Condition> {
    let leaf = prop_oneof![
        Just(Condition::any()),
        Just(Condition::never()),
        proptest::sample::subsequence(InputToolchain::ALL.to_vec(), 1..=2)
            .prop_map(|values| Condition::toolchains(values)),
        proptest::sample::subsequence(CompilerUnderTest::ALL.to_vec(), 1..=3)
            .prop_map(|values| Condition::compilers(values)),
        proptest::sample::subsequence(RuntimeVersion::ALL.to_vec(), 1..=4)
            .prop_map(|values| Condition::runtimes(values)),
        version().prop_map(Condition::runtimes_up_to),
        version().prop_map(Condition::runtimes_from),
        proptest::sample::subsequence(CompilationMode::ALL.to_vec(), 1..=1)
            .prop_map(|values| Condition::modes(values)),
    ];
    leaf.prop_recursive(3, 16, 3, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 1..3)
                .prop_map(|values| Condition::matching(values)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a.or(b)),
            inner.prop_map(|c| !c),
        ]
    })
}

proptest! {
    #[test]
    fn resolver_never_sets_both_compile_flags(
        expected in proptest::collection::vec((0..NAMES.len(), condition()), 0..4),
        tolerated in proptest::collection::vec((0..NAMES.len(), condition()), 0..4),
        cell in axes(),
    ) {
        let mut builder = ConditionCatalog::builder();
        for (index, condition) in expected {
            builder =
                builder.condition(OutcomeCategory::CompileExpectedToFail, NAMES[index], condition);
        }
        for (index, condition) in tolerated {
            builder = builder.condition(OutcomeCategory::CompileFails, NAMES[index], condition);
        }
        let resolver = OutcomeResolver::new(Arc::new(builder.build()), Arc::new(registry()));

        for name in NAMES {
            match resolver.resolve_axes(name, cell) {
                Ok(Resolution::Resolved(spec)) => {
                    prop_assert!(!(spec.expected_to_fail_compile && spec.fails_compile));
                }
                Ok(Resolution::Absent) => {}
                Err(ConfigurationError::ConflictingCompileExpectations { test, .. }) => {
                    prop_assert_eq!(test, name);
                }
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn flaky_any_excludes_run_comparison_everywhere(cell in axes()) {
        let catalog = ConditionCatalog::builder()
            .condition(OutcomeCategory::RunIsFlaky, "001-HelloWorld", Condition::any())
            .build();
        let resolver = OutcomeResolver::new(Arc::new(catalog), Arc::new(registry()));
        let resolution = resolver.resolve_axes("001-HelloWorld", cell).expect("resolves");
        let spec = resolution.specification().expect("registered for every snapshot");
        prop_assert!(spec.skip_run);
    }

    #[test]
    fn negation_is_the_complement(condition in condition(), cell in axes()) {
        prop_assert_eq!((!condition.clone()).evaluate(&cell), !condition.evaluate(&cell));
    }

    #[test]
    fn serialized_condition_evaluates_identically(condition in condition(), cell in axes()) {
        let json = serde_json::to_string(&condition).expect("serialize");
        let back: Condition = serde_json::from_str(&json).expect("deserialize");
        prop_assert_eq!(back.evaluate(&cell), condition.evaluate(&cell));
    }

    #[test]
    fn version_range_matches_enumeration(low in version(), high in version(), cell in axes()) {
        let range = Condition::runtimes_between(low, high);
        let enumerated = Condition::runtimes(
            RuntimeVersion::ALL.into_iter().filter(|v| low <= *v && *v <= high),
        );
        prop_assert_eq!(range.evaluate(&cell), enumerated.evaluate(&cell));
    }
}

#[test]
fn catalog_from_yaml_drives_resolution() {
    let catalog = ConditionCatalog::from_yaml_str(
        r#"
categories:
  run_fails:
    086-null-super:
      - compilers: [d8]
        runtimes_up_to: "4.4.4"
  output_may_differ:
    800-smali: [any]
"#,
    )
    .expect("catalog");
    let resolver = OutcomeResolver::new(Arc::new(catalog), Arc::new(registry()));
    let dalvik = resolver
        .resolve(
            "086-null-super",
            InputToolchain::ExternalDexer,
            CompilerUnderTest::D8,
            RuntimeIdentity::host(RuntimeVersion::V4_4_4),
            CompilationMode::Debug,
        )
        .expect("resolves");
    assert!(dalvik.specification().expect("spec").fails_run);

    let smali = resolver
        .resolve(
            "800-smali",
            InputToolchain::NoPreprocessing,
            CompilerUnderTest::R8,
            RuntimeIdentity::host(RuntimeVersion::Default),
            CompilationMode::Release,
        )
        .expect("resolves");
    assert!(smali.specification().expect("spec").output_may_differ);
}
