use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dd_compile::{
    BackendId, CompileError, CompileInput, CompileRequest, CompilerBackend, CompilerInvoker,
};
use dd_expect::{
    Condition, ConditionCatalog, FixtureRegistry, OutcomeCategory, OutcomeResolver,
    TestSpecification,
};
use dd_types::{
    CompilationFailure, CompilationMode, CompilerUnderTest, InputToolchain, RuntimeIdentity,
    RuntimeVersion,
};

const FIXTURES: &str = r#"
snapshots:
  current: current
  legacy: legacy
tests:
  001-HelloWorld: {}
  800-smali: {}
"#;

/// Writes one output per program input and records every request it sees.
struct RecordingBackend {
    id: BackendId,
    failure: Option<CompilationFailure>,
    requests: Mutex<Vec<CompileRequest>>,
}

impl RecordingBackend {
    fn new(id: BackendId) -> Arc<Self> {
        Arc::new(Self {
            id,
            failure: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn failing(id: BackendId, failure: CompilationFailure) -> Arc<Self> {
        Arc::new(Self {
            id,
            failure: Some(failure),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<CompileRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

impl CompilerBackend for RecordingBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn compile(&self, request: &CompileRequest) -> Result<Vec<PathBuf>, CompilationFailure> {
        self.requests.lock().expect("requests").push(request.clone());
        if let Some(failure) = &self.failure {
            std::fs::write(request.output_dir.join("partial.dex"), "half")
                .expect("write partial output");
            return Err(failure.clone());
        }
        let mut outputs = Vec::new();
        for input in &request.program {
            let stem = input
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("unnamed");
            let output = request
                .output_dir
                .join(format!("{stem}.{}", self.id.output_extension()));
            std::fs::write(&output, format!("{}:{stem}", self.id)).expect("write output");
            outputs.push(output);
        }
        Ok(outputs)
    }
}

fn specification(
    test: &str,
    compiler: CompilerUnderTest,
    catalog: ConditionCatalog,
) -> TestSpecification {
    let registry = FixtureRegistry::from_yaml_str("/fixtures", FIXTURES).expect("registry");
    let resolver = OutcomeResolver::new(Arc::new(catalog), Arc::new(registry));
    resolver
        .resolve(
            test,
            InputToolchain::NoPreprocessing,
            compiler,
            RuntimeIdentity::host(RuntimeVersion::Default),
            compiler.default_mode(),
        )
        .expect("resolves")
        .specification()
        .cloned()
        .expect("fixture present")
}

fn input(files: &[&str]) -> CompileInput {
    CompileInput {
        program: files.iter().map(|file| Path::new("/in").join(file)).collect(),
        libraries: vec![PathBuf::from("/sdk/android.jar")],
    }
}

fn diagnosable() -> CompilationFailure {
    CompilationFailure::diagnosable("r8_cf", "Error: Missing class", "Error: Missing class Foo")
}

#[test]
fn stage_one_rejection_never_reaches_stage_two() {
    let first = RecordingBackend::failing(BackendId::R8Cf, diagnosable());
    let second = RecordingBackend::new(BackendId::D8);
    let invoker = CompilerInvoker::new()
        .with_backend(first.clone())
        .with_backend(second.clone());
    let spec = specification(
        "001-HelloWorld",
        CompilerUnderTest::D8AfterR8Cf,
        ConditionCatalog::builder().build(),
    );
    let out = tempfile::tempdir().expect("tempdir");

    let err = invoker
        .compile(
            CompilerUnderTest::D8AfterR8Cf,
            &input(&["Main.class"]),
            CompilationMode::Release,
            &spec,
            out.path(),
        )
        .expect_err("stage one fails");
    match err {
        CompileError::Failure(failure) => assert!(failure.is_diagnosable()),
        other => panic!("expected a compilation failure, got {other:?}"),
    }
    assert_eq!(first.requests().len(), 1);
    assert!(second.requests().is_empty());
}

#[test]
fn failed_compilation_leaves_result_dir_empty() {
    let backend = RecordingBackend::failing(
        BackendId::D8,
        CompilationFailure::crash("d8", "Exception in thread \"main\""),
    );
    let invoker = CompilerInvoker::new().with_backend(backend);
    let spec = specification(
        "001-HelloWorld",
        CompilerUnderTest::D8,
        ConditionCatalog::builder().build(),
    );
    let out = tempfile::tempdir().expect("tempdir");
    std::fs::write(out.path().join("stale.dex"), "old").expect("stale output");

    let result = invoker.compile(
        CompilerUnderTest::D8,
        &input(&["classes.dex"]),
        CompilationMode::Debug,
        &spec,
        out.path(),
    );
    assert!(matches!(result, Err(CompileError::Failure(_))));
    let leftovers: Vec<_> = std::fs::read_dir(out.path()).expect("read dir").collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn compiling_twice_gives_the_same_digest() {
    let invoker = CompilerInvoker::new()
        .with_backend(RecordingBackend::new(BackendId::D8))
        .with_backend(RecordingBackend::new(BackendId::R8));
    let spec = specification(
        "001-HelloWorld",
        CompilerUnderTest::R8AfterD8,
        ConditionCatalog::builder().build(),
    );
    let out = tempfile::tempdir().expect("tempdir");
    let compile = || {
        invoker
            .compile(
                CompilerUnderTest::R8AfterD8,
                &input(&["Main.class", "Helper.class"]),
                CompilationMode::Release,
                &spec,
                out.path(),
            )
            .expect("compiles")
    };

    let first = compile();
    let second = compile();
    assert_eq!(first.digest, second.digest);
    assert_eq!(first.files, second.files);
    assert!(first.is_dex());
    assert_eq!(first.files.len(), 2);
}

#[test]
fn class_file_stage_passes_dex_inputs_through_and_tolerates_missing_classes() {
    let first = RecordingBackend::new(BackendId::R8Cf);
    let second = RecordingBackend::new(BackendId::D8);
    let invoker = CompilerInvoker::new()
        .with_backend(first.clone())
        .with_backend(second.clone());
    let catalog = ConditionCatalog::builder()
        .keep_rules("001-HelloWorld", "-keep class Main { *; }")
        .build();
    let spec = specification("001-HelloWorld", CompilerUnderTest::D8AfterR8Cf, catalog);
    let out = tempfile::tempdir().expect("tempdir");

    let artifact = invoker
        .compile(
            CompilerUnderTest::D8AfterR8Cf,
            &input(&["Main.class", "prebuilt.dex"]),
            CompilationMode::Release,
            &spec,
            out.path(),
        )
        .expect("compiles");

    let stage_one = first.requests();
    assert_eq!(stage_one.len(), 1);
    assert_eq!(stage_one[0].program, vec![PathBuf::from("/in/Main.class")]);
    assert!(!stage_one[0].options.ignore_missing_classes);
    assert!(stage_one[0].options.keep_rules.is_some());

    let stage_two = second.requests();
    assert_eq!(stage_two.len(), 1);
    assert!(stage_two[0].options.ignore_missing_classes);
    assert!(stage_two[0].options.keep_rules.is_none());
    assert!(
        stage_two[0]
            .program
            .contains(&PathBuf::from("/in/prebuilt.dex"))
    );
    assert_eq!(stage_two[0].libraries, vec![PathBuf::from("/sdk/android.jar")]);
    assert_eq!(stage_two[0].output_dir, out.path());
    assert!(artifact.is_dex());
}

#[test]
fn tolerance_flags_become_compile_options() {
    let backend = RecordingBackend::new(BackendId::R8);
    let invoker = CompilerInvoker::new().with_backend(backend.clone());
    let catalog = ConditionCatalog::builder()
        .condition(
            OutcomeCategory::RequiresDisabledInlining,
            "800-smali",
            Condition::any(),
        )
        .condition(OutcomeCategory::HasMissingClasses, "800-smali", Condition::any())
        .build();
    let spec = specification("800-smali", CompilerUnderTest::R8, catalog);
    let out = tempfile::tempdir().expect("tempdir");

    invoker
        .compile(
            CompilerUnderTest::R8,
            &input(&["Main.class"]),
            CompilationMode::Release,
            &spec,
            out.path(),
        )
        .expect("compiles");
    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].options.disable_inlining);
    assert!(!requests[0].options.disable_class_inlining);
    assert!(requests[0].options.ignore_missing_classes);
    assert_eq!(requests[0].mode(), CompilationMode::Release);
}

#[test]
fn both_chain_stages_compile_in_the_cell_mode() {
    let first = RecordingBackend::new(BackendId::D8);
    let second = RecordingBackend::new(BackendId::R8);
    let invoker = CompilerInvoker::new()
        .with_backend(first.clone())
        .with_backend(second.clone());
    let spec = specification(
        "001-HelloWorld",
        CompilerUnderTest::R8AfterD8,
        ConditionCatalog::builder().build(),
    );
    let out = tempfile::tempdir().expect("tempdir");

    invoker
        .compile(
            CompilerUnderTest::R8AfterD8,
            &input(&["Main.class"]),
            CompilationMode::Debug,
            &spec,
            out.path(),
        )
        .expect("compiles");
    assert_eq!(first.requests()[0].mode(), CompilationMode::Debug);
    assert_eq!(second.requests()[0].mode(), CompilationMode::Debug);
}

#[test]
fn unregistered_backends_are_reported() {
    let invoker = CompilerInvoker::new().with_backend(RecordingBackend::new(BackendId::D8));
    let spec = specification(
        "001-HelloWorld",
        CompilerUnderTest::R8,
        ConditionCatalog::builder().build(),
    );
    let out = tempfile::tempdir().expect("tempdir");
    let result = invoker.compile(
        CompilerUnderTest::R8,
        &input(&["Main.class"]),
        CompilationMode::Release,
        &spec,
        out.path(),
    );
    assert!(matches!(
        result,
        Err(CompileError::MissingBackend(BackendId::R8))
    ));
}
