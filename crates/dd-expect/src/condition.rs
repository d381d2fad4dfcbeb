use std::collections::BTreeSet;
use std::ops::Not;

use dd_types::{
    CellAxes, CompilationMode, CompilerUnderTest, InputToolchain, RuntimeKind, RuntimeVersion,
};
use serde::{Deserialize, Serialize};

use crate::ExpectError;

/// Stateless predicate over a matrix cell.
///
/// Conditions are plain values: build them once, share them between any
/// number of test names and evaluate them from any thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ConditionRepr", into = "ConditionRepr")]
pub enum Condition {
    Always,
    Never,
    Toolchains(BTreeSet<InputToolchain>),
    Compilers(BTreeSet<CompilerUnderTest>),
    Runtimes(BTreeSet<RuntimeVersion>),
    /// Inclusive on both ends; an open end is unbounded.
    RuntimeRange {
        low: Option<RuntimeVersion>,
        high: Option<RuntimeVersion>,
    },
    Kinds(BTreeSet<RuntimeKind>),
    Modes(BTreeSet<CompilationMode>),
    All(Vec<Condition>),
    AnyOf(Vec<Condition>),
    Negate(Box<Condition>),
}

impl Condition {
    #[must_use]
    pub fn any() -> Self {
        Self::Always
    }

    #[must_use]
    pub fn never() -> Self {
        Self::Never
    }

    #[must_use]
    pub fn toolchains(values: impl IntoIterator<Item = InputToolchain>) -> Self {
        Self::Toolchains(values.into_iter().collect())
    }

    #[must_use]
    pub fn compilers(values: impl IntoIterator<Item = CompilerUnderTest>) -> Self {
        Self::Compilers(values.into_iter().collect())
    }

    #[must_use]
    pub fn runtimes(values: impl IntoIterator<Item = RuntimeVersion>) -> Self {
        Self::Runtimes(values.into_iter().collect())
    }

    #[must_use]
    pub fn runtimes_up_to(high: RuntimeVersion) -> Self {
        Self::RuntimeRange {
            low: None,
            high: Some(high),
        }
    }

    #[must_use]
    pub fn runtimes_from(low: RuntimeVersion) -> Self {
        Self::RuntimeRange {
            low: Some(low),
            high: None,
        }
    }

    #[must_use]
    pub fn runtimes_between(low: RuntimeVersion, high: RuntimeVersion) -> Self {
        Self::RuntimeRange {
            low: Some(low),
            high: Some(high),
        }
    }

    #[must_use]
    pub fn kinds(values: impl IntoIterator<Item = RuntimeKind>) -> Self {
        Self::Kinds(values.into_iter().collect())
    }

    #[must_use]
    pub fn modes(values: impl IntoIterator<Item = CompilationMode>) -> Self {
        Self::Modes(values.into_iter().collect())
    }

    /// Conjunction of every part; an empty list matches everything.
    #[must_use]
    pub fn matching(parts: impl IntoIterator<Item = Condition>) -> Self {
        let mut parts = parts.into_iter().collect::<Vec<_>>();
        match parts.len() {
            0 => Self::Always,
            1 => parts.remove(0),
            _ => Self::All(parts),
        }
    }

    #[must_use]
    pub fn and(self, other: Condition) -> Self {
        match self {
            Self::All(mut parts) => {
                parts.push(other);
                Self::All(parts)
            }
            first => Self::All(vec![first, other]),
        }
    }

    #[must_use]
    pub fn or(self, other: Condition) -> Self {
        match self {
            Self::AnyOf(mut parts) => {
                parts.push(other);
                Self::AnyOf(parts)
            }
            first => Self::AnyOf(vec![first, other]),
        }
    }

    #[must_use]
    pub fn evaluate(&self, axes: &CellAxes) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Toolchains(set) => set.contains(&axes.toolchain),
            Self::Compilers(set) => set.contains(&axes.compiler),
            Self::Runtimes(set) => set.contains(&axes.runtime.version),
            Self::RuntimeRange { low, high } => {
                let version = axes.runtime.version;
                match (*low, *high) {
                    (Some(low), Some(high)) => version.is_in_range_inclusive(low, high),
                    (Some(low), None) => low.is_older_than_or_equal(version),
                    (None, Some(high)) => version.is_older_than_or_equal(high),
                    (None, None) => true,
                }
            }
            Self::Kinds(set) => set.contains(&axes.runtime.kind),
            Self::Modes(set) => set.contains(&axes.mode),
            Self::All(parts) => parts.iter().all(|part| part.evaluate(axes)),
            Self::AnyOf(parts) => parts.iter().any(|part| part.evaluate(axes)),
            Self::Negate(inner) => !inner.evaluate(axes),
        }
    }
}

impl Not for Condition {
    type Output = Condition;

    fn not(self) -> Self::Output {
        match self {
            Self::Always => Self::Never,
            Self::Never => Self::Always,
            Self::Negate(inner) => *inner,
            other => Self::Negate(Box::new(other)),
        }
    }
}

/// Manifest form. A bare keyword (`any`, `never`) or a map whose keys are
/// all required to hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[doc(hidden)]
#[serde(untagged)]
pub enum ConditionRepr {
    Keyword(String),
    Spec(Box<ConditionSpec>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[doc(hidden)]
#[serde(deny_unknown_fields)]
pub struct ConditionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    toolchains: Option<Vec<InputToolchain>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compilers: Option<Vec<CompilerUnderTest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    runtimes: Option<Vec<RuntimeVersion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    runtimes_from: Option<RuntimeVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    runtimes_up_to: Option<RuntimeVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kinds: Option<Vec<RuntimeKind>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modes: Option<Vec<CompilationMode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    all_of: Option<Vec<ConditionRepr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    any_of: Option<Vec<ConditionRepr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    not: Option<Box<ConditionRepr>>,
}

impl TryFrom<ConditionRepr> for Condition {
    type Error = ExpectError;

    fn try_from(repr: ConditionRepr) -> Result<Self, Self::Error> {
        match repr {
            ConditionRepr::Keyword(word) => match word.as_str() {
                "any" => Ok(Self::Always),
                "never" => Ok(Self::Never),
                other => Err(ExpectError::InvalidCondition(format!(
                    "unknown condition keyword {other:?}; expected any or never"
                ))),
            },
            ConditionRepr::Spec(spec) => Self::try_from(*spec),
        }
    }
}

impl TryFrom<ConditionSpec> for Condition {
    type Error = ExpectError;

    fn try_from(spec: ConditionSpec) -> Result<Self, Self::Error> {
        if let (Some(low), Some(high)) = (spec.runtimes_from, spec.runtimes_up_to)
            && low > high
        {
            return Err(ExpectError::InvalidCondition(format!(
                "empty runtime range: from {low} up to {high}"
            )));
        }

        let mut parts = Vec::new();
        if let Some(values) = spec.toolchains {
            parts.push(Self::toolchains(values));
        }
        if let Some(values) = spec.compilers {
            parts.push(Self::compilers(values));
        }
        if let Some(values) = spec.runtimes {
            parts.push(Self::runtimes(values));
        }
        if spec.runtimes_from.is_some() || spec.runtimes_up_to.is_some() {
            parts.push(Self::RuntimeRange {
                low: spec.runtimes_from,
                high: spec.runtimes_up_to,
            });
        }
        if let Some(values) = spec.kinds {
            parts.push(Self::kinds(values));
        }
        if let Some(values) = spec.modes {
            parts.push(Self::modes(values));
        }
        if let Some(children) = spec.all_of {
            parts.push(Self::All(
                children
                    .into_iter()
                    .map(Self::try_from)
                    .collect::<Result<_, _>>()?,
            ));
        }
        if let Some(children) = spec.any_of {
            parts.push(Self::AnyOf(
                children
                    .into_iter()
                    .map(Self::try_from)
                    .collect::<Result<_, _>>()?,
            ));
        }
        if let Some(inner) = spec.not {
            parts.push(Self::Negate(Box::new(Self::try_from(*inner)?)));
        }
        Ok(Self::matching(parts))
    }
}

impl From<Condition> for ConditionRepr {
    fn from(condition: Condition) -> Self {
        let mut spec = ConditionSpec::default();
        match condition {
            Condition::Always => return Self::Keyword("any".to_owned()),
            Condition::Never => return Self::Keyword("never".to_owned()),
            Condition::Toolchains(set) => spec.toolchains = Some(set.into_iter().collect()),
            Condition::Compilers(set) => spec.compilers = Some(set.into_iter().collect()),
            Condition::Runtimes(set) => spec.runtimes = Some(set.into_iter().collect()),
            Condition::RuntimeRange { low, high } => {
                spec.runtimes_from = low;
                spec.runtimes_up_to = high;
            }
            Condition::Kinds(set) => spec.kinds = Some(set.into_iter().collect()),
            Condition::Modes(set) => spec.modes = Some(set.into_iter().collect()),
            Condition::All(parts) => {
                spec.all_of = Some(parts.into_iter().map(Self::from).collect());
            }
            Condition::AnyOf(parts) => {
                spec.any_of = Some(parts.into_iter().map(Self::from).collect());
            }
            Condition::Negate(inner) => spec.not = Some(Box::new(Self::from(*inner))),
        }
        Self::Spec(Box::new(spec))
    }
}

#[cfg(test)]
mod tests {
    use dd_types::{
        CellAxes, CompilationMode, CompilerUnderTest, InputToolchain, RuntimeIdentity,
        RuntimeVersion,
    };

    use super::Condition;

    fn axes(
        compiler: CompilerUnderTest,
        version: RuntimeVersion,
        mode: CompilationMode,
    ) -> CellAxes {
        CellAxes::new(
            InputToolchain::ExternalDexer,
            compiler,
            RuntimeIdentity::host(version),
            mode,
        )
    }

    #[test]
    fn up_to_range_is_inclusive() {
        let condition = Condition::runtimes_up_to(RuntimeVersion::V4_4_4);
        let d8 = CompilerUnderTest::D8;
        let debug = CompilationMode::Debug;
        assert!(condition.evaluate(&axes(d8, RuntimeVersion::V4_0_4, debug)));
        assert!(condition.evaluate(&axes(d8, RuntimeVersion::V4_4_4, debug)));
        assert!(!condition.evaluate(&axes(d8, RuntimeVersion::V5_1_1, debug)));
    }

    #[test]
    fn bounded_and_open_ranges_include_both_ends() {
        let d8 = CompilerUnderTest::D8;
        let debug = CompilationMode::Debug;
        let between = Condition::runtimes_between(RuntimeVersion::V5_1_1, RuntimeVersion::V7_0_0);
        assert!(between.evaluate(&axes(d8, RuntimeVersion::V5_1_1, debug)));
        assert!(between.evaluate(&axes(d8, RuntimeVersion::V7_0_0, debug)));
        assert!(!between.evaluate(&axes(d8, RuntimeVersion::V4_4_4, debug)));
        assert!(!between.evaluate(&axes(d8, RuntimeVersion::V8_1_0, debug)));

        let from = Condition::runtimes_from(RuntimeVersion::V8_1_0);
        assert!(from.evaluate(&axes(d8, RuntimeVersion::V8_1_0, debug)));
        assert!(from.evaluate(&axes(d8, RuntimeVersion::Master, debug)));
        assert!(!from.evaluate(&axes(d8, RuntimeVersion::V7_0_0, debug)));
    }

    #[test]
    fn conjunction_requires_every_axis() {
        let condition = Condition::compilers([CompilerUnderTest::R8])
            .and(Condition::modes([CompilationMode::Release]));
        let default = RuntimeVersion::Default;
        let (r8, d8) = (CompilerUnderTest::R8, CompilerUnderTest::D8);
        assert!(condition.evaluate(&axes(r8, default, CompilationMode::Release)));
        assert!(!condition.evaluate(&axes(r8, default, CompilationMode::Debug)));
        assert!(!condition.evaluate(&axes(d8, default, CompilationMode::Release)));
    }

    #[test]
    fn negation_of_negation_unwraps() {
        let condition = Condition::runtimes([RuntimeVersion::V6_0_1]);
        assert_eq!(!!condition.clone(), condition);
        assert_eq!(!Condition::any(), Condition::never());
    }

    #[test]
    fn manifest_keywords_and_maps_parse() {
        let yaml = r#"
- any
- compilers: [d8]
  runtimes: ["7.0.0", "6.0.1", "5.1.1"]
- runtimes_up_to: "4.4.4"
- any_of:
    - modes: [release]
    - not:
        kinds: [target]
"#;
        let conditions: Vec<Condition> = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(conditions[0], Condition::any());
        assert_eq!(
            conditions[1],
            Condition::compilers([CompilerUnderTest::D8]).and(Condition::runtimes([
                RuntimeVersion::V5_1_1,
                RuntimeVersion::V6_0_1,
                RuntimeVersion::V7_0_0,
            ]))
        );
        assert_eq!(conditions[2], Condition::runtimes_up_to(RuntimeVersion::V4_4_4));
        assert!(matches!(conditions[3], Condition::AnyOf(_)));
    }

    #[test]
    fn unknown_keyword_and_empty_range_are_rejected() {
        let err = serde_yaml::from_str::<Condition>("sometimes").expect_err("bad keyword");
        assert!(err.to_string().contains("unknown condition keyword"));

        let yaml = "{runtimes_from: \"9.0.0\", runtimes_up_to: \"5.1.1\"}";
        let err = serde_yaml::from_str::<Condition>(yaml).expect_err("empty range");
        assert!(err.to_string().contains("empty runtime range"));
    }
}
