use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use dd_types::{ApiLevel, CellAxes};
use serde::{Deserialize, Serialize};

use crate::ExpectError;
use crate::condition::Condition;

/// Named outcome categories. A test belongs to a category for a cell when
/// any condition registered under its name matches that cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeCategory {
    /// Any compiler throwable is tolerated.
    CompileFails,
    /// The compiler must report a structured compilation error.
    CompileExpectedToFail,
    RunFails,
    RunExpectedToFail,
    RunTimesOut,
    RunIsFlaky,
    /// Output is known to disagree with the golden text.
    RunOutputDiffers,
    /// The unprocessed original fails on the runtime while the output runs.
    RunOriginalOnlyFails,
    OutputMayDiffer,
    RequiresDisabledInlining,
    RequiresDisabledClassInlining,
    HasMissingClasses,
    NoInputForToolchain,
    SkipEntirely,
    /// Needs a bespoke run script; only compilation is checked.
    CustomRun,
    UsesNativeAgent,
    FailuresToTriage,
}

impl OutcomeCategory {
    pub const ALL: [Self; 17] = [
        Self::CompileFails,
        Self::CompileExpectedToFail,
        Self::RunFails,
        Self::RunExpectedToFail,
        Self::RunTimesOut,
        Self::RunIsFlaky,
        Self::RunOutputDiffers,
        Self::RunOriginalOnlyFails,
        Self::OutputMayDiffer,
        Self::RequiresDisabledInlining,
        Self::RequiresDisabledClassInlining,
        Self::HasMissingClasses,
        Self::NoInputForToolchain,
        Self::SkipEntirely,
        Self::CustomRun,
        Self::UsesNativeAgent,
        Self::FailuresToTriage,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CompileFails => "compile_fails",
            Self::CompileExpectedToFail => "compile_expected_to_fail",
            Self::RunFails => "run_fails",
            Self::RunExpectedToFail => "run_expected_to_fail",
            Self::RunTimesOut => "run_times_out",
            Self::RunIsFlaky => "run_is_flaky",
            Self::RunOutputDiffers => "run_output_differs",
            Self::RunOriginalOnlyFails => "run_original_only_fails",
            Self::OutputMayDiffer => "output_may_differ",
            Self::RequiresDisabledInlining => "requires_disabled_inlining",
            Self::RequiresDisabledClassInlining => "requires_disabled_class_inlining",
            Self::HasMissingClasses => "has_missing_classes",
            Self::NoInputForToolchain => "no_input_for_toolchain",
            Self::SkipEntirely => "skip_entirely",
            Self::CustomRun => "custom_run",
            Self::UsesNativeAgent => "uses_native_agent",
            Self::FailuresToTriage => "failures_to_triage",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionTable {
    entries: BTreeMap<String, Vec<Condition>>,
}

impl ConditionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, test: impl Into<String>, condition: Condition) {
        self.entries.entry(test.into()).or_default().push(condition);
    }

    /// Open world: a name with nothing registered never applies.
    #[must_use]
    pub fn applies(&self, test: &str, axes: &CellAxes) -> bool {
        self.entries
            .get(test)
            .is_some_and(|conditions| conditions.iter().any(|c| c.evaluate(axes)))
    }

    #[must_use]
    pub fn conditions(&self, test: &str) -> &[Condition] {
        self.entries
            .get(test)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Every expectation table plus the per-test side data the resolver merges
/// in. Built once, then shared read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionCatalog {
    tables: BTreeMap<OutcomeCategory, ConditionTable>,
    non_default_run_failures: BTreeSet<String>,
    native_libraries: BTreeMap<String, String>,
    min_api: BTreeMap<String, ApiLevel>,
    keep_rules: BTreeMap<String, String>,
}

impl ConditionCatalog {
    #[must_use]
    pub fn builder() -> ConditionCatalogBuilder {
        ConditionCatalogBuilder::default()
    }

    pub fn from_yaml_str(body: &str) -> Result<Self, ExpectError> {
        let manifest: CatalogManifest = serde_yaml::from_str(body)?;
        let catalog = Self::from_manifest(manifest);
        catalog.validate_exclusive()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, ExpectError> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }

    #[must_use]
    pub fn from_manifest(manifest: CatalogManifest) -> Self {
        Self {
            tables: manifest
                .categories
                .into_iter()
                .filter(|(_, table)| !table.is_empty())
                .collect(),
            non_default_run_failures: manifest.non_default_run_failures,
            native_libraries: manifest.native_libraries,
            min_api: manifest.min_api,
            keep_rules: manifest.keep_rules,
        }
    }

    #[must_use]
    pub fn table(&self, category: OutcomeCategory) -> Option<&ConditionTable> {
        self.tables.get(&category)
    }

    #[must_use]
    pub fn applies(&self, category: OutcomeCategory, test: &str, axes: &CellAxes) -> bool {
        self.tables
            .get(&category)
            .is_some_and(|table| table.applies(test, axes))
    }

    #[must_use]
    pub fn fails_on_non_default_runtime(&self, test: &str) -> bool {
        self.non_default_run_failures.contains(test)
    }

    #[must_use]
    pub fn native_library(&self, test: &str) -> Option<&str> {
        self.native_libraries.get(test).map(String::as_str)
    }

    #[must_use]
    pub fn min_api(&self, test: &str) -> Option<ApiLevel> {
        self.min_api.get(test).copied()
    }

    #[must_use]
    pub fn keep_rules(&self, test: &str) -> Option<&str> {
        self.keep_rules.get(test).map(String::as_str)
    }

    /// Names mentioned anywhere in the catalog.
    #[must_use]
    pub fn mentioned_tests(&self) -> BTreeSet<&str> {
        self.tables
            .values()
            .flat_map(ConditionTable::names)
            .chain(self.non_default_run_failures.iter().map(String::as_str))
            .chain(self.native_libraries.keys().map(String::as_str))
            .chain(self.min_api.keys().map(String::as_str))
            .chain(self.keep_rules.keys().map(String::as_str))
            .collect()
    }

    /// A test may not be both expected to fail compilation and tolerated to
    /// crash in the same cell. The axis grid is finite, so every cell of
    /// every doubly-registered name is checked.
    pub fn validate_exclusive(&self) -> Result<(), ExpectError> {
        let (Some(expected), Some(tolerated)) = (
            self.tables.get(&OutcomeCategory::CompileExpectedToFail),
            self.tables.get(&OutcomeCategory::CompileFails),
        ) else {
            return Ok(());
        };

        for test in expected.names() {
            if tolerated.conditions(test).is_empty() {
                continue;
            }
            if let Some(axes) = CellAxes::grid()
                .find(|axes| expected.applies(test, axes) && tolerated.applies(test, axes))
            {
                return Err(ExpectError::Configuration(
                    dd_types::ConfigurationError::ConflictingCompileExpectations {
                        test: test.to_owned(),
                        axes,
                    },
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConditionCatalogBuilder {
    manifest: CatalogManifest,
}

impl ConditionCatalogBuilder {
    #[must_use]
    pub fn condition(
        mut self,
        category: OutcomeCategory,
        test: impl Into<String>,
        condition: Condition,
    ) -> Self {
        self.manifest
            .categories
            .entry(category)
            .or_default()
            .register(test, condition);
        self
    }

    #[must_use]
    pub fn non_default_run_failure(mut self, test: impl Into<String>) -> Self {
        self.manifest.non_default_run_failures.insert(test.into());
        self
    }

    #[must_use]
    pub fn native_library(mut self, test: impl Into<String>, library: impl Into<String>) -> Self {
        self.manifest
            .native_libraries
            .insert(test.into(), library.into());
        self
    }

    #[must_use]
    pub fn min_api(mut self, test: impl Into<String>, level: ApiLevel) -> Self {
        self.manifest.min_api.insert(test.into(), level);
        self
    }

    #[must_use]
    pub fn keep_rules(mut self, test: impl Into<String>, rules: impl Into<String>) -> Self {
        self.manifest.keep_rules.insert(test.into(), rules.into());
        self
    }

    /// Unchecked; call [`ConditionCatalog::validate_exclusive`] or use
    /// [`Self::build_checked`] when the tables come from untrusted input.
    #[must_use]
    pub fn build(self) -> ConditionCatalog {
        ConditionCatalog::from_manifest(self.manifest)
    }

    pub fn build_checked(self) -> Result<ConditionCatalog, ExpectError> {
        let catalog = self.build();
        catalog.validate_exclusive()?;
        Ok(catalog)
    }
}

/// On-disk layout of the expectation catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogManifest {
    #[serde(default)]
    pub categories: BTreeMap<OutcomeCategory, ConditionTable>,
    #[serde(default)]
    pub non_default_run_failures: BTreeSet<String>,
    #[serde(default)]
    pub native_libraries: BTreeMap<String, String>,
    #[serde(default)]
    pub min_api: BTreeMap<String, ApiLevel>,
    #[serde(default)]
    pub keep_rules: BTreeMap<String, String>,
}
