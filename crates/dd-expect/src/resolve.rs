use std::sync::Arc;

use dd_types::{
    ApiLevel, CellAxes, CompilationMode, CompilerUnderTest, ConfigurationError, InputToolchain,
    RuntimeIdentity,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::{FixtureDescriptor, FixtureRegistry};
use crate::table::{ConditionCatalog, OutcomeCategory};

/// Options handed to the compiler backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    pub mode: Option<CompilationMode>,
    pub disable_inlining: bool,
    pub disable_class_inlining: bool,
    pub ignore_missing_classes: bool,
    pub min_api: Option<ApiLevel>,
    pub keep_rules: Option<String>,
}

/// Merged, immutable expectations for one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpecification {
    pub name: String,
    pub fixture: FixtureDescriptor,
    pub axes: CellAxes,
    pub skip_test: bool,
    pub skip_reason: Option<String>,
    pub skip_run: bool,
    pub expected_to_fail_compile: bool,
    pub fails_compile: bool,
    pub fails_run: bool,
    pub output_may_differ: bool,
    pub fails_run_output: bool,
    pub fails_run_original_only: bool,
    pub native_library: Option<String>,
    pub disable_inlining: bool,
    pub disable_class_inlining: bool,
    pub has_missing_classes: bool,
    pub keep_rules: Option<String>,
    pub min_api: Option<ApiLevel>,
}

impl TestSpecification {
    /// Options for compiling this test in `mode`. Every stage of a chained
    /// pipeline receives the same options.
    #[must_use]
    pub fn compile_options(&self, mode: CompilationMode) -> CompileOptions {
        CompileOptions {
            mode: Some(mode),
            disable_inlining: self.disable_inlining,
            disable_class_inlining: self.disable_class_inlining,
            ignore_missing_classes: self.has_missing_classes,
            min_api: self.min_api,
            keep_rules: self.keep_rules.clone(),
        }
    }

    /// True when no tolerance flag is set, so the cell must compile, run and
    /// print the golden text exactly.
    #[must_use]
    pub fn is_strict(&self) -> bool {
        !(self.skip_test
            || self.skip_run
            || self.expected_to_fail_compile
            || self.fails_compile
            || self.fails_run
            || self.output_may_differ
            || self.fails_run_output
            || self.fails_run_original_only)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(Box<TestSpecification>),
    /// The fixture does not exist in the corpus snapshot for this runtime.
    Absent,
}

impl Resolution {
    #[must_use]
    pub fn specification(&self) -> Option<&TestSpecification> {
        match self {
            Self::Resolved(spec) => Some(spec),
            Self::Absent => None,
        }
    }
}

/// Turns a test name and a matrix cell into a [`TestSpecification`]. Holds
/// only shared read-only tables, so one resolver serves every worker.
#[derive(Debug, Clone)]
pub struct OutcomeResolver {
    catalog: Arc<ConditionCatalog>,
    registry: Arc<FixtureRegistry>,
}

impl OutcomeResolver {
    #[must_use]
    pub fn new(catalog: Arc<ConditionCatalog>, registry: Arc<FixtureRegistry>) -> Self {
        Self { catalog, registry }
    }

    #[must_use]
    pub fn catalog(&self) -> &ConditionCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn registry(&self) -> &FixtureRegistry {
        &self.registry
    }

    pub fn resolve(
        &self,
        test: &str,
        toolchain: InputToolchain,
        compiler: CompilerUnderTest,
        runtime: RuntimeIdentity,
        mode: CompilationMode,
    ) -> Result<Resolution, ConfigurationError> {
        self.resolve_axes(test, CellAxes::new(toolchain, compiler, runtime, mode))
    }

    pub fn resolve_axes(
        &self,
        test: &str,
        axes: CellAxes,
    ) -> Result<Resolution, ConfigurationError> {
        let Some(fixture) = self
            .registry
            .lookup(test, axes.toolchain, axes.runtime.version)
        else {
            if axes.runtime.version.is_default() {
                return Err(ConfigurationError::UnknownTest {
                    test: test.to_owned(),
                    toolchain: axes.toolchain,
                });
            }
            debug!(test, runtime = %axes.runtime, "fixture absent for runtime snapshot");
            return Ok(Resolution::Absent);
        };

        let applies = |category| self.catalog.applies(category, test, &axes);

        let expected_to_fail_compile = applies(OutcomeCategory::CompileExpectedToFail);
        let fails_compile = applies(OutcomeCategory::CompileFails);
        if expected_to_fail_compile && fails_compile {
            return Err(ConfigurationError::ConflictingCompileExpectations {
                test: test.to_owned(),
                axes,
            });
        }

        let skip_reason = if applies(OutcomeCategory::NoInputForToolchain) {
            Some(format!("no input available for toolchain {}", axes.toolchain))
        } else if applies(OutcomeCategory::SkipEntirely) {
            Some("skipped entirely".to_owned())
        } else if applies(OutcomeCategory::UsesNativeAgent) {
            Some("uses a native agent".to_owned())
        } else if applies(OutcomeCategory::FailuresToTriage) {
            Some("failure awaiting triage".to_owned())
        } else if axes.toolchain == InputToolchain::LegacyDexer && axes.runtime.version.is_dalvik()
        {
            Some(format!(
                "{} inputs are not run on dalvik {}",
                axes.toolchain, axes.runtime.version
            ))
        } else {
            None
        };

        let non_default_failure = !axes.runtime.version.is_default()
            && self.catalog.fails_on_non_default_runtime(test);

        let spec = TestSpecification {
            name: test.to_owned(),
            fixture,
            axes,
            skip_test: skip_reason.is_some(),
            skip_reason,
            skip_run: applies(OutcomeCategory::RunTimesOut)
                || applies(OutcomeCategory::RunIsFlaky)
                || applies(OutcomeCategory::CustomRun),
            expected_to_fail_compile,
            fails_compile,
            fails_run: applies(OutcomeCategory::RunFails)
                || applies(OutcomeCategory::RunExpectedToFail)
                || non_default_failure,
            output_may_differ: applies(OutcomeCategory::OutputMayDiffer),
            fails_run_output: applies(OutcomeCategory::RunOutputDiffers),
            fails_run_original_only: applies(OutcomeCategory::RunOriginalOnlyFails),
            native_library: self.catalog.native_library(test).map(str::to_owned),
            disable_inlining: applies(OutcomeCategory::RequiresDisabledInlining),
            disable_class_inlining: applies(OutcomeCategory::RequiresDisabledClassInlining),
            has_missing_classes: applies(OutcomeCategory::HasMissingClasses),
            keep_rules: self.catalog.keep_rules(test).map(str::to_owned),
            min_api: self.catalog.min_api(test),
        };
        Ok(Resolution::Resolved(Box::new(spec)))
    }
}
