#![forbid(unsafe_code)]

//! Facade over the dexdiff crates. Most callers only need
//! [`HarnessConfig`], [`SuiteOptions`] and [`run_suite`]; the component
//! crates are re-exported whole for finer control.

pub use dd_compile as compile;
pub use dd_conformance as conformance;
pub use dd_expect as expect;
pub use dd_runtime as runtime;
pub use dd_types as types;

pub use dd_compile::{Artifact, CompileError, CompileInput, CompilerInvoker, ToolchainConfig};
pub use dd_conformance::{
    CaseOutcome, CaseResult, Cell, CellRunner, HarnessConfig, HarnessError, HarnessSettings,
    MatrixReport, OutcomeJudge, SuiteOptions, Verdict, append_history, enforce_green, run_suite,
    write_report,
};
pub use dd_expect::{
    Condition, ConditionCatalog, FixtureRegistry, OutcomeCategory, OutcomeResolver, Resolution,
    TestSpecification,
};
pub use dd_runtime::{
    AdbTransport, DeviceConfig, DeviceProtocol, ExecutorConfig, RunRequest, RuntimeExecutor,
};
pub use dd_types::{
    CellAxes, CompilationFailure, CompilationMode, CompilerUnderTest, ConfigurationError,
    ExecutionFailure, ExecutionResult, InputToolchain, RuntimeIdentity, RuntimeKind,
    RuntimeVersion,
};

#[cfg(test)]
mod tests {
    use super::{CellAxes, CompilationMode, CompilerUnderTest, InputToolchain, RuntimeIdentity};

    #[test]
    fn facade_reexports_resolve_to_the_component_crates() {
        let axes = CellAxes::new(
            InputToolchain::NoPreprocessing,
            CompilerUnderTest::R8Cf,
            RuntimeIdentity::jvm(),
            CompilationMode::Release,
        );
        assert!(crate::conformance::is_runnable(axes.compiler, axes.runtime));
        assert_eq!(axes.to_string(), "none/r8_cf/jvm-default/release");
    }
}
