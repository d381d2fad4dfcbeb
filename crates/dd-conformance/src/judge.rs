use std::fmt;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use dd_expect::TestSpecification;
use dd_runtime::run_with_timeout;
use dd_types::{CompilationFailure, CompilationFailureKind, ExecutionFailure, ExecutionResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// What one run of a program produced, or why it produced nothing.
pub type RunOutcome = Result<ExecutionResult, ExecutionFailure>;

/// Step of a cell an unexpected failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Compile,
    Run,
    /// Re-run of the unprocessed input used as a baseline.
    OriginalRun,
    Check,
    Compare,
}

impl Step {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::Run => "run",
            Self::OriginalRun => "original run",
            Self::Check => "check",
            Self::Compare => "compare",
        }
    }
}

/// Enough context to reproduce an unexpected failure by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub step: Step,
    pub message: String,
    /// Raw tool output: compiler diagnostics, program stderr or the texts
    /// that were compared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Device scratch directory id for device runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl FailureDetail {
    #[must_use]
    pub fn new(step: Step, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            output: None,
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    #[must_use]
    pub fn compile(failure: &CompilationFailure) -> Self {
        Self::new(
            Step::Compile,
            format!("{} failed to compile the input", failure.stage),
        )
        .with_output(failure.message.clone())
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step.as_str(), self.message)?;
        if let Some(id) = &self.correlation_id {
            write!(f, " (session {id})")?;
        }
        if let Some(output) = &self.output {
            write!(f, "\n{output}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    /// A failure the expectations tolerate.
    ExpectedFailure(String),
    UnexpectedFailure(FailureDetail),
    Ignored(String),
}

impl Verdict {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::ExpectedFailure(_) => "expected_failure",
            Self::UnexpectedFailure(_) => "unexpected_failure",
            Self::Ignored(_) => "ignored",
        }
    }

    #[must_use]
    pub fn is_unexpected(&self) -> bool {
        matches!(self, Self::UnexpectedFailure(_))
    }

    fn unexpected(detail: FailureDetail) -> Self {
        Self::UnexpectedFailure(detail)
    }
}

/// Everything observed for one cell, for judging in one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub compile_failure: Option<CompilationFailure>,
    /// `None` when the run step never happened.
    pub run: Option<RunOutcome>,
    pub expected_output: Option<String>,
}

/// Renders a cell's verdict from its expectations and what compiling and
/// running produced. The checks happen in a fixed order and the first one
/// that decides the cell wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeJudge {
    check_timeout: Option<Duration>,
}

impl Default for OutcomeJudge {
    fn default() -> Self {
        Self {
            check_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl OutcomeJudge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound on the fixture's own `check` executable.
    #[must_use]
    pub fn with_check_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn judge<F>(
        &self,
        spec: &TestSpecification,
        observation: &Observation,
        rerun_original: F,
    ) -> Verdict
    where
        F: FnOnce() -> Option<RunOutcome>,
    {
        if let Some(verdict) = self.after_compile(spec, observation.compile_failure.as_ref()) {
            return verdict;
        }
        match &observation.run {
            Some(run) => self.after_run(
                spec,
                run,
                observation.expected_output.as_deref(),
                rerun_original,
            ),
            None => Verdict::unexpected(FailureDetail::new(Step::Run, "the program was never run")),
        }
    }

    #[must_use]
    pub fn skipped(&self, spec: &TestSpecification) -> Option<Verdict> {
        spec.skip_test.then(|| {
            Verdict::Ignored(
                spec.skip_reason
                    .clone()
                    .unwrap_or_else(|| "skipped".to_owned()),
            )
        })
    }

    /// Decides the cell from the compile step alone, or returns `None` when
    /// the program still has to run.
    #[must_use]
    pub fn after_compile(
        &self,
        spec: &TestSpecification,
        failure: Option<&CompilationFailure>,
    ) -> Option<Verdict> {
        if let Some(verdict) = self.skipped(spec) {
            return Some(verdict);
        }

        if spec.expected_to_fail_compile {
            return Some(match failure {
                None => Verdict::unexpected(FailureDetail::new(
                    Step::Compile,
                    "should have failed with a compilation error but did not",
                )),
                Some(failure) => match &failure.kind {
                    CompilationFailureKind::Diagnosable { tag } => Verdict::ExpectedFailure(
                        format!("{} rejected the input: {tag}", failure.stage),
                    ),
                    CompilationFailureKind::Crash => Verdict::unexpected(
                        FailureDetail::new(
                            Step::Compile,
                            format!(
                                "{} crashed instead of reporting a compilation error",
                                failure.stage
                            ),
                        )
                        .with_output(failure.message.clone()),
                    ),
                },
            });
        }

        if spec.fails_compile {
            return Some(match failure {
                Some(failure) => {
                    Verdict::ExpectedFailure(format!("{} failed as tolerated", failure.stage))
                }
                None => Verdict::unexpected(FailureDetail::new(
                    Step::Compile,
                    "should have failed compilation but did not",
                )),
            });
        }

        if let Some(failure) = failure {
            return Some(Verdict::unexpected(FailureDetail::compile(failure)));
        }

        spec.skip_run.then_some(Verdict::Passed)
    }

    /// Judges a completed run. `rerun_original` runs the unprocessed input
    /// and is only called when the output disagrees with the golden text;
    /// it returns `None` when there is no original to run.
    pub fn after_run<F>(
        &self,
        spec: &TestSpecification,
        run: &RunOutcome,
        expected: Option<&str>,
        rerun_original: F,
    ) -> Verdict
    where
        F: FnOnce() -> Option<RunOutcome>,
    {
        if spec.fails_run {
            return if run_failed(run) {
                Verdict::ExpectedFailure("run failed as tolerated".to_owned())
            } else {
                let stdout = run.as_ref().map(|result| result.stdout.clone()).unwrap_or_default();
                Verdict::unexpected(
                    FailureDetail::new(Step::Run, "should have failed the run but did not")
                        .with_output(stdout),
                )
            };
        }

        let result = match run {
            Ok(result) if result.is_success() => result,
            Ok(result) => {
                return Verdict::unexpected(
                    FailureDetail::new(
                        Step::Run,
                        format!("`{}` exited with status {}", result.command, result.exit_code),
                    )
                    .with_output(format!("{}{}", result.stdout, result.stderr))
                    .with_correlation_id(result.correlation_id.clone()),
                );
            }
            Err(failure) => {
                return Verdict::unexpected(
                    FailureDetail::new(Step::Run, failure.message.clone())
                        .with_correlation_id(failure.correlation_id.clone()),
                );
            }
        };
        let actual = result.stdout.as_str();

        let Some(expected) = expected else {
            return Verdict::unexpected(
                FailureDetail::new(Step::Compare, "no golden output to compare against")
                    .with_output(actual.to_owned()),
            );
        };

        if let Some(check) = spec.fixture.custom_check() {
            return match self.run_check(&check, expected, actual) {
                Ok(true) => Verdict::Passed,
                Ok(false) if spec.fails_run_output => Verdict::ExpectedFailure(
                    "check script rejected the output as tolerated".to_owned(),
                ),
                Ok(false) => Verdict::unexpected(
                    FailureDetail::new(Step::Check, "check script rejected the output")
                        .with_output(actual.to_owned())
                        .with_correlation_id(result.correlation_id.clone()),
                ),
                Err(err) => Verdict::unexpected(FailureDetail::new(
                    Step::Check,
                    format!("cannot run {}: {err}", check.display()),
                )),
            };
        }

        let mut baseline = expected.to_owned();
        if actual != baseline {
            if let Some(original) = rerun_original() {
                if run_failed(&original) {
                    if spec.fails_run_original_only {
                        return Verdict::ExpectedFailure(
                            "the original input fails on this runtime".to_owned(),
                        );
                    }
                    let detail = FailureDetail::new(Step::OriginalRun, "the original input failed");
                    return Verdict::unexpected(match original {
                        Ok(original) => detail
                            .with_output(format!("{}{}", original.stdout, original.stderr))
                            .with_correlation_id(original.correlation_id),
                        Err(failure) => detail
                            .with_output(failure.message)
                            .with_correlation_id(failure.correlation_id),
                    });
                }
                if let Ok(original) = original {
                    baseline = original.stdout;
                }
            }
        }

        if spec.output_may_differ {
            return Verdict::Passed;
        }

        if spec.fails_run_output {
            if actual == baseline {
                warn!(
                    test = %spec.name,
                    cell = %spec.axes,
                    "output matches although a mismatch is tolerated"
                );
                return Verdict::Passed;
            }
            return Verdict::ExpectedFailure(
                "output differs from the golden text as tolerated".to_owned(),
            );
        }

        if actual == baseline {
            Verdict::Passed
        } else {
            Verdict::unexpected(
                FailureDetail::new(Step::Compare, "output differs from the expected text")
                    .with_output(format!("--- expected\n{baseline}--- actual\n{actual}"))
                    .with_correlation_id(result.correlation_id.clone()),
            )
        }
    }

    /// Runs `check <expected-file> <actual-file>`; a zero exit accepts.
    fn run_check(&self, check: &Path, expected: &str, actual: &str) -> std::io::Result<bool> {
        let scratch = tempfile::Builder::new().prefix("dd-check").tempdir()?;
        let expected_file = scratch.path().join("expected.txt");
        let actual_file = scratch.path().join("actual.txt");
        fs::write(&expected_file, expected)?;
        fs::write(&actual_file, actual)?;

        let mut command = Command::new(check);
        command.arg(&expected_file).arg(&actual_file);
        let output = run_with_timeout(&mut command, self.check_timeout)
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        Ok(output.is_success() && !output.timed_out)
    }
}

fn run_failed(run: &RunOutcome) -> bool {
    !run.as_ref().is_ok_and(ExecutionResult::is_success)
}
