use std::cell::RefCell;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use dd_compile::{CompileError, CompileInput, CompilerInvoker, ToolchainConfig};
use dd_expect::{OutcomeResolver, Resolution, TestSpecification};
use dd_runtime::{RunError, RunRequest, RuntimeExecutor};
use dd_types::{CellAxes, CompilerUnderTest, ConfigurationError, RuntimeIdentity, RuntimeKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::judge::{FailureDetail, OutcomeJudge, RunOutcome, Verdict};
use crate::{HarnessError, MatrixReport};

/// One test evaluated at one point of the matrix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub test: String,
    pub axes: CellAxes,
}

impl Cell {
    #[must_use]
    pub fn new(test: impl Into<String>, axes: CellAxes) -> Self {
        Self {
            test: test.into(),
            axes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaseOutcome {
    Judged { verdict: Verdict },
    /// A configuration problem stopped the cell before it could be judged.
    Aborted { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    pub test: String,
    pub axes: CellAxes,
    pub outcome: CaseOutcome,
    /// Digest of the compiled artifact, when compilation succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub duration_ms: u64,
}

impl CaseResult {
    #[must_use]
    pub fn verdict(&self) -> Option<&Verdict> {
        match &self.outcome {
            CaseOutcome::Judged { verdict } => Some(verdict),
            CaseOutcome::Aborted { .. } => None,
        }
    }

    /// Unexpected failures and aborted cells.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.verdict().is_none_or(Verdict::is_unexpected)
    }
}

/// Whether a compiler's output can run on a runtime kind at all: class files
/// need the JVM and dex files need ART.
#[must_use]
pub fn is_runnable(compiler: CompilerUnderTest, runtime: RuntimeIdentity) -> bool {
    (compiler == CompilerUnderTest::R8Cf) == (runtime.kind == RuntimeKind::Jvm)
}

fn check_combination(axes: CellAxes) -> Result<(), ConfigurationError> {
    if is_runnable(axes.compiler, axes.runtime) {
        return Ok(());
    }
    let detail = if axes.runtime.kind == RuntimeKind::Jvm {
        "the JVM only runs class files"
    } else {
        "class files do not run on ART"
    };
    Err(ConfigurationError::UnsupportedCombination {
        compiler: axes.compiler,
        runtime: axes.runtime,
        detail: detail.to_owned(),
    })
}

struct Evaluation {
    verdict: Verdict,
    digest: Option<String>,
}

/// Runs cells end to end: resolve, compile, run, judge. Holds only shared
/// read-only state, so one runner serves every worker thread.
#[derive(Debug, Clone)]
pub struct CellRunner {
    resolver: OutcomeResolver,
    invoker: CompilerInvoker,
    executor: RuntimeExecutor,
    toolchain: ToolchainConfig,
    judge: OutcomeJudge,
    artifact_root: PathBuf,
}

impl CellRunner {
    #[must_use]
    pub fn new(
        resolver: OutcomeResolver,
        invoker: CompilerInvoker,
        executor: RuntimeExecutor,
        artifact_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            resolver,
            invoker,
            executor,
            toolchain: ToolchainConfig::default(),
            judge: OutcomeJudge::default(),
            artifact_root: artifact_root.into(),
        }
    }

    /// Source of the platform library each compilation links against.
    #[must_use]
    pub fn with_toolchain(mut self, toolchain: ToolchainConfig) -> Self {
        self.toolchain = toolchain;
        self
    }

    #[must_use]
    pub fn with_judge(mut self, judge: OutcomeJudge) -> Self {
        self.judge = judge;
        self
    }

    #[must_use]
    pub fn resolver(&self) -> &OutcomeResolver {
        &self.resolver
    }

    #[must_use]
    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    /// Evaluates one cell. Configuration problems surface as errors; every
    /// other failure becomes part of the verdict.
    pub fn run_cell(&self, test: &str, axes: CellAxes) -> Result<CaseResult, HarnessError> {
        let started = Instant::now();
        let evaluation = self.evaluate(test, axes)?;
        info!(
            test,
            cell = %axes,
            verdict = evaluation.verdict.label(),
            "cell judged"
        );
        if let Verdict::UnexpectedFailure(detail) = &evaluation.verdict {
            warn!(
                test,
                cell = %axes,
                step = detail.step.as_str(),
                correlation_id = ?detail.correlation_id,
                "{}",
                detail.message
            );
        }
        Ok(CaseResult {
            test: test.to_owned(),
            axes,
            outcome: CaseOutcome::Judged {
                verdict: evaluation.verdict,
            },
            digest: evaluation.digest,
            duration_ms: elapsed_ms(started),
        })
    }

    /// Evaluates `cells` on up to `parallelism` scoped threads. Results keep
    /// the order of `cells`; aborted cells are recorded, not propagated.
    #[must_use]
    pub fn run_matrix(&self, suite: &str, cells: &[Cell], parallelism: usize) -> MatrixReport {
        let workers = parallelism.clamp(1, cells.len().max(1));
        let next = AtomicUsize::new(0);
        let slots = Mutex::new(vec![None; cells.len()]);
        debug!(suite, cells = cells.len(), workers, "running matrix");

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        let Some(cell) = cells.get(index) else {
                            break;
                        };
                        let started = Instant::now();
                        let result = self.run_cell(&cell.test, cell.axes).unwrap_or_else(|err| {
                            warn!(
                                test = %cell.test,
                                cell = %cell.axes,
                                error = %err,
                                "cell aborted"
                            );
                            CaseResult {
                                test: cell.test.clone(),
                                axes: cell.axes,
                                outcome: CaseOutcome::Aborted {
                                    error: err.to_string(),
                                },
                                digest: None,
                                duration_ms: elapsed_ms(started),
                            }
                        });
                        slots.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(result);
                    }
                });
            }
        });

        let results = slots
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .flatten()
            .collect();
        MatrixReport::from_results(suite, results)
    }

    fn evaluate(&self, test: &str, axes: CellAxes) -> Result<Evaluation, HarnessError> {
        check_combination(axes)?;
        let spec = match self.resolver.resolve_axes(test, axes)? {
            Resolution::Resolved(spec) => spec,
            Resolution::Absent => {
                return Ok(Evaluation {
                    verdict: Verdict::Ignored(format!(
                        "{test} is not part of the corpus for {}",
                        axes.runtime
                    )),
                    digest: None,
                });
            }
        };
        if let Some(verdict) = self.judge.skipped(&spec) {
            return Ok(Evaluation {
                verdict,
                digest: None,
            });
        }

        let input = CompileInput {
            program: spec.fixture.collect_inputs(axes.toolchain)?,
            libraries: vec![self.toolchain.android_jar(spec.min_api)],
        };
        let result_dir = self.result_dir(&spec, axes);
        let compiled = match self
            .invoker
            .compile(axes.compiler, &input, axes.mode, &spec, &result_dir)
        {
            Ok(artifact) => Ok(artifact),
            Err(CompileError::Failure(failure)) => Err(failure),
            Err(other) => return Err(other.into()),
        };
        let digest = compiled.as_ref().ok().map(|artifact| artifact.digest.clone());

        let decided = self.judge.after_compile(&spec, compiled.as_ref().err());
        let artifact = match (compiled, decided) {
            (_, Some(verdict)) => return Ok(Evaluation { verdict, digest }),
            (Ok(artifact), None) => artifact,
            (Err(failure), None) => {
                return Ok(Evaluation {
                    verdict: Verdict::UnexpectedFailure(FailureDetail::compile(&failure)),
                    digest,
                });
            }
        };

        let run = self.execute(&self.run_request(&spec, artifact.files.clone(), axes.runtime))?;
        let expected = read_golden(&spec)?;

        let original_error = RefCell::new(None);
        let verdict = self.judge.after_run(&spec, &run, expected.as_deref(), || {
            let jar = spec.fixture.original_jar()?;
            debug!(test, jar = %jar.display(), "re-running the original input");
            match self.execute(&self.run_request(&spec, vec![jar], axes.runtime)) {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    *original_error.borrow_mut() = Some(err);
                    None
                }
            }
        });
        if let Some(err) = original_error.into_inner() {
            return Err(err);
        }
        Ok(Evaluation { verdict, digest })
    }

    fn result_dir(&self, spec: &TestSpecification, axes: CellAxes) -> PathBuf {
        self.artifact_root.join(&spec.name).join(format!(
            "{}-{}-{}-{}",
            axes.toolchain, axes.compiler, axes.runtime, axes.mode
        ))
    }

    fn run_request(
        &self,
        spec: &TestSpecification,
        classpath: Vec<PathBuf>,
        runtime: RuntimeIdentity,
    ) -> RunRequest {
        let request = RunRequest::new(classpath, spec.fixture.main_class.clone(), runtime);
        match &spec.native_library {
            Some(library) => request.with_native_library(
                library.clone(),
                spec.fixture.native_library_dir.clone(),
            ),
            None => request,
        }
    }

    /// Execution failures are run outcomes; configuration problems abort.
    fn execute(&self, request: &RunRequest) -> Result<RunOutcome, HarnessError> {
        match self.executor.run(request) {
            Ok(result) => Ok(Ok(result)),
            Err(RunError::Execution(failure)) => Ok(Err(failure)),
            Err(RunError::Configuration(err)) => Err(err.into()),
        }
    }
}

fn read_golden(spec: &TestSpecification) -> Result<Option<String>, HarnessError> {
    match fs::read_to_string(spec.fixture.expected_output()) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
