#![forbid(unsafe_code)]

//! Differential conformance harness. Each cell of the test matrix is
//! resolved against the expectation catalog, compiled by the compiler under
//! test, run on a runtime and judged against its golden output.

pub mod cell;
pub mod judge;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dd_compile::{CompileError, CompilerInvoker, ToolchainConfig};
use dd_expect::{ConditionCatalog, ExpectError, FixtureRegistry, OutcomeResolver};
use dd_runtime::{AdbTransport, DeviceConfig, DeviceProtocol, ExecutorConfig, RuntimeExecutor};
use dd_types::{
    CompilationMode, CompilerUnderTest, ConfigurationError, InputToolchain, RuntimeIdentity,
    RuntimeVersion,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

pub use cell::{CaseOutcome, CaseResult, Cell, CellRunner, is_runnable};
pub use judge::{FailureDetail, Observation, OutcomeJudge, RunOutcome, Step, Verdict};

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub repo_root: PathBuf,
    /// Root of the fixture corpus; holds `manifest.yaml`,
    /// `expectations.yaml` and the snapshot directories.
    pub fixture_root: PathBuf,
    pub artifact_root: PathBuf,
    pub parallelism: usize,
    pub toolchain: ToolchainConfig,
    pub executor: ExecutorConfig,
    /// Device runs are enabled when set.
    pub device: Option<DeviceConfig>,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        let toolchain = ToolchainConfig::default()
            .with_compiler_jar(repo_root.join("build/libs/r8.jar"))
            .with_android_jar_dir(repo_root.join("third_party/android_jar"));
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            artifact_root: repo_root.join("artifacts/conformance"),
            parallelism: std::thread::available_parallelism().map_or(1, usize::from),
            toolchain,
            executor: ExecutorConfig::default().with_art_root(repo_root.join("tools/linux")),
            device: None,
            repo_root,
        }
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.fixture_root.join("manifest.yaml")
    }

    #[must_use]
    pub fn expectations_path(&self) -> PathBuf {
        self.fixture_root.join("expectations.yaml")
    }

    #[must_use]
    pub fn report_path(&self) -> PathBuf {
        self.artifact_root.join("report.json")
    }

    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.artifact_root.join("history.jsonl")
    }

    /// Overlays the values a settings file sets.
    #[must_use]
    pub fn with_settings(mut self, settings: HarnessSettings) -> Self {
        if let Some(fixture_root) = settings.fixture_root {
            self.fixture_root = fixture_root;
        }
        if let Some(artifact_root) = settings.artifact_root {
            self.artifact_root = artifact_root;
        }
        if let Some(parallelism) = settings.parallelism {
            self.parallelism = parallelism.max(1);
        }
        if let Some(toolchain) = settings.toolchain {
            self.toolchain = toolchain;
        }
        if let Some(executor) = settings.executor {
            self.executor = executor;
        }
        if settings.device.is_some() {
            self.device = settings.device;
        }
        self
    }

    pub fn load_registry(&self) -> Result<FixtureRegistry, HarnessError> {
        Ok(FixtureRegistry::load(
            &self.fixture_root,
            &self.manifest_path(),
        )?)
    }

    pub fn load_catalog(&self) -> Result<ConditionCatalog, HarnessError> {
        Ok(ConditionCatalog::load(&self.expectations_path())?)
    }

    /// Builds a runner from the on-disk catalog and registry. Device runs
    /// use the adb found through `ANDROID_SDK_HOME`.
    pub fn build_runner(&self) -> Result<CellRunner, HarnessError> {
        let resolver = OutcomeResolver::new(
            Arc::new(self.load_catalog()?),
            Arc::new(self.load_registry()?),
        );
        let mut executor = RuntimeExecutor::new(self.executor.clone());
        if let Some(device) = &self.device {
            let transport = AdbTransport::locate();
            info!(adb = %transport.adb_path().display(), "device runs enabled");
            let protocol = DeviceProtocol::new(Arc::new(transport), device.clone());
            executor = executor.with_device(protocol);
        }
        Ok(CellRunner::new(
            resolver,
            CompilerInvoker::from_toolchain(&self.toolchain),
            executor,
            self.artifact_root.clone(),
        )
        .with_toolchain(self.toolchain.clone()))
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

/// Optional YAML overrides for [`HarnessConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessSettings {
    pub fixture_root: Option<PathBuf>,
    pub artifact_root: Option<PathBuf>,
    pub parallelism: Option<usize>,
    pub toolchain: Option<ToolchainConfig>,
    pub executor: Option<ExecutorConfig>,
    pub device: Option<DeviceConfig>,
}

impl HarnessSettings {
    pub fn from_yaml_str(body: &str) -> Result<Self, HarnessError> {
        Ok(serde_yaml::from_str(body)?)
    }

    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub manifest_present: bool,
    pub expectations_present: bool,
    pub fixture_count: usize,
    pub catalog_tests: usize,
}

/// Loads nothing but the manifests; reports what the harness would see.
#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = config.load_registry().map_or(0, |registry| registry.len());
    let catalog_tests = config
        .load_catalog()
        .map_or(0, |catalog| catalog.mentioned_tests().len());

    HarnessReport {
        suite: "smoke",
        manifest_present: config.manifest_path().is_file(),
        expectations_present: config.expectations_path().is_file(),
        fixture_count,
        catalog_tests,
    }
}

/// Which part of the matrix to run. Empty axis lists select defaults: the
/// toolchains each fixture supports, every compiler, the default host
/// runtime and each compiler's own mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteOptions {
    pub test_filter: Option<String>,
    pub toolchains: Vec<InputToolchain>,
    pub compilers: Vec<CompilerUnderTest>,
    pub runtimes: Vec<RuntimeIdentity>,
    pub modes: Vec<CompilationMode>,
}

impl SuiteOptions {
    /// Cells selected from `registry`, skipping compiler and runtime pairs
    /// that cannot run at all.
    #[must_use]
    pub fn cells(&self, registry: &FixtureRegistry) -> Vec<Cell> {
        let compilers = if self.compilers.is_empty() {
            CompilerUnderTest::ALL.to_vec()
        } else {
            self.compilers.clone()
        };
        let runtimes = if self.runtimes.is_empty() {
            vec![RuntimeIdentity::host(RuntimeVersion::Default)]
        } else {
            self.runtimes.clone()
        };

        let mut cells = Vec::new();
        for test in registry.names() {
            if self
                .test_filter
                .as_deref()
                .is_some_and(|filter| !test.contains(filter))
            {
                continue;
            }
            let Some(entry) = registry.entry(test) else {
                continue;
            };
            for &toolchain in &entry.toolchains {
                if !self.toolchains.is_empty() && !self.toolchains.contains(&toolchain) {
                    continue;
                }
                for &compiler in &compilers {
                    let modes = if self.modes.is_empty() {
                        vec![compiler.default_mode()]
                    } else {
                        self.modes.clone()
                    };
                    for &runtime in &runtimes {
                        if !is_runnable(compiler, runtime) {
                            continue;
                        }
                        for &mode in &modes {
                            cells.push(Cell::new(
                                test,
                                dd_types::CellAxes::new(toolchain, compiler, runtime, mode),
                            ));
                        }
                    }
                }
            }
        }
        cells
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixReport {
    pub suite: String,
    pub cell_count: usize,
    pub passed: usize,
    pub expected_failures: usize,
    pub unexpected_failures: usize,
    pub ignored: usize,
    pub aborted: usize,
    pub results: Vec<CaseResult>,
}

impl MatrixReport {
    #[must_use]
    pub fn from_results(suite: impl Into<String>, results: Vec<CaseResult>) -> Self {
        let mut report = Self {
            suite: suite.into(),
            cell_count: results.len(),
            passed: 0,
            expected_failures: 0,
            unexpected_failures: 0,
            ignored: 0,
            aborted: 0,
            results: Vec::new(),
        };
        for result in &results {
            match result.verdict() {
                Some(Verdict::Passed) => report.passed += 1,
                Some(Verdict::ExpectedFailure(_)) => report.expected_failures += 1,
                Some(Verdict::UnexpectedFailure(_)) => report.unexpected_failures += 1,
                Some(Verdict::Ignored(_)) => report.ignored += 1,
                None => report.aborted += 1,
            }
        }
        report.results = results;
        report
    }

    #[must_use]
    pub fn is_green(&self) -> bool {
        self.unexpected_failures == 0 && self.aborted == 0 && self.cell_count > 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseResult> {
        self.results.iter().filter(|result| result.is_failure())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts_unix_ms: u64,
    pub suite: String,
    pub cell_count: usize,
    pub passed: usize,
    pub expected_failures: usize,
    pub unexpected_failures: usize,
    pub ignored: usize,
    pub aborted: usize,
    pub green: bool,
    pub report_hash: String,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Expect(#[from] ExpectError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("conformance run is not green: {0}")]
    NotGreen(String),
}

pub fn run_suite(
    config: &HarnessConfig,
    options: &SuiteOptions,
) -> Result<MatrixReport, HarnessError> {
    let runner = config.build_runner()?;
    let cells = options.cells(runner.resolver().registry());
    Ok(runner.run_matrix("conformance", &cells, config.parallelism))
}

pub fn write_report(
    config: &HarnessConfig,
    report: &MatrixReport,
) -> Result<PathBuf, HarnessError> {
    let path = config.report_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_string_pretty(report)?)?;
    Ok(path)
}

/// Appends one summary line per run to the JSONL history.
pub fn append_history(
    config: &HarnessConfig,
    report: &MatrixReport,
) -> Result<PathBuf, HarnessError> {
    let history_path = config.history_path();
    if let Some(parent) = history_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&history_path)?;

    let report_json = serde_json::to_vec(report)?;
    let entry = HistoryEntry {
        ts_unix_ms: now_unix_ms(),
        suite: report.suite.clone(),
        cell_count: report.cell_count,
        passed: report.passed,
        expected_failures: report.expected_failures,
        unexpected_failures: report.unexpected_failures,
        ignored: report.ignored,
        aborted: report.aborted,
        green: report.is_green(),
        report_hash: format!("sha256:{}", hash_bytes(&report_json)),
    };
    writeln!(file, "{}", serde_json::to_string(&entry)?)?;
    Ok(history_path)
}

pub fn enforce_green(report: &MatrixReport) -> Result<(), HarnessError> {
    if report.is_green() {
        return Ok(());
    }
    if report.cell_count == 0 {
        return Err(HarnessError::NotGreen("no cells were selected".to_owned()));
    }
    let failures = report
        .failures()
        .map(|result| format!("{} [{}]", result.test, result.axes))
        .collect::<Vec<_>>();
    Err(HarnessError::NotGreen(failures.join(" | ")))
}

fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
