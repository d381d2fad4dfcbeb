use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use dd_types::{
    ConfigurationError, ExecutionFailure, ExecutionFailureKind, ExecutionResult, RuntimeIdentity,
    RuntimeKind, RuntimeVersion,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::device::DeviceProtocol;
use crate::process::run_with_timeout;
use crate::vm::VmInvocation;

pub const LIBRARY_PATH_PROPERTY: &str = "java.library.path";
pub const LIBRARY_PATH_ENV: &str = "LD_LIBRARY_PATH";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Execution(#[from] ExecutionFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub java_binary: PathBuf,
    /// Directory holding one subdirectory per host runtime build.
    pub art_root: PathBuf,
    /// Shell used to start the host launcher script, if any.
    pub launcher_shell: Option<PathBuf>,
    pub run_timeout_ms: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            java_binary: PathBuf::from("java"),
            art_root: PathBuf::from("tools/linux"),
            launcher_shell: cfg!(target_os = "linux").then(|| PathBuf::from("/bin/bash")),
            run_timeout_ms: Some(120_000),
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn with_java_binary(mut self, java_binary: impl Into<PathBuf>) -> Self {
        self.java_binary = java_binary.into();
        self
    }

    #[must_use]
    pub fn with_art_root(mut self, art_root: impl Into<PathBuf>) -> Self {
        self.art_root = art_root.into();
        self
    }

    #[must_use]
    pub fn with_launcher_shell(mut self, shell: Option<PathBuf>) -> Self {
        self.launcher_shell = shell;
        self
    }

    #[must_use]
    pub fn with_run_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.run_timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    /// Directory of the host build for `version`.
    #[must_use]
    pub fn art_dir(&self, version: RuntimeVersion) -> PathBuf {
        self.art_root.join(art_directory(version))
    }

    #[must_use]
    pub fn art_launcher(&self, version: RuntimeVersion) -> PathBuf {
        self.art_dir(version).join(art_launcher(version))
    }
}

/// Location of each host runtime build below the runtime root.
#[must_use]
pub fn art_directory(version: RuntimeVersion) -> &'static str {
    match version {
        RuntimeVersion::V4_0_4 => "dalvik-4.0.4",
        RuntimeVersion::V4_4_4 => "dalvik",
        RuntimeVersion::V5_1_1 => "art-5.1.1",
        RuntimeVersion::V6_0_1 => "art-6.0.1",
        RuntimeVersion::V7_0_0 => "art-7.0.0",
        RuntimeVersion::V8_1_0 => "art-8.1.0",
        RuntimeVersion::Default => "art",
        RuntimeVersion::V9_0_0 => "art-9.0.0",
        RuntimeVersion::V10_0_0 => "art-10.0.0",
        RuntimeVersion::V12_0_0 => "host/art-12.0.0-beta4",
        RuntimeVersion::V13_0_0 => "host/art-13.0.0",
        RuntimeVersion::V14_0_0 => "host/art-14.0.0-beta3",
        RuntimeVersion::Master => "host/art-master",
    }
}

#[must_use]
pub fn art_launcher(version: RuntimeVersion) -> &'static str {
    if version.is_dalvik() {
        "bin/dalvik"
    } else {
        "bin/art"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeLibrary {
    /// Library name handed to the program, e.g. `arttest`.
    pub name: String,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub classpath: Vec<PathBuf>,
    pub main_class: String,
    pub runtime: RuntimeIdentity,
    pub native_library: Option<NativeLibrary>,
    pub program_arguments: Vec<String>,
}

impl RunRequest {
    #[must_use]
    pub fn new(
        classpath: Vec<PathBuf>,
        main_class: impl Into<String>,
        runtime: RuntimeIdentity,
    ) -> Self {
        Self {
            classpath,
            main_class: main_class.into(),
            runtime,
            native_library: None,
            program_arguments: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_native_library(
        mut self,
        name: impl Into<String>,
        directory: impl Into<PathBuf>,
    ) -> Self {
        self.native_library = Some(NativeLibrary {
            name: name.into(),
            directory: directory.into(),
        });
        self
    }

    #[must_use]
    pub fn with_argument(mut self, argument: impl Into<String>) -> Self {
        self.program_arguments.push(argument.into());
        self
    }
}

/// Runs compiled artifacts on the JVM, on a host runtime build, or on a
/// device through a [`DeviceProtocol`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeExecutor {
    config: ExecutorConfig,
    device: Option<DeviceProtocol>,
}

impl RuntimeExecutor {
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            device: None,
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: DeviceProtocol) -> Self {
        self.device = Some(device);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> Option<&DeviceProtocol> {
        self.device.as_ref()
    }

    /// The VM launch a request turns into. A native library adds the
    /// library path property and its name as the first program argument.
    #[must_use]
    pub fn invocation(&self, request: &RunRequest) -> VmInvocation {
        let mut builder = VmInvocation::builder(request.main_class.clone())
            .classpath(request.classpath.iter().cloned());
        if let Some(native) = &request.native_library {
            builder = builder
                .system_property(
                    LIBRARY_PATH_PROPERTY,
                    native.directory.to_string_lossy().into_owned(),
                )
                .program_argument(native.name.clone());
        }
        for argument in &request.program_arguments {
            builder = builder.program_argument(argument.clone());
        }
        builder.build()
    }

    pub fn run(&self, request: &RunRequest) -> Result<ExecutionResult, RunError> {
        debug!(
            runtime = %request.runtime,
            main_class = %request.main_class,
            entries = request.classpath.len(),
            "running artifact"
        );
        match request.runtime.kind {
            RuntimeKind::Jvm => {
                let mut command = Command::new(&self.config.java_binary);
                command.args(self.invocation(request).arguments());
                self.run_local(command, request)
            }
            RuntimeKind::Host => self.run_host(request),
            RuntimeKind::Target => self.run_target(request),
        }
    }

    fn run_host(&self, request: &RunRequest) -> Result<ExecutionResult, RunError> {
        let version = request.runtime.version;
        let launcher = self.config.art_launcher(version);
        if !launcher.is_file() {
            return Err(ConfigurationError::Setup {
                detail: format!(
                    "no {} launcher at {}",
                    request.runtime,
                    launcher.display()
                ),
            }
            .into());
        }
        let mut command = match &self.config.launcher_shell {
            Some(shell) => {
                let mut command = Command::new(shell);
                command.arg(&launcher);
                command
            }
            None => Command::new(&launcher),
        };
        command
            .current_dir(self.config.art_dir(version))
            .args(self.invocation(request).arguments());
        self.run_local(command, request)
    }

    fn run_target(&self, request: &RunRequest) -> Result<ExecutionResult, RunError> {
        if let Some(native) = &request.native_library {
            return Err(ConfigurationError::NativeOnDevice {
                library: native.name.clone(),
            }
            .into());
        }
        let device = self.device.as_ref().ok_or_else(|| ConfigurationError::Setup {
            detail: format!("{} requested but no device protocol is configured", request.runtime),
        })?;
        device.run(&self.invocation(request))
    }

    fn run_local(
        &self,
        mut command: Command,
        request: &RunRequest,
    ) -> Result<ExecutionResult, RunError> {
        if let Some(native) = &request.native_library {
            command.env(LIBRARY_PATH_ENV, extended_library_path(&native.directory)?);
        }
        let output = run_with_timeout(&mut command, self.config.run_timeout())
            .map_err(ExecutionFailure::from)?;
        if output.timed_out {
            return Err(ExecutionFailure::new(
                ExecutionFailureKind::TimedOut,
                format!("`{}` timed out after {} ms", output.command, output.duration_ms),
            )
            .into());
        }
        Ok(ExecutionResult {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            command: output.command,
            correlation_id: None,
        })
    }
}

fn extended_library_path(directory: &Path) -> Result<OsString, ConfigurationError> {
    let existing = std::env::var_os(LIBRARY_PATH_ENV);
    let entries = std::iter::once(directory.to_path_buf())
        .chain(
            existing
                .iter()
                .flat_map(|paths| std::env::split_paths(paths).collect::<Vec<_>>()),
        );
    std::env::join_paths(entries).map_err(|err| ConfigurationError::Setup {
        detail: format!("invalid native library directory {}: {err}", directory.display()),
    })
}
