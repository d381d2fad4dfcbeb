use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use dd_runtime::{CommandOutput, run_with_timeout};
use dd_types::{ApiLevel, CompilationFailure, CompilationMode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{BackendId, CompileRequest, CompilerBackend};

const DISABLE_INLINING_PROPERTY: &str = "com.android.tools.r8.disableinlining";
const DISABLE_CLASS_INLINING_PROPERTY: &str = "com.android.tools.r8.disableclassinlining";
const IGNORE_MISSING_CLASSES_PROPERTY: &str = "com.android.tools.r8.ignoremissingclasses";

/// Where the compiler tools and the platform libraries live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub java_binary: PathBuf,
    pub compiler_jar: PathBuf,
    /// Directory with one `lib-v<level>/android.jar` per API level.
    pub android_jar_dir: PathBuf,
    pub default_library_api: ApiLevel,
    pub compile_timeout_ms: Option<u64>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            java_binary: PathBuf::from("java"),
            compiler_jar: PathBuf::from("build/libs/r8.jar"),
            android_jar_dir: PathBuf::from("third_party/android_jar"),
            default_library_api: ApiLevel(14),
            compile_timeout_ms: Some(300_000),
        }
    }
}

impl ToolchainConfig {
    #[must_use]
    pub fn with_compiler_jar(mut self, compiler_jar: impl Into<PathBuf>) -> Self {
        self.compiler_jar = compiler_jar.into();
        self
    }

    #[must_use]
    pub fn with_java_binary(mut self, java_binary: impl Into<PathBuf>) -> Self {
        self.java_binary = java_binary.into();
        self
    }

    #[must_use]
    pub fn with_android_jar_dir(mut self, android_jar_dir: impl Into<PathBuf>) -> Self {
        self.android_jar_dir = android_jar_dir.into();
        self
    }

    /// Platform library for `min_api`, or the default level.
    #[must_use]
    pub fn android_jar(&self, min_api: Option<ApiLevel>) -> PathBuf {
        let level = min_api.unwrap_or(self.default_library_api);
        self.android_jar_dir
            .join(format!("lib-v{}", level.level()))
            .join("android.jar")
    }

    #[must_use]
    pub fn backend(&self, id: BackendId) -> CommandBackend {
        CommandBackend {
            id,
            java_binary: self.java_binary.clone(),
            compiler_jar: self.compiler_jar.clone(),
            timeout: self.compile_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Runs a compiler from its jar in a child JVM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBackend {
    id: BackendId,
    java_binary: PathBuf,
    compiler_jar: PathBuf,
    timeout: Option<Duration>,
}

impl CommandBackend {
    fn main_class(&self) -> &'static str {
        match self.id {
            BackendId::D8 => "com.android.tools.r8.D8",
            BackendId::R8 | BackendId::R8Cf => "com.android.tools.r8.R8",
        }
    }

    /// Full command line for `request`. Keep rules are written next to the
    /// output so the tool can read them from a file.
    pub fn command(&self, request: &CompileRequest) -> std::io::Result<Command> {
        let options = &request.options;
        let mut command = Command::new(&self.java_binary);
        for (enabled, property) in [
            (options.disable_inlining, DISABLE_INLINING_PROPERTY),
            (options.disable_class_inlining, DISABLE_CLASS_INLINING_PROPERTY),
            (options.ignore_missing_classes, IGNORE_MISSING_CLASSES_PROPERTY),
        ] {
            if enabled {
                command.arg(format!("-D{property}=true"));
            }
        }
        command
            .arg("-cp")
            .arg(&self.compiler_jar)
            .arg(self.main_class());

        command.arg(match request.mode() {
            CompilationMode::Debug => "--debug",
            CompilationMode::Release => "--release",
        });
        if self.id == BackendId::R8Cf {
            command.arg("--classfile");
        }
        command.arg("--output").arg(&request.output_dir);
        if let Some(min_api) = options.min_api {
            command.arg("--min-api").arg(min_api.level().to_string());
        }
        for library in &request.libraries {
            command.arg("--lib").arg(library);
        }
        if self.id.accepts_keep_rules() {
            if let Some(rules) = &options.keep_rules {
                let rules_file = request.output_dir.join("keep-rules.pro");
                fs::write(&rules_file, rules)?;
                command.arg("--pg-conf").arg(rules_file);
            } else {
                command.arg("--no-tree-shaking").arg("--no-minification");
            }
        }
        command.args(&request.program);
        Ok(command)
    }
}

impl CompilerBackend for CommandBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn compile(&self, request: &CompileRequest) -> Result<Vec<PathBuf>, CompilationFailure> {
        let stage = self.id.as_str();
        let mut command = self.command(request).map_err(|err| {
            CompilationFailure::crash(stage, format!("cannot prepare command: {err}"))
        })?;
        let output = run_with_timeout(&mut command, self.timeout)
            .map_err(|err| CompilationFailure::crash(stage, err.to_string()))?;
        if !output.is_success() {
            return Err(classify_failure(stage, &output));
        }
        let _ = fs::remove_file(request.output_dir.join("keep-rules.pro"));
        output_files(&request.output_dir, self.id.output_extension())
            .map_err(|err| CompilationFailure::crash(stage, format!("cannot list outputs: {err}")))
    }
}

/// A tool that reports a diagnostic (`Error: ...` or "Compilation failed")
/// failed in a diagnosable way; uncaught exceptions, signals and timeouts
/// are crashes.
#[must_use]
pub fn classify_failure(stage: &str, output: &CommandOutput) -> CompilationFailure {
    let message = if output.stderr.trim().is_empty() {
        output.stdout.trim().to_owned()
    } else {
        output.stderr.trim().to_owned()
    };
    if output.timed_out || message.contains("Exception in thread") {
        return CompilationFailure::crash(stage, message);
    }
    let diagnostic = message.lines().find(|line| {
        line.starts_with("Error:") || line.contains("Compilation failed")
    });
    match diagnostic {
        Some(line) if output.exit_code > 0 => {
            let tag = line.trim().to_owned();
            CompilationFailure::diagnosable(stage, tag, message)
        }
        _ => CompilationFailure::crash(stage, message),
    }
}

/// Files with `extension` below `dir`, sorted by path.
pub fn output_files(dir: &Path, extension: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == extension) {
                files.push(path);
            }
        }
    }
    files.sort();
    debug!(dir = %dir.display(), count = files.len(), "collected compiler outputs");
    Ok(files)
}
