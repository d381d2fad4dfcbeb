use std::fmt;
use std::path::PathBuf;

use dd_expect::CompileOptions;
use dd_types::{CompilationFailure, CompilationMode};
use serde::{Deserialize, Serialize};

/// A single compiler invocation. Chains are built from these by
/// [`CompilerInvoker`](crate::CompilerInvoker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendId {
    D8,
    R8,
    /// R8 emitting class files instead of dex.
    R8Cf,
}

impl BackendId {
    pub const ALL: [Self; 3] = [Self::D8, Self::R8, Self::R8Cf];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::D8 => "d8",
            Self::R8 => "r8",
            Self::R8Cf => "r8_cf",
        }
    }

    /// Extension of the files this backend writes.
    #[must_use]
    pub fn output_extension(self) -> &'static str {
        match self {
            Self::D8 | Self::R8 => "dex",
            Self::R8Cf => "class",
        }
    }

    /// Whether the backend honours keep rules.
    #[must_use]
    pub fn accepts_keep_rules(self) -> bool {
        !matches!(self, Self::D8)
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    pub backend: BackendId,
    pub program: Vec<PathBuf>,
    pub libraries: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub options: CompileOptions,
}

impl CompileRequest {
    #[must_use]
    pub fn mode(&self) -> CompilationMode {
        self.options.mode.unwrap_or(CompilationMode::Debug)
    }
}

/// One compiler under test. Implementations write their output into
/// `request.output_dir` and return the files they produced.
pub trait CompilerBackend: Send + Sync {
    fn id(&self) -> BackendId;

    fn compile(&self, request: &CompileRequest) -> Result<Vec<PathBuf>, CompilationFailure>;
}
