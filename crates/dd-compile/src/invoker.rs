use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dd_expect::{CompileOptions, TestSpecification};
use dd_types::{CompilationFailure, CompilationMode, CompilerUnderTest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{BackendId, CompileRequest, CompilerBackend};
use crate::command::ToolchainConfig;

#[derive(Debug, Error)]
pub enum CompileError {
    /// The compiler under test rejected or crashed on the input.
    #[error(transparent)]
    Failure(#[from] CompilationFailure),
    #[error("no backend registered for {0}")]
    MissingBackend(BackendId),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Program and library inputs of one compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileInput {
    pub program: Vec<PathBuf>,
    pub libraries: Vec<PathBuf>,
}

/// Output of a successful compilation. The digest covers file names and
/// contents, so identical inputs and options give identical digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub compiler: CompilerUnderTest,
    pub directory: PathBuf,
    pub files: Vec<PathBuf>,
    pub digest: String,
}

impl Artifact {
    pub fn collect(
        compiler: CompilerUnderTest,
        directory: &Path,
        mut files: Vec<PathBuf>,
    ) -> std::io::Result<Self> {
        files.sort();
        let mut hasher = Sha256::new();
        for file in &files {
            let relative = file.strip_prefix(directory).unwrap_or(file.as_path());
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0]);
            hasher.update(fs::read(file)?);
        }
        Ok(Self {
            compiler,
            directory: directory.to_path_buf(),
            files,
            digest: format!("{:x}", hasher.finalize()),
        })
    }

    /// Whether the artifact holds dex code rather than class files.
    #[must_use]
    pub fn is_dex(&self) -> bool {
        self.files
            .iter()
            .all(|file| file.extension().is_some_and(|ext| ext == "dex"))
    }
}

/// Runs a compiler under test, composing the two chained pipelines out of
/// single backends.
#[derive(Clone, Default)]
pub struct CompilerInvoker {
    backends: BTreeMap<BackendId, Arc<dyn CompilerBackend>>,
}

impl std::fmt::Debug for CompilerInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerInvoker")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CompilerInvoker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoker with a command backend for every [`BackendId`].
    #[must_use]
    pub fn from_toolchain(config: &ToolchainConfig) -> Self {
        BackendId::ALL
            .into_iter()
            .fold(Self::new(), |invoker, id| {
                invoker.with_backend(Arc::new(config.backend(id)))
            })
    }

    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn CompilerBackend>) -> Self {
        self.backends.insert(backend.id(), backend);
        self
    }

    /// Compiles `input` into `result_dir`, which is recreated empty first
    /// and left empty when compilation fails.
    pub fn compile(
        &self,
        compiler: CompilerUnderTest,
        input: &CompileInput,
        mode: CompilationMode,
        spec: &TestSpecification,
        result_dir: &Path,
    ) -> Result<Artifact, CompileError> {
        if spec.fixture.directory == result_dir {
            return Err(CompileError::Io(std::io::Error::other(format!(
                "refusing to compile into fixture directory {}",
                result_dir.display()
            ))));
        }
        reset_dir(result_dir)?;
        let options = spec.compile_options(mode);
        debug!(test = %spec.name, %compiler, %mode, "compiling");

        let outcome = match compiler {
            CompilerUnderTest::D8 => {
                self.stage(BackendId::D8, input.program.clone(), input, options, result_dir)
            }
            CompilerUnderTest::R8 => {
                self.stage(BackendId::R8, input.program.clone(), input, options, result_dir)
            }
            CompilerUnderTest::R8Cf => {
                self.stage(BackendId::R8Cf, input.program.clone(), input, options, result_dir)
            }
            CompilerUnderTest::R8AfterD8 => {
                self.chain(BackendId::D8, BackendId::R8, input, &options, result_dir)
            }
            CompilerUnderTest::D8AfterR8Cf => {
                self.chain(BackendId::R8Cf, BackendId::D8, input, &options, result_dir)
            }
        };

        match outcome {
            Ok(files) => {
                let artifact = Artifact::collect(compiler, result_dir, files)?;
                debug!(test = %spec.name, %compiler, digest = %artifact.digest, "compiled");
                Ok(artifact)
            }
            Err(err) => {
                reset_dir(result_dir)?;
                if let CompileError::Failure(failure) = &err {
                    info!(
                        test = %spec.name,
                        %compiler,
                        stage = %failure.stage,
                        "compilation failed"
                    );
                }
                Err(err)
            }
        }
    }

    fn backend(&self, id: BackendId) -> Result<&Arc<dyn CompilerBackend>, CompileError> {
        self.backends.get(&id).ok_or(CompileError::MissingBackend(id))
    }

    fn stage(
        &self,
        id: BackendId,
        program: Vec<PathBuf>,
        input: &CompileInput,
        mut options: CompileOptions,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, CompileError> {
        if !id.accepts_keep_rules() {
            options.keep_rules = None;
        }
        let request = CompileRequest {
            backend: id,
            program,
            libraries: input.libraries.clone(),
            output_dir: output_dir.to_path_buf(),
            options,
        };
        Ok(self.backend(id)?.compile(&request)?)
    }

    /// Runs `first` into a scratch directory and feeds its output to
    /// `second`. When the first stage produces class files, dex inputs skip
    /// it and go straight to the second stage, which then tolerates missing
    /// classes.
    fn chain(
        &self,
        first: BackendId,
        second: BackendId,
        input: &CompileInput,
        options: &CompileOptions,
        result_dir: &Path,
    ) -> Result<Vec<PathBuf>, CompileError> {
        let first_produces_classes = first.output_extension() == "class";
        let (stage_one_program, passthrough): (Vec<PathBuf>, Vec<PathBuf>) =
            if first_produces_classes {
                input
                    .program
                    .iter()
                    .cloned()
                    .partition(|path| !path.extension().is_some_and(|ext| ext == "dex"))
            } else {
                (input.program.clone(), Vec::new())
            };

        let scratch = tempfile::Builder::new().prefix("dd-chain").tempdir()?;
        let intermediate =
            self.stage(first, stage_one_program, input, options.clone(), scratch.path())?;

        let mut second_options = options.clone();
        if first_produces_classes {
            second_options.ignore_missing_classes = true;
        }
        let mut program = intermediate;
        program.extend(passthrough);
        self.stage(second, program, input, second_options, result_dir)
    }
}

fn reset_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)
}
