#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pre-existing artifact form that feeds the compiler under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InputToolchain {
    /// Raw class files, no pre-dexing.
    #[serde(rename = "none")]
    NoPreprocessing,
    /// Dex files produced by the external dx dexer.
    #[serde(rename = "dx")]
    ExternalDexer,
    /// Dex files produced by the retired jack toolchain.
    #[serde(rename = "jack")]
    LegacyDexer,
}

impl InputToolchain {
    pub const ALL: [Self; 3] = [Self::NoPreprocessing, Self::ExternalDexer, Self::LegacyDexer];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoPreprocessing => "none",
            Self::ExternalDexer => "dx",
            Self::LegacyDexer => "jack",
        }
    }

    #[must_use]
    pub fn is_pre_dexed(self) -> bool {
        !matches!(self, Self::NoPreprocessing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilerUnderTest {
    D8,
    R8,
    /// R8 emitting class files instead of dex.
    R8Cf,
    /// D8 first, then R8 in debug mode on the D8 output.
    R8AfterD8,
    /// R8 to class files, then D8 on the result.
    D8AfterR8Cf,
}

impl CompilerUnderTest {
    pub const ALL: [Self; 5] = [
        Self::D8,
        Self::R8,
        Self::R8Cf,
        Self::R8AfterD8,
        Self::D8AfterR8Cf,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::D8 => "d8",
            Self::R8 => "r8",
            Self::R8Cf => "r8_cf",
            Self::R8AfterD8 => "r8_after_d8",
            Self::D8AfterR8Cf => "d8_after_r8_cf",
        }
    }

    #[must_use]
    pub fn is_chained(self) -> bool {
        matches!(self, Self::R8AfterD8 | Self::D8AfterR8Cf)
    }

    /// Mode a cell uses when the caller does not pin one.
    #[must_use]
    pub fn default_mode(self) -> CompilationMode {
        match self {
            Self::R8 | Self::R8Cf => CompilationMode::Release,
            Self::D8 | Self::R8AfterD8 | Self::D8AfterR8Cf => CompilationMode::Debug,
        }
    }
}

/// Runtime snapshot, declared oldest first so the derived `Ord` is the
/// release order. `Default` sits between 8.1.0 and 9.0.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RuntimeVersion {
    #[serde(rename = "4.0.4")]
    V4_0_4,
    #[serde(rename = "4.4.4")]
    V4_4_4,
    #[serde(rename = "5.1.1")]
    V5_1_1,
    #[serde(rename = "6.0.1")]
    V6_0_1,
    #[serde(rename = "7.0.0")]
    V7_0_0,
    #[serde(rename = "8.1.0")]
    V8_1_0,
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "9.0.0")]
    V9_0_0,
    #[serde(rename = "10.0.0")]
    V10_0_0,
    #[serde(rename = "12.0.0")]
    V12_0_0,
    #[serde(rename = "13.0.0")]
    V13_0_0,
    #[serde(rename = "14.0.0")]
    V14_0_0,
    #[serde(rename = "master")]
    Master,
}

impl RuntimeVersion {
    pub const ALL: [Self; 13] = [
        Self::V4_0_4,
        Self::V4_4_4,
        Self::V5_1_1,
        Self::V6_0_1,
        Self::V7_0_0,
        Self::V8_1_0,
        Self::Default,
        Self::V9_0_0,
        Self::V10_0_0,
        Self::V12_0_0,
        Self::V13_0_0,
        Self::V14_0_0,
        Self::Master,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V4_0_4 => "4.0.4",
            Self::V4_4_4 => "4.4.4",
            Self::V5_1_1 => "5.1.1",
            Self::V6_0_1 => "6.0.1",
            Self::V7_0_0 => "7.0.0",
            Self::V8_1_0 => "8.1.0",
            Self::Default => "default",
            Self::V9_0_0 => "9.0.0",
            Self::V10_0_0 => "10.0.0",
            Self::V12_0_0 => "12.0.0",
            Self::V13_0_0 => "13.0.0",
            Self::V14_0_0 => "14.0.0",
            Self::Master => "master",
        }
    }

    #[must_use]
    pub fn is_default(self) -> bool {
        self == Self::Default
    }

    #[must_use]
    pub fn is_older_than_or_equal(self, other: Self) -> bool {
        self <= other
    }

    #[must_use]
    pub fn is_in_range_inclusive(self, low: Self, high: Self) -> bool {
        low <= self && self <= high
    }

    /// Dalvik rather than ART.
    #[must_use]
    pub fn is_dalvik(self) -> bool {
        self <= Self::V4_4_4
    }

    /// Versions whose fixtures live in the older corpus snapshot.
    #[must_use]
    pub fn is_legacy(self) -> bool {
        self <= Self::V7_0_0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// ART built for the host and run locally.
    Host,
    /// Plain JVM, only meaningful for class-file outputs.
    Jvm,
    /// A physical or emulated device reached through the shell bridge.
    Target,
}

impl RuntimeKind {
    pub const ALL: [Self; 3] = [Self::Host, Self::Jvm, Self::Target];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Jvm => "jvm",
            Self::Target => "target",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuntimeIdentity {
    pub version: RuntimeVersion,
    pub kind: RuntimeKind,
}

impl RuntimeIdentity {
    #[must_use]
    pub fn host(version: RuntimeVersion) -> Self {
        Self {
            version,
            kind: RuntimeKind::Host,
        }
    }

    #[must_use]
    pub fn target(version: RuntimeVersion) -> Self {
        Self {
            version,
            kind: RuntimeKind::Target,
        }
    }

    /// The JVM has no ART version; it is filed under the default snapshot.
    #[must_use]
    pub fn jvm() -> Self {
        Self {
            version: RuntimeVersion::Default,
            kind: RuntimeKind::Jvm,
        }
    }
}

impl Default for RuntimeIdentity {
    fn default() -> Self {
        Self::host(RuntimeVersion::Default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilationMode {
    Debug,
    Release,
}

impl CompilationMode {
    pub const ALL: [Self; 2] = [Self::Debug, Self::Release];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiLevel(pub u32);

impl ApiLevel {
    pub const N: Self = Self(24);
    pub const O: Self = Self(26);
    pub const P: Self = Self(28);

    #[must_use]
    pub fn level(self) -> u32 {
        self.0
    }
}

/// The point in the matrix a condition is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellAxes {
    pub toolchain: InputToolchain,
    pub compiler: CompilerUnderTest,
    pub runtime: RuntimeIdentity,
    pub mode: CompilationMode,
}

impl CellAxes {
    #[must_use]
    pub fn new(
        toolchain: InputToolchain,
        compiler: CompilerUnderTest,
        runtime: RuntimeIdentity,
        mode: CompilationMode,
    ) -> Self {
        Self {
            toolchain,
            compiler,
            runtime,
            mode,
        }
    }

    /// Every combination of the four axes, in declaration order.
    pub fn grid() -> impl Iterator<Item = Self> {
        InputToolchain::ALL.into_iter().flat_map(|toolchain| {
            CompilerUnderTest::ALL.into_iter().flat_map(move |compiler| {
                RuntimeVersion::ALL.into_iter().flat_map(move |version| {
                    RuntimeKind::ALL.into_iter().flat_map(move |kind| {
                        CompilationMode::ALL.into_iter().map(move |mode| Self {
                            toolchain,
                            compiler,
                            runtime: RuntimeIdentity { version, kind },
                            mode,
                        })
                    })
                })
            })
        })
    }
}

impl fmt::Display for CellAxes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.toolchain, self.compiler, self.runtime, self.mode
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AxisParseError {
    #[error("unknown {axis} value: {value:?}")]
    UnknownValue { axis: &'static str, value: String },
}

macro_rules! axis_text {
    ($ty:ty, $axis:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = AxisParseError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .into_iter()
                    .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
                    .ok_or_else(|| AxisParseError::UnknownValue {
                        axis: $axis,
                        value: value.to_owned(),
                    })
            }
        }
    };
}

axis_text!(InputToolchain, "toolchain");
axis_text!(CompilerUnderTest, "compiler");
axis_text!(RuntimeVersion, "runtime version");
axis_text!(RuntimeKind, "runtime kind");
axis_text!(CompilationMode, "compilation mode");

impl fmt::Display for RuntimeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.version)
    }
}

/// Accepts `host-7.0.0`, `target-default` or `jvm`.
impl FromStr for RuntimeIdentity {
    type Err = AxisParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("jvm") {
            return Ok(Self::jvm());
        }
        let Some((kind, version)) = value.split_once('-') else {
            return Err(AxisParseError::UnknownValue {
                axis: "runtime",
                value: value.to_owned(),
            });
        };
        Ok(Self {
            version: version.parse()?,
            kind: kind.parse()?,
        })
    }
}

impl fmt::Display for ApiLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Environment problems that no expectation may tolerate. They abort the
/// cell instead of becoming a verdict.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigurationError {
    #[error("device bridge not found: {detail}")]
    TransportNotFound { detail: String },
    #[error("device bridge found but not ready: {detail}")]
    TransportMisconfigured { detail: String },
    #[error("no device found")]
    NoDevice,
    #[error(
        "running tests on more than one device is not supported; connected devices: [{}]",
        .devices.join(", ")
    )]
    MultipleDevices { devices: Vec<String> },
    #[error("device runtime is not {expected}: {reported}")]
    WrongRuntimeFamily { expected: String, reported: String },
    #[error("cannot switch to root on device {device}: {detail}")]
    RootUnavailable { device: String, detail: String },
    #[error("native library {library} cannot run on a device target")]
    NativeOnDevice { library: String },
    #[error("test {test} has no expectations for toolchain {toolchain}")]
    UnknownTest { test: String, toolchain: InputToolchain },
    #[error("test {test} is both expected to fail compilation and tolerated to crash at {axes}")]
    ConflictingCompileExpectations { test: String, axes: CellAxes },
    #[error("{runtime} is not usable with {compiler}: {detail}")]
    UnsupportedCombination {
        compiler: CompilerUnderTest,
        runtime: RuntimeIdentity,
        detail: String,
    },
    #[error("invalid harness setup: {detail}")]
    Setup { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompilationFailureKind {
    /// The tool reported a structured compilation error.
    Diagnosable { tag: String },
    /// The tool died with an uncaught exception or signal.
    Crash,
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{stage} compilation failed ({kind:?}): {message}")]
pub struct CompilationFailure {
    pub kind: CompilationFailureKind,
    /// Backend that failed; for chains this is the failing stage.
    pub stage: String,
    pub message: String,
}

impl CompilationFailure {
    #[must_use]
    pub fn diagnosable(
        stage: impl Into<String>,
        tag: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: CompilationFailureKind::Diagnosable { tag: tag.into() },
            stage: stage.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn crash(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: CompilationFailureKind::Crash,
            stage: stage.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_diagnosable(&self) -> bool {
        matches!(self.kind, CompilationFailureKind::Diagnosable { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionFailureKind {
    Spawn,
    TimedOut,
    Transport,
    MissingExitStatus,
    UnparsableExitStatus,
    Cancelled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("execution failed ({kind:?}): {message}")]
pub struct ExecutionFailure {
    pub kind: ExecutionFailureKind,
    pub message: String,
    pub correlation_id: Option<String>,
}

impl ExecutionFailure {
    #[must_use]
    pub fn new(kind: ExecutionFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// What a finished program run produced. A nonzero exit code is still a
/// completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub command: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl ExecutionResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}
