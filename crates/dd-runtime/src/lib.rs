#![forbid(unsafe_code)]

//! Execution side of the oracle: timed subprocesses, VM invocations, and the
//! three places a compiled program can run (JVM, host runtime, device).

pub mod device;
pub mod executor;
pub mod process;
pub mod vm;

pub use device::{
    AdbTransport, CancelToken, DeviceConfig, DeviceError, DeviceLocks, DeviceProtocol,
    DeviceSession, DeviceTransport, FakeStep, FakeTransport, SessionReport, SessionState,
    TransportError,
};
pub use executor::{
    ExecutorConfig, NativeLibrary, RunError, RunRequest, RuntimeExecutor, art_directory,
    art_launcher,
};
pub use process::{CommandOutput, ProcessError, TIMEOUT_EXIT_CODE, describe, run_with_timeout};
pub use vm::{VmInvocation, VmInvocationBuilder, target_join};
