//! Running programs on an attached device through a shell bridge.
//!
//! A session moves through [`SessionState`]: the bridge is brought up, the
//! single attached device is checked and escalated to root, the program and
//! a small wrapper script are pushed into a scratch directory, the wrapper
//! runs the program and writes its exit status to a file, that file is
//! pulled back, and the scratch directory is removed on every path out.

pub mod adb;
pub mod config;
pub mod error;
pub mod fake;
pub mod locks;
pub mod protocol;
pub mod session;
pub mod transport;

pub use adb::{AdbTransport, SDK_HOME_ENV, parse_device_list};
pub use config::DeviceConfig;
pub use error::{DeviceError, TransportError};
pub use fake::{FakeStep, FakeTransport};
pub use locks::DeviceLocks;
pub use protocol::{DeviceProtocol, SessionReport, to_host_line_endings};
pub use session::{CancelToken, DeviceSession, SessionState, new_correlation_id};
pub use transport::DeviceTransport;
