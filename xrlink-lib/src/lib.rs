pub mod command;
pub mod config;
pub mod constants;
pub mod crc;
pub mod error;
pub mod executor;
pub mod frame;
pub mod framer;
pub mod link;
pub mod ota;
pub mod rlc;
pub mod session;
pub mod sim;
pub mod telemetry;
pub mod tlv;
pub mod token;

// Re-export the session types most callers start from
pub use config::{OtaConfig, SessionConfig};
pub use error::{Result, XrError};
pub use session::{ConnectionState, DeviceEvent, DeviceSession, SessionRegistry};
