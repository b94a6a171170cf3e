//! Session and update tunables.
//!
//! Durations serialize as integer milliseconds so a config file reads
//! `"settle_delay": 500`.

use crate::constants::{ATT_WRITE_OVERHEAD, FRAME_OVERHEAD};
use crate::error::{Result, XrError};
use crate::token::{DEFAULT_USER_ID, DeviceToken};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub requested_mtu: u16,
    /// Wait between the link coming up and service discovery
    #[serde(with = "duration_ms")]
    pub settle_delay: Duration,
    /// Wait between writing the token and reading the answer
    #[serde(with = "duration_ms")]
    pub handshake_read_delay: Duration,
    #[serde(with = "duration_ms")]
    pub handshake_retry_delay: Duration,
    pub max_handshake_attempts: u32,
    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,
    /// Delay before answering the pairing prompt
    #[serde(with = "duration_ms")]
    pub pairing_reply_delay: Duration,
    /// Delay between the pairing confirmation and the phone-model request
    #[serde(with = "duration_ms")]
    pub phone_model_delay: Duration,
    /// Minimum spacing between two writes on the command channel
    #[serde(with = "duration_ms")]
    pub min_write_interval: Duration,
    pub user_id: u32,
    /// Device sub-token of a returning device. Selects the retrieve handshake.
    pub retrieve_token: Option<DeviceToken>,
    pub telemetry_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            requested_mtu: 512,
            settle_delay: Duration::from_millis(500),
            handshake_read_delay: Duration::from_millis(300),
            handshake_retry_delay: Duration::from_millis(300),
            max_handshake_attempts: 3,
            command_timeout: Duration::from_millis(300),
            pairing_reply_delay: Duration::from_millis(300),
            phone_model_delay: Duration::from_millis(800),
            min_write_interval: Duration::from_millis(50),
            user_id: DEFAULT_USER_ID,
            retrieve_token: None,
            telemetry_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn with_user_id(mut self, user_id: u32) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_retrieve_token(mut self, token: DeviceToken) -> Self {
        self.retrieve_token = Some(token);
        self
    }

    pub fn with_requested_mtu(mut self, mtu: u16) -> Self {
        self.requested_mtu = mtu;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_max_handshake_attempts(mut self, attempts: u32) -> Self {
        self.max_handshake_attempts = attempts;
        self
    }

    pub fn with_min_write_interval(mut self, interval: Duration) -> Self {
        self.min_write_interval = interval;
        self
    }

    pub fn with_telemetry_capacity(mut self, capacity: usize) -> Self {
        self.telemetry_capacity = capacity;
        self
    }

    pub fn is_returning_device(&self) -> bool {
        self.retrieve_token.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if usize::from(self.requested_mtu) <= FRAME_OVERHEAD + ATT_WRITE_OVERHEAD {
            return Err(XrError::InvalidMtu(self.requested_mtu.into()));
        }
        if self.max_handshake_attempts == 0 {
            return Err(XrError::InvalidConfig("max_handshake_attempts must be at least 1".into()));
        }
        if self.telemetry_capacity == 0 {
            return Err(XrError::InvalidConfig("telemetry_capacity must be at least 1".into()));
        }
        if self.command_timeout.is_zero() {
            return Err(XrError::InvalidConfig("command_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Send every section regardless of the reported versions
    pub force_update: bool,
    /// Pause after the start-of-update command
    #[serde(with = "duration_ms")]
    pub start_settle_delay: Duration,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            force_update: false,
            start_settle_delay: Duration::from_millis(500),
        }
    }
}

impl OtaConfig {
    pub fn with_force_update(mut self, force: bool) -> Self {
        self.force_update = force;
        self
    }
}
