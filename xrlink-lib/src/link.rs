//! Transport abstraction over the accessory's GATT link.
//!
//! Operations only start work; their outcomes arrive later as [`LinkEvent`]s
//! on the mailbox handed to [`Link::open`]. The session consumes that mailbox
//! from a single task, so link callbacks never re-enter session state.

use crate::error::Result;
use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Vendor GATT characteristics used by the glasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    /// Host-to-device command writes
    Write,
    /// Device-to-host acknowledgments and notifications
    Response,
    /// Handshake token exchange
    Handshake,
    /// Sensor stream
    Telemetry,
    Other(Uuid),
}

impl ChannelId {
    pub const WRITE_UUID: Uuid = Uuid::from_u128(0x00010001_0000_1000_8000_00805F9B5A6B);
    pub const RESPONSE_UUID: Uuid = Uuid::from_u128(0x00010002_0000_1000_8000_00805F9B5A6B);
    pub const HANDSHAKE_UUID: Uuid = Uuid::from_u128(0x00010003_0000_1000_8000_00805F9B5A6B);
    pub const TELEMETRY_UUID: Uuid = Uuid::from_u128(0x00030002_0000_1000_8000_00805F9B5A6B);
    /// Client characteristic configuration descriptor written to enable notifications
    pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

    const KNOWN: [ChannelId; 4] = [
        ChannelId::Write,
        ChannelId::Response,
        ChannelId::Handshake,
        ChannelId::Telemetry,
    ];

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|channel| channel.uuid() == uuid)
            .unwrap_or(ChannelId::Other(uuid))
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            ChannelId::Write => Self::WRITE_UUID,
            ChannelId::Response => Self::RESPONSE_UUID,
            ChannelId::Handshake => Self::HANDSHAKE_UUID,
            ChannelId::Telemetry => Self::TELEMETRY_UUID,
            ChannelId::Other(uuid) => *uuid,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.uuid(), f)
    }
}

/// A discovered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    /// Supports notifications (has a CCCD to write)
    pub notify: bool,
}

impl ChannelInfo {
    pub fn new(id: ChannelId, notify: bool) -> Self {
        Self { id, notify }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    MtuChanged(u16),
    ServicesDiscovered(Vec<ChannelInfo>),
    DescriptorWritten(ChannelId),
    /// Notification, or the result of a [`Link::read`]
    FrameReceived(ChannelId, Bytes),
}

/// One physical link to one accessory.
#[async_trait::async_trait]
pub trait Link: Send + Sync + 'static {
    /// Starts connecting. Completion is reported as [`LinkEvent::Connected`].
    async fn open(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<()>;

    /// Reported as [`LinkEvent::MtuChanged`].
    async fn request_mtu(&self, mtu: u16) -> Result<()>;

    /// Reported as [`LinkEvent::ServicesDiscovered`].
    async fn discover_services(&self) -> Result<()>;

    /// Enables notifications on `channel`. Reported as [`LinkEvent::DescriptorWritten`].
    async fn write_descriptor(&self, channel: ChannelId) -> Result<()>;

    /// Write without response.
    async fn write(&self, channel: ChannelId, data: Bytes) -> Result<()>;

    /// The value arrives as [`LinkEvent::FrameReceived`].
    async fn read(&self, channel: ChannelId) -> Result<()>;

    /// Closing an already closed link is not an error.
    async fn close(&self) -> Result<()>;
}
