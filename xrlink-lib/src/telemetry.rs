//! Sensor stream decoding.
//!
//! A telemetry notification is an 8-byte head followed by one or more
//! 21-byte records: kind (1), timestamp (u64 LE), x/y/z (f32 LE).

use crate::constants::{TELEMETRY_HEADER_SIZE, TELEMETRY_RECORD_SIZE};
use crate::error::{Result, XrError};
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use strum_macros::Display;
use tracing::warn;
use zerocopy::byteorder::little_endian::{F32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SensorKind {
    Accelerometer = 1,
    Gyroscope = 2,
    Magnetometer = 3,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct TelemetryRecordRaw {
    pub kind: u8,
    pub timestamp: U64,
    pub x: F32,
    pub y: F32,
    pub z: F32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub kind: SensorKind,
    pub timestamp: u64,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl TelemetrySample {
    pub fn new(kind: SensorKind, timestamp: u64, [x, y, z]: [f32; 3]) -> Self {
        Self { kind, timestamp, x, y, z }
    }

    pub fn to_raw(&self) -> TelemetryRecordRaw {
        TelemetryRecordRaw {
            kind: self.kind.into(),
            timestamp: self.timestamp.into(),
            x: self.x.into(),
            y: self.y.into(),
            z: self.z.into(),
        }
    }
}

/// Decodes every known record in a notification. Records of unknown kind
/// and a trailing partial record are skipped.
pub fn parse_frame(frame: &[u8]) -> Result<Vec<TelemetrySample>> {
    let body = frame.get(TELEMETRY_HEADER_SIZE..).ok_or(XrError::InsufficientData {
        expected: TELEMETRY_HEADER_SIZE,
        actual: frame.len(),
    })?;

    let records = body.chunks_exact(TELEMETRY_RECORD_SIZE);
    if !records.remainder().is_empty() {
        warn!(trailing = records.remainder().len(), "partial telemetry record ignored");
    }

    let mut samples = Vec::with_capacity(body.len() / TELEMETRY_RECORD_SIZE);
    for chunk in records {
        let raw = TelemetryRecordRaw::ref_from_bytes(chunk)
            .map_err(|_| XrError::InvalidPacket("telemetry record size".to_string()))?;
        match SensorKind::try_from(raw.kind) {
            Ok(kind) => samples.push(TelemetrySample {
                kind,
                timestamp: raw.timestamp.get(),
                x: raw.x.get(),
                y: raw.y.get(),
                z: raw.z.get(),
            }),
            Err(_) => warn!(kind = raw.kind, "unknown telemetry kind skipped"),
        }
    }
    Ok(samples)
}

/// Builds a notification carrying `samples`, with a zeroed head.
pub fn encode_frame(samples: &[TelemetrySample]) -> Bytes {
    let mut out = BytesMut::with_capacity(TELEMETRY_HEADER_SIZE + samples.len() * TELEMETRY_RECORD_SIZE);
    out.put_bytes(0, TELEMETRY_HEADER_SIZE);
    for sample in samples {
        out.put_slice(sample.to_raw().as_bytes());
    }
    out.freeze()
}
