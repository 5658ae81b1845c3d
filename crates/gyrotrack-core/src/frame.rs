//! Notification frame decoding.
//!
//! The trainer pushes one notification per reading. Only bytes 4 through 10
//! carry telemetry; the header and any trailing bytes are ignored.
//!
//! ```text
//! offset  4    5    6        7    8        9    10
//!        [rpm lo|hi][metric1][duration lo|hi][rotation lo|hi]
//! ```

use std::fmt::Write as _;

use serde::Serialize;

use crate::error::{MonitorError, Result};

/// Minimum payload length that contains a full reading.
pub const MIN_FRAME_LEN: usize = 11;

/// First byte of the telemetry block.
const TELEMETRY_OFFSET: usize = 4;

/// One decoded telemetry reading.
///
/// Values are taken as-is from the peripheral, including zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    device_metric1: u8,
    rpm: u16,
    duration_ticks: u16,
    rotation_ticks: u16,
}

impl Sample {
    #[cfg(test)]
    pub(crate) const fn new(
        device_metric1: u8,
        rpm: u16,
        duration_ticks: u16,
        rotation_ticks: u16,
    ) -> Self {
        Self {
            device_metric1,
            rpm,
            duration_ticks,
            rotation_ticks,
        }
    }

    /// Device-specific auxiliary metric (byte 6).
    #[must_use]
    pub const fn device_metric1(&self) -> u8 {
        self.device_metric1
    }

    /// Rotational speed in rotations per minute.
    #[must_use]
    pub const fn rpm(&self) -> u16 {
        self.rpm
    }

    /// Session timer of the peripheral, in tenths of a second.
    #[must_use]
    pub const fn duration_ticks(&self) -> u16 {
        self.duration_ticks
    }

    /// Rotation counter of the peripheral, in tenths of a rotation.
    #[must_use]
    pub const fn rotation_ticks(&self) -> u16 {
        self.rotation_ticks
    }
}

/// Decode one notification payload into a [`Sample`].
///
/// # Errors
///
/// Returns [`MonitorError::MalformedFrame`] if the payload is shorter than
/// [`MIN_FRAME_LEN`] bytes.
pub fn decode_frame(payload: &[u8]) -> Result<Sample> {
    let block = payload
        .get(TELEMETRY_OFFSET..MIN_FRAME_LEN)
        .ok_or(MonitorError::MalformedFrame { len: payload.len() })?;

    Ok(Sample {
        rpm: u16::from_le_bytes([block[0], block[1]]),
        device_metric1: block[2],
        duration_ticks: u16::from_le_bytes([block[3], block[4]]),
        rotation_ticks: u16::from_le_bytes([block[5], block[6]]),
    })
}

/// Format bytes as lowercase hex pairs separated by spaces.
#[must_use]
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Parse a hex-encoded payload as produced by [`hex_dump`].
///
/// Whitespace between byte pairs is optional. Returns `None` if the line
/// contains a non-hex character or an odd number of digits.
#[must_use]
pub fn parse_hex_frame(line: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = line
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .map(|b| char::from(b).to_digit(16).and_then(|d| u8::try_from(d).ok()))
        .collect::<Option<_>>()?;

    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }

    Some(digits.chunks_exact(2).map(|pair| pair[0] << 4 | pair[1]).collect())
}
