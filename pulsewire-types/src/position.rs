//! Position events relayed between connected clients.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted sender id, in bytes.
pub const MAX_ID_LEN: usize = 64;

/// Longest accepted color string, in bytes.
pub const MAX_COLOR_LEN: usize = 32;

/// A sender's reported pointer coordinates.
///
/// Construct from untrusted input with [`PositionEvent::parse`]; anything
/// that does not match `{ id: string, x: number, y: number, color?: string }`
/// is rejected rather than coerced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl PositionEvent {
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            color: None,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    /// Parse and validate a JSON text frame.
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        let event: Self = serde_json::from_str(raw)?;
        event.validate()?;
        Ok(event)
    }

    /// Parse and validate a binary frame holding UTF-8 JSON.
    pub fn from_slice(raw: &[u8]) -> Result<Self, PayloadError> {
        let event: Self = serde_json::from_slice(raw)?;
        event.validate()?;
        Ok(event)
    }

    /// Check the constraints serde cannot express.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.id.is_empty() {
            return Err(PayloadError::EmptyId);
        }
        if self.id.len() > MAX_ID_LEN {
            return Err(PayloadError::IdTooLong(self.id.len()));
        }
        if !self.x.is_finite() || !self.y.is_finite() {
            return Err(PayloadError::NonFinite);
        }
        if let Some(color) = &self.color {
            if color.len() > MAX_COLOR_LEN {
                return Err(PayloadError::ColorTooLong(color.len()));
            }
        }
        Ok(())
    }
}

/// Why an inbound position payload was rejected.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("sender id is empty")]
    EmptyId,

    #[error("sender id is {0} bytes, limit is {MAX_ID_LEN}")]
    IdTooLong(usize),

    #[error("coordinates must be finite numbers")]
    NonFinite,

    #[error("color is {0} bytes, limit is {MAX_COLOR_LEN}")]
    ColorTooLong(usize),
}

/// Public identity of one position-channel connection.
///
/// Stable for the lifetime of the connection and attached to every event
/// it publishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderId(String);

impl SenderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SenderId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SenderId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Outbound frame on the position channel.
///
/// The event fields are flattened so the frame reads as
/// `{ id, x, y, color?, seq? }`; `seq` is present when the relay keeps a
/// resume buffer and can be handed back as `lastEventId` on reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    #[serde(flatten)]
    pub event: PositionEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}
