use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid resolution '{0}' (expected WIDTHxHEIGHT)")]
    InvalidResolution(String),
}

/// Message types sent over the wire.
///
/// Everything travels as a JSON text frame tagged by `type`. The relay never
/// looks inside; only the two pipelines parse these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// Clock sync request, sent by the receiver
    #[serde(rename = "SingleTimeSync")]
    TimeSyncRequest {
        #[serde(rename = "requestTxTime")]
        request_tx_time: String,
    },
    /// Clock sync reply, sent by the sender
    #[serde(rename = "SingleTimeSyncResponse")]
    TimeSyncResponse {
        #[serde(rename = "requestTxTime")]
        request_tx_time: String,
        #[serde(rename = "responseTxTime")]
        response_tx_time: String,
        /// When the sender received the request. Absent from single-timestamp echoes.
        #[serde(rename = "responseRxTime", default, skip_serializing_if = "Option::is_none")]
        response_rx_time: Option<String>,
    },
    /// One compressed, encrypted frame plus its metadata
    #[serde(rename = "test")]
    Frame(FrameMessage),
    /// Any tag we don't know about
    #[serde(other)]
    Unknown,
}

impl WireMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frame envelope: metadata plus base64(nonce ‖ ciphertext)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub setup_description: String,
    pub frame_id: u64,
    pub filename: String,
    /// Capture time, RFC 3339 UTC with milliseconds
    pub timestamp: String,
    pub resolution: Resolution,
    #[serde(alias = "quality")]
    pub jpeg_quality: u8,
    pub size_kb: f64,
    pub compression_time_ms: f64,
    pub encryption_time_ms: f64,
    pub data: String,
}

/// Frame dimensions, carried on the wire as `"WIDTHxHEIGHT"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidResolution(s.to_string());
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl Serialize for Resolution {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
