//! Camera state and data type definitions
//!
//! This module defines the connection state machine values, frame and photo
//! payloads, device abilities, and configuration value types shared between
//! the queue, the supervisor, and the backends.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Sub-mode while the camera is connected and operational
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadyMode {
    /// Connected, no preview or capture running
    Idle,
    /// Live preview streaming is active
    Previewing,
    /// A full-quality capture is in flight
    Capturing,
}

/// Connection state machine value
///
/// Owned exclusively by the connection supervisor; all other code observes
/// it through a watch channel and never mutates it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraState {
    /// No device handle, no connection attempt in flight
    Disconnected,
    /// Connect sequence running (initial or after restart)
    Connecting,
    /// Connected and operational
    Ready(ReadyMode),
    /// Bus-level recovery (deauthorize/reauthorize) in progress
    Recovering,
    /// Connection lost; automatic recovery exhausted or disabled
    Error,
}

impl CameraState {
    /// True while the device handle is live
    pub fn is_ready(&self) -> bool {
        matches!(self, CameraState::Ready(_))
    }
}

impl std::fmt::Display for CameraState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraState::Disconnected => write!(f, "disconnected"),
            CameraState::Connecting => write!(f, "connecting"),
            CameraState::Ready(ReadyMode::Idle) => write!(f, "ready"),
            CameraState::Ready(ReadyMode::Previewing) => write!(f, "previewing"),
            CameraState::Ready(ReadyMode::Capturing) => write!(f, "capturing"),
            CameraState::Recovering => write!(f, "recovering"),
            CameraState::Error => write!(f, "error"),
        }
    }
}

/// A single live preview frame
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    /// Monotonically increasing frame sequence number
    pub seq: u64,
    /// JPEG payload; cloning is cheap (reference counted)
    pub data: Bytes,
    /// Instant the frame was delivered by the device
    pub captured_at: Instant,
}

/// Metadata recorded alongside a full capture
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhotoMetadata {
    /// Camera model string, if the device reports one
    pub model: Option<String>,
    /// ISO setting at capture time
    pub iso: Option<String>,
    /// Shutter speed at capture time
    pub shutter_speed: Option<String>,
    /// Aperture at capture time
    pub aperture: Option<String>,
    /// Unix timestamp of the capture
    pub timestamp: u64,
}

/// A full-quality captured photo
#[derive(Debug, Clone)]
pub struct CapturedPhoto {
    /// Image payload (typically JPEG)
    pub data: Bytes,
    /// Capture metadata
    pub metadata: PhotoMetadata,
}

/// Device abilities reported after connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraAbilities {
    /// Whether the device supports live preview capture
    pub preview_supported: bool,
    /// Camera model string
    pub model: String,
    /// Port the device is attached on (e.g. "usb:001,004")
    pub port: String,
}

/// A typed camera configuration value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Free text or enumerated choice
    Text(String),
    /// Toggle (0/1) or date (unix timestamp)
    Int(i64),
    /// Numeric range value
    Float(f64),
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Text(s) => write!(f, "{}", s),
            ConfigValue::Int(i) => write!(f, "{}", i),
            ConfigValue::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::Text(s.to_string())
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        ConfigValue::Int(i)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

/// Widget kind of a configuration entry, drives value coercion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetKind {
    /// Boolean toggle, applied as integer 0/1
    Toggle,
    /// Enumerated choice, applied as a string from the allowed set
    Choice(Vec<String>),
    /// Numeric range, applied as float
    Range,
    /// Free text
    Text,
    /// Date, applied as integer unix timestamp
    Date,
}

/// Status snapshot exposed to outer layers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraStatus {
    /// Current connection state
    pub state: CameraState,
    /// True while the device handle is live
    pub connected: bool,
    /// Cached abilities from the last successful connect
    pub abilities: Option<CameraAbilities>,
    /// Plain reconnect attempts remaining before terminal Error
    pub restarts_remaining: u32,
    /// Bus reset attempts remaining before terminal Error
    pub bus_resets_remaining: u32,
    /// True while a capture operation is in flight
    pub capture_in_progress: bool,
    /// Milliseconds the in-flight capture has been running
    pub capture_elapsed_ms: Option<u64>,
    /// Total captures completed since startup
    pub capture_count: u64,
    /// Unix timestamp of the last completed capture
    pub last_capture_at: Option<u64>,
}
