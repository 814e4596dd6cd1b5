//! Camera device contract for rust-tethercam
//!
//! This crate defines the shared types, error taxonomy, and backend trait
//! used by the serialized access queue and the connection supervisor. Two
//! backend variants are provided: `GphotoCamera` drives the gphoto2 CLI as
//! an external process, `MockCamera` is a deterministic test double.

pub mod backend;
pub mod error;
pub mod gphoto;
pub mod mock;
pub mod types;

pub use backend::{CameraBackend, coerce_config_value};
pub use error::{CameraError, Result};
pub use gphoto::{GphotoCamera, GphotoSettings};
pub use mock::MockCamera;
pub use types::{
    CameraAbilities, CameraState, CameraStatus, CapturedPhoto, ConfigValue, PhotoMetadata,
    PreviewFrame, ReadyMode, WidgetKind,
};
