//! Common plumbing for rust-tethercam
//!
//! This crate provides the serialized access queue shared by the server:
//! the async channel bridge between the Tokio runtime and the dedicated
//! camera thread, the worker loop with transient-error retry, frame
//! pacing, logging setup, and shared test utilities.

pub mod channel;
pub mod error;
pub mod logging;
pub mod pacer;
pub mod queue;
pub mod test_utils;

pub use channel::{
    CameraEvent, CameraJob, CameraOps, CameraProxy, QueueTuning, create_camera_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use pacer::FramePacer;
pub use queue::{CameraWorker, spawn_camera_worker};
