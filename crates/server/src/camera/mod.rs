//! Camera control subsystem
//!
//! The supervisor owns the lifecycle state machine, the reset controller
//! performs sysfs-level USB recovery, and the broadcaster fans paced preview
//! frames out to subscribers. Device I/O itself runs on the worker thread
//! behind the serialized queue in the `common` crate.

pub mod broadcast;
pub mod reset;
pub mod supervisor;

pub use broadcast::{BroadcastStats, PreviewBroadcaster, SubscriberId};
pub use reset::{BusReset, SysfsReset};
pub use supervisor::CameraSupervisor;
