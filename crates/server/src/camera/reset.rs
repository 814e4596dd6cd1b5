//! USB bus reset controller
//!
//! Recovers a wedged camera by toggling its sysfs `authorized` flag, which
//! forces the kernel to deauthorize and re-enumerate the device. This is the
//! escalation path when the PTP protocol state machine stops responding and
//! plain reconnects no longer help.
//!
//! All file I/O and settle sleeps are blocking; the supervisor runs the
//! controller under `spawn_blocking`.

use camera::CameraError;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Settle time between deauthorizing and re-authorizing the device
const DEAUTHORIZE_SETTLE: Duration = Duration::from_secs(1);

/// Bus-level recovery mechanism
///
/// `reset` returns whether the device re-enumerated afterwards; it never
/// fails, because the supervisor treats an unverified reset the same as a
/// failed one (the budget is charged either way).
pub trait BusReset: Send + Sync {
    fn reset(&self) -> bool;
}

/// Sysfs-backed bus reset for Linux hosts
pub struct SysfsReset {
    sysfs_root: PathBuf,
    vendor_id: String,
    reauthorize_settle: Duration,
    deauthorize_settle: Duration,
    /// Last located device node, revalidated before reuse
    cached_node: Mutex<Option<PathBuf>>,
}

impl SysfsReset {
    pub fn new(vendor_id: String, reauthorize_settle: Duration) -> Self {
        Self::with_root(
            PathBuf::from("/sys/bus/usb/devices"),
            vendor_id,
            reauthorize_settle,
        )
    }

    /// Build against an alternate sysfs root (tests use a temp tree)
    pub fn with_root(sysfs_root: PathBuf, vendor_id: String, reauthorize_settle: Duration) -> Self {
        Self {
            sysfs_root,
            vendor_id,
            reauthorize_settle,
            deauthorize_settle: DEAUTHORIZE_SETTLE,
            cached_node: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_deauthorize_settle(mut self, settle: Duration) -> Self {
        self.deauthorize_settle = settle;
        self
    }

    /// Find the sysfs node of the device with the configured vendor id
    ///
    /// Prefers the cached node when it still matches; otherwise scans
    /// `<root>/*/idVendor`.
    fn locate(&self) -> Result<PathBuf, CameraError> {
        let mut cached = self
            .cached_node
            .lock()
            .map_err(|_| CameraError::DeviceNotFound)?;

        if let Some(node) = cached.as_ref() {
            if self.node_matches(node) {
                return Ok(node.clone());
            }
            debug!("Cached sysfs node {} is stale, rescanning", node.display());
            *cached = None;
        }

        let entries = fs::read_dir(&self.sysfs_root).map_err(|e| {
            warn!(
                "Cannot read sysfs root {}: {}",
                self.sysfs_root.display(),
                e
            );
            CameraError::DeviceNotFound
        })?;

        for entry in entries.flatten() {
            let node = entry.path();
            if self.node_matches(&node) {
                debug!("Located camera at sysfs node {}", node.display());
                *cached = Some(node.clone());
                return Ok(node);
            }
        }

        Err(CameraError::DeviceNotFound)
    }

    fn node_matches(&self, node: &Path) -> bool {
        match fs::read_to_string(node.join("idVendor")) {
            Ok(vendor) => vendor.trim().eq_ignore_ascii_case(&self.vendor_id),
            Err(_) => false,
        }
    }

    fn write_authorized(&self, node: &Path, value: &str) -> Result<(), CameraError> {
        let path = node.join("authorized");
        fs::write(&path, value).map_err(|e| {
            if e.kind() == ErrorKind::PermissionDenied {
                CameraError::ResetPermissionDenied {
                    path: path.display().to_string(),
                }
            } else {
                warn!("Failed to write {} to {}: {}", value, path.display(), e);
                CameraError::DeviceNotFound
            }
        })
    }
}

impl BusReset for SysfsReset {
    fn reset(&self) -> bool {
        let node = match self.locate() {
            Ok(node) => node,
            Err(_) => {
                warn!(
                    "No USB device with vendor id {} under {}",
                    self.vendor_id,
                    self.sysfs_root.display()
                );
                return false;
            }
        };

        info!("Resetting USB device at {}", node.display());

        if let Err(e) = self.write_authorized(&node, "0") {
            error!("Deauthorize failed: {}", e);
            return false;
        }
        std::thread::sleep(self.deauthorize_settle);

        if let Err(e) = self.write_authorized(&node, "1") {
            error!("Reauthorize failed: {}", e);
            return false;
        }
        std::thread::sleep(self.reauthorize_settle);

        // The device gets a fresh address on re-enumeration; the cached
        // node may now point elsewhere
        if let Ok(mut cached) = self.cached_node.lock() {
            *cached = None;
        }

        match self.locate() {
            Ok(node) => {
                info!("USB device re-enumerated at {}", node.display());
                true
            }
            Err(_) => {
                error!(
                    "USB device with vendor id {} did not re-enumerate after reset",
                    self.vendor_id
                );
                false
            }
        }
    }
}

/// Recording fake for supervisor tests
#[cfg(test)]
pub(crate) struct RecordingReset {
    invocations: std::sync::atomic::AtomicU32,
    outcome: bool,
}

#[cfg(test)]
impl RecordingReset {
    pub(crate) fn new(outcome: bool) -> Self {
        Self {
            invocations: std::sync::atomic::AtomicU32::new(0),
            outcome,
        }
    }

    pub(crate) fn invocations(&self) -> u32 {
        self.invocations.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl BusReset for RecordingReset {
    fn reset(&self) -> bool {
        self.invocations
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.outcome
    }
}
