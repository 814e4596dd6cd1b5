//! Async channel bridge between the Tokio runtime and the camera thread
//!
//! All device I/O happens on one dedicated worker thread; async callers
//! submit operations through `CameraProxy` and suspend awaiting a oneshot
//! reply. Submission order is execution order, and the worker never runs
//! more than one operation at a time.

use crate::pacer::FramePacer;
use async_channel::{Receiver, Sender, bounded};
use camera::{
    CameraAbilities, CameraBackend, CameraError, CapturedPhoto, ConfigValue, PreviewFrame,
};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Queue tuning knobs (retry backoff, caller timeouts, frame pacing)
#[derive(Debug, Clone)]
pub struct QueueTuning {
    /// Initial delay for transient-error retries, doubled per attempt
    pub retry_base: Duration,
    /// Upper bound on a single retry delay
    pub retry_cap: Duration,
    /// Per-operation transient retry limit
    pub max_retries: u32,
    /// Caller-boundary await timeout for ordinary operations
    pub op_timeout: Duration,
    /// Caller-boundary await timeout for connect and capture
    pub capture_timeout: Duration,
    /// Minimum interval between admitted preview-frame fetches
    pub min_frame_interval: Duration,
}

impl Default for QueueTuning {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(1),
            max_retries: 3,
            op_timeout: Duration::from_secs(5),
            capture_timeout: Duration::from_secs(15),
            min_frame_interval: Duration::from_millis(50),
        }
    }
}

/// Result payload of a queued operation
#[derive(Debug)]
pub enum OpOutput {
    None,
    Frame(Option<Bytes>),
    Photo(CapturedPhoto),
    Config(ConfigValue),
    Abilities(CameraAbilities),
}

/// Closure executed against the backend on the worker thread
///
/// `FnMut` because the worker re-runs it in place on transient retries.
pub type OpFn = Box<dyn FnMut(&mut dyn CameraBackend) -> camera::Result<OpOutput> + Send>;

/// A queued unit of work
pub struct QueuedOp {
    /// Short label for logs and stall events
    pub label: &'static str,
    /// The operation itself
    pub func: OpFn,
    /// Transient retries consumed so far
    pub retries: u32,
    /// Per-operation retry bound
    pub max_retries: u32,
    /// Reply channel back to the submitting caller
    pub reply: tokio::sync::oneshot::Sender<camera::Result<OpOutput>>,
}

impl std::fmt::Debug for QueuedOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedOp")
            .field("label", &self.label)
            .field("retries", &self.retries)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Jobs from the Tokio runtime to the camera thread
#[derive(Debug)]
pub enum CameraJob {
    /// Execute an operation against the backend
    Execute(QueuedOp),
    /// Shut the worker thread down gracefully
    Shutdown,
}

/// Events from the camera thread back to the runtime
#[derive(Debug, Clone)]
pub enum CameraEvent {
    /// An operation failed with a protocol timeout; the device's command
    /// state machine is stuck and needs bus-level recovery
    ProtocolStall {
        /// Label of the failing operation
        op: &'static str,
        /// Connection epoch at emission time; a consumer drops events
        /// stamped before the current epoch as stale
        epoch: u64,
    },
}

/// Handle for the Tokio runtime (async side)
#[derive(Clone)]
pub struct CameraProxy {
    job_tx: Sender<CameraJob>,
    event_rx: Receiver<CameraEvent>,
    pacer: Arc<FramePacer>,
    frame_seq: Arc<AtomicU64>,
    conn_epoch: Arc<AtomicU64>,
    tuning: QueueTuning,
}

impl CameraProxy {
    /// Submit an operation and await its result with a caller timeout
    ///
    /// A timed-out await abandons the reply only; the operation still runs
    /// to completion on the worker thread, since truncating a device
    /// command risks leaving the hardware protocol inconsistent.
    async fn submit(
        &self,
        label: &'static str,
        timeout: Duration,
        max_retries: u32,
        func: OpFn,
    ) -> camera::Result<OpOutput> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let op = QueuedOp {
            label,
            func,
            retries: 0,
            max_retries,
            reply: reply_tx,
        };

        self.job_tx
            .send(CameraJob::Execute(op))
            .await
            .map_err(|_| CameraError::WorkerUnavailable)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CameraError::WorkerUnavailable),
            Err(_) => Err(CameraError::OpTimedOut {
                op: label,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Establish the device connection
    pub async fn connect(&self) -> camera::Result<()> {
        self.submit(
            "connect",
            self.tuning.capture_timeout,
            self.tuning.max_retries,
            Box::new(|b| b.connect().map(|_| OpOutput::None)),
        )
        .await
        .map(|_| ())
    }

    /// Release the device connection (best effort)
    pub async fn disconnect(&self) -> camera::Result<()> {
        self.submit(
            "disconnect",
            self.tuning.op_timeout,
            0,
            Box::new(|b| {
                b.disconnect();
                Ok(OpOutput::None)
            }),
        )
        .await
        .map(|_| ())
    }

    /// Query device abilities
    pub async fn abilities(&self) -> camera::Result<CameraAbilities> {
        let out = self
            .submit(
                "abilities",
                self.tuning.op_timeout,
                self.tuning.max_retries,
                Box::new(|b| b.abilities().map(OpOutput::Abilities)),
            )
            .await?;
        let OpOutput::Abilities(abilities) = out else {
            return Err(CameraError::WorkerUnavailable);
        };
        Ok(abilities)
    }

    /// Capture a full-quality photo
    pub async fn capture_photo(&self) -> camera::Result<CapturedPhoto> {
        let out = self
            .submit(
                "capture_photo",
                self.tuning.capture_timeout,
                self.tuning.max_retries,
                Box::new(|b| b.capture_photo().map(OpOutput::Photo)),
            )
            .await?;
        let OpOutput::Photo(photo) = out else {
            return Err(CameraError::WorkerUnavailable);
        };
        Ok(photo)
    }

    /// Rate-limited preview frame fetch
    ///
    /// Pacing is applied *before* admission: when the minimum inter-frame
    /// interval has not elapsed this returns `Ok(None)` without enqueueing
    /// any work. The pacer is marked only on an actually delivered frame.
    pub async fn fetch_preview_frame(&self) -> camera::Result<Option<PreviewFrame>> {
        if !self.pacer.try_admit() {
            return Ok(None);
        }

        let out = self
            .submit(
                "capture_preview_frame",
                self.tuning.op_timeout,
                self.tuning.max_retries,
                Box::new(|b| b.capture_preview_frame().map(OpOutput::Frame)),
            )
            .await?;

        match out {
            OpOutput::Frame(Some(data)) => {
                self.pacer.mark_delivered();
                let seq = self.frame_seq.fetch_add(1, Ordering::Relaxed) + 1;
                Ok(Some(PreviewFrame {
                    seq,
                    data,
                    captured_at: Instant::now(),
                }))
            }
            _ => Ok(None),
        }
    }

    /// Read a configuration value
    pub async fn get_config(&self, section: &str, option: &str) -> camera::Result<ConfigValue> {
        let section = section.to_string();
        let option = option.to_string();
        let out = self
            .submit(
                "get_config",
                self.tuning.op_timeout,
                self.tuning.max_retries,
                Box::new(move |b| b.get_config(&section, &option).map(OpOutput::Config)),
            )
            .await?;
        let OpOutput::Config(value) = out else {
            return Err(CameraError::WorkerUnavailable);
        };
        Ok(value)
    }

    /// Write a configuration value
    pub async fn set_config(
        &self,
        section: &str,
        option: &str,
        value: &ConfigValue,
    ) -> camera::Result<()> {
        let section = section.to_string();
        let option = option.to_string();
        let value = value.clone();
        self.submit(
            "set_config",
            self.tuning.op_timeout,
            self.tuning.max_retries,
            Box::new(move |b| b.set_config(&section, &option, &value).map(|_| OpOutput::None)),
        )
        .await
        .map(|_| ())
    }

    /// Receiver for worker events (protocol stalls)
    ///
    /// Intended for a single consumer (the connection supervisor).
    pub fn events(&self) -> Receiver<CameraEvent> {
        self.event_rx.clone()
    }

    /// Current connection epoch
    pub fn connection_epoch(&self) -> u64 {
        self.conn_epoch.load(Ordering::SeqCst)
    }

    /// Mark the start of a new device session
    ///
    /// Stall events stamped before this call describe the previous session
    /// and must not trigger recovery against the new one.
    pub fn advance_connection_epoch(&self) -> u64 {
        self.conn_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queue tuning in effect
    pub fn tuning(&self) -> &QueueTuning {
        &self.tuning
    }

    /// Ask the worker thread to drain and exit
    pub async fn shutdown(&self) {
        let _ = self.job_tx.send(CameraJob::Shutdown).await;
    }
}

/// Handle for the camera thread (blocking side)
pub struct CameraOps {
    pub(crate) job_rx: Receiver<CameraJob>,
    event_tx: Sender<CameraEvent>,
    conn_epoch: Arc<AtomicU64>,
}

impl CameraOps {
    /// Receive the next job, blocking; `None` once all proxies are gone
    pub fn recv_job(&self) -> Option<CameraJob> {
        self.job_rx.recv_blocking().ok()
    }

    /// Connection epoch to stamp into emitted events
    pub fn current_epoch(&self) -> u64 {
        self.conn_epoch.load(Ordering::SeqCst)
    }

    /// Send an event to the runtime (blocking)
    pub fn send_event(&self, event: CameraEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and the camera thread
///
/// Returns (CameraProxy for the runtime, CameraOps for the worker thread).
pub fn create_camera_bridge(tuning: QueueTuning) -> (CameraProxy, CameraOps) {
    let (job_tx, job_rx) = bounded(64);
    let (event_tx, event_rx) = bounded(64);
    let pacer = Arc::new(FramePacer::new(tuning.min_frame_interval));
    let conn_epoch = Arc::new(AtomicU64::new(0));

    (
        CameraProxy {
            job_tx,
            event_rx,
            pacer,
            frame_seq: Arc::new(AtomicU64::new(0)),
            conn_epoch: Arc::clone(&conn_epoch),
            tuning,
        },
        CameraOps {
            job_rx,
            event_tx,
            conn_epoch,
        },
    )
}
