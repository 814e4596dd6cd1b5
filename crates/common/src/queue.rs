//! Camera worker thread
//!
//! Dedicated OS thread that executes queued operations against the backend
//! one at a time, in submission order. Transient bus-busy errors are
//! retried in place with exponential backoff (which preserves FIFO order,
//! since the device thread cannot run anything else during the sleep
//! anyway); protocol stalls emit an event for the supervisor before the
//! caller's future resolves.

use crate::channel::{CameraEvent, CameraJob, CameraOps, QueueTuning, QueuedOp};
use camera::{CameraBackend, CameraError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Camera worker thread state
pub struct CameraWorker {
    backend: Box<dyn CameraBackend>,
    ops: CameraOps,
    tuning: QueueTuning,
}

impl CameraWorker {
    pub fn new(backend: Box<dyn CameraBackend>, ops: CameraOps, tuning: QueueTuning) -> Self {
        Self {
            backend,
            ops,
            tuning,
        }
    }

    /// Run the worker loop until Shutdown or all proxies are dropped
    pub fn run(mut self) {
        info!("Camera worker thread started");

        while let Some(job) = self.ops.recv_job() {
            match job {
                CameraJob::Shutdown => {
                    info!("Camera worker shutting down");
                    break;
                }
                CameraJob::Execute(op) => self.execute(op),
            }
        }

        self.backend.disconnect();
        info!("Camera worker thread stopped");
    }

    /// Execute one operation with transient-error retry
    fn execute(&mut self, mut op: QueuedOp) {
        loop {
            // Panics in an operation must not take the thread down
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (op.func)(self.backend.as_mut())
            }));

            let result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    error!("Panic in camera operation '{}'", op.label);
                    Err(CameraError::ConnectionFailed {
                        attempt: op.retries,
                        cause: format!("operation '{}' panicked", op.label),
                    })
                }
            };

            match result {
                Ok(output) => {
                    let _ = op.reply.send(Ok(output));
                    return;
                }
                Err(e) if e.is_transient() && op.retries < op.max_retries => {
                    op.retries += 1;
                    let delay = backoff_delay(&self.tuning, op.retries);
                    warn!(
                        "Transient I/O error on '{}', retry {}/{} after {:?}",
                        op.label, op.retries, op.max_retries, delay
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    if e.is_protocol_stall() {
                        debug!("Protocol stall on '{}', notifying supervisor", op.label);
                        let event = CameraEvent::ProtocolStall {
                            op: op.label,
                            epoch: self.ops.current_epoch(),
                        };
                        if let Err(send_err) = self.ops.send_event(event) {
                            warn!("Could not deliver stall event: {}", send_err);
                        }
                    }
                    let _ = op.reply.send(Err(e));
                    return;
                }
            }
        }
    }
}

/// Exponential backoff delay for the given retry attempt (1-based)
fn backoff_delay(tuning: &QueueTuning, attempt: u32) -> Duration {
    let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
    (tuning.retry_base * factor).min(tuning.retry_cap)
}

/// Spawn the camera worker thread
///
/// Creates a named OS thread owning the backend; it runs until a Shutdown
/// job arrives or every proxy handle is dropped.
pub fn spawn_camera_worker(
    backend: Box<dyn CameraBackend>,
    ops: CameraOps,
    tuning: QueueTuning,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("camera-worker".to_string())
        .spawn(move || {
            CameraWorker::new(backend, ops, tuning).run();
        })
        .expect("Failed to spawn camera worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{QueueTuning, create_camera_bridge};
    use camera::MockCamera;

    fn short_tuning() -> QueueTuning {
        QueueTuning {
            retry_base: Duration::from_millis(10),
            retry_cap: Duration::from_millis(40),
            max_retries: 3,
            op_timeout: Duration::from_secs(2),
            capture_timeout: Duration::from_secs(2),
            min_frame_interval: Duration::ZERO,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let tuning = QueueTuning::default();
        assert_eq!(backoff_delay(&tuning, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&tuning, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&tuning, 3), Duration::from_millis(400));
        // Capped at the maximum delay
        assert_eq!(backoff_delay(&tuning, 5), Duration::from_secs(1));
        assert_eq!(backoff_delay(&tuning, 30), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_worker_executes_and_shuts_down() {
        let tuning = short_tuning();
        let (proxy, ops) = create_camera_bridge(tuning.clone());
        let mock = MockCamera::new();
        let log = mock.call_log();
        let handle = spawn_camera_worker(Box::new(mock), ops, tuning);

        proxy.connect().await.unwrap();
        proxy.shutdown().await;
        handle.join().unwrap();

        let entries = log.lock().unwrap();
        // disconnect is the worker's own teardown on exit
        assert_eq!(*entries, vec!["connect", "disconnect"]);
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let tuning = short_tuning();
        let (proxy, ops) = create_camera_bridge(tuning.clone());
        let mock = MockCamera::new().with_connect_results(vec![Err(
            CameraError::ConnectionFailed {
                attempt: 1,
                cause: "refused".to_string(),
            },
        )]);
        let log = mock.call_log();
        let handle = spawn_camera_worker(Box::new(mock), ops, tuning);

        assert!(matches!(
            proxy.connect().await,
            Err(CameraError::ConnectionFailed { .. })
        ));

        proxy.shutdown().await;
        handle.join().unwrap();

        // Exactly one connect attempt, no retry
        let connects = log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| *l == "connect")
            .count();
        assert_eq!(connects, 1);
    }
}
