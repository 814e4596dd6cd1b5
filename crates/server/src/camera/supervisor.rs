//! Connection supervisor
//!
//! Owns the camera lifecycle state machine and the tiered recovery path:
//! plain reconnects first, USB bus reset when the protocol stalls, terminal
//! `Error` once both budgets run dry. All connect/restart/recovery sequences
//! run under one lifecycle lock so concurrent requests queue up instead of
//! racing each other.

use crate::camera::reset::BusReset;
use crate::config::{CameraSettings, RecoverySettings};
use camera::{
    CameraAbilities, CameraError, CameraState, CameraStatus, CapturedPhoto, ConfigValue, ReadyMode,
};
use common::{CameraEvent, CameraProxy};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct CaptureTracker {
    in_progress: bool,
    started: Option<Instant>,
    count: u64,
    last_at: Option<u64>,
}

pub struct CameraSupervisor {
    proxy: CameraProxy,
    state_tx: watch::Sender<CameraState>,
    /// Serializes connect/restart/recovery sequences
    lifecycle: AsyncMutex<()>,
    reset: Arc<dyn BusReset>,
    camera_cfg: CameraSettings,
    recovery_cfg: RecoverySettings,
    /// Plain reconnect attempts this cycle; reset on successful connect
    restart_attempts: AtomicU32,
    /// Bus resets this cycle; reset on successful connect
    bus_resets: AtomicU32,
    abilities: std::sync::Mutex<Option<CameraAbilities>>,
    capture: std::sync::Mutex<CaptureTracker>,
    recovery_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    worker: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl CameraSupervisor {
    pub fn new(
        proxy: CameraProxy,
        reset: Arc<dyn BusReset>,
        camera_cfg: CameraSettings,
        recovery_cfg: RecoverySettings,
        worker: std::thread::JoinHandle<()>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(CameraState::Disconnected);
        Arc::new(Self {
            proxy,
            state_tx,
            lifecycle: AsyncMutex::new(()),
            reset,
            camera_cfg,
            recovery_cfg,
            restart_attempts: AtomicU32::new(0),
            bus_resets: AtomicU32::new(0),
            abilities: std::sync::Mutex::new(None),
            capture: std::sync::Mutex::new(CaptureTracker::default()),
            recovery_task: std::sync::Mutex::new(None),
            worker: std::sync::Mutex::new(Some(worker)),
        })
    }

    /// Watch channel for state observation; external code only reads
    pub fn state_rx(&self) -> watch::Receiver<CameraState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> CameraState {
        *self.state_tx.borrow()
    }

    /// Spawn the recovery task that reacts to protocol stalls
    ///
    /// Exactly one task per supervisor; aborted by `shutdown`.
    pub fn start(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let events = self.proxy.events();
        let handle = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let CameraEvent::ProtocolStall { op, epoch } = event;
                supervisor.handle_stall(op, epoch).await;
            }
            debug!("Event channel closed, recovery task exiting");
        });
        if let Ok(mut slot) = self.recovery_task.lock() {
            *slot = Some(handle);
        }
    }

    /// Initial connect sequence
    pub async fn initialize(&self) -> Result<(), CameraError> {
        let _guard = self.lifecycle.lock().await;
        self.connect_locked().await
    }

    /// Operator-requested restart
    ///
    /// Resets the restart counter (operator intent overrides the automatic
    /// budget) and optionally forces a bus reset before reconnecting.
    pub async fn request_restart(&self, force_reset: bool) -> Result<(), CameraError> {
        let _guard = self.lifecycle.lock().await;
        info!("Restart requested (force_reset={})", force_reset);

        self.restart_attempts.store(0, Ordering::SeqCst);
        self.proxy.disconnect().await.ok();

        if force_reset {
            self.state_tx.send_replace(CameraState::Recovering);
            // Operator-forced resets are not charged to the automatic budget
            self.run_bus_reset().await;
        }

        self.connect_locked().await
    }

    /// Connect loop; caller must hold the lifecycle lock
    ///
    /// Plain failures burn the restart budget with a fixed delay between
    /// attempts; protocol stalls burn the bus-reset budget instead. Either
    /// budget running out leaves the state machine in terminal `Error`.
    async fn connect_locked(&self) -> Result<(), CameraError> {
        loop {
            self.state_tx.send_replace(CameraState::Connecting);

            match self.proxy.connect().await {
                Ok(()) => {
                    // New session: stall events stamped before this point
                    // are stale and must not bounce the fresh connection
                    self.proxy.advance_connection_epoch();
                    self.after_connect().await;
                    self.restart_attempts.store(0, Ordering::SeqCst);
                    self.bus_resets.store(0, Ordering::SeqCst);
                    self.state_tx
                        .send_replace(CameraState::Ready(ReadyMode::Idle));
                    info!("Camera connected");
                    return Ok(());
                }
                Err(e) if e.is_protocol_stall() => {
                    warn!("Connect attempt hit a protocol stall: {}", e);
                    self.state_tx.send_replace(CameraState::Error);
                    if !self.escalate_to_reset().await {
                        return Err(CameraError::RecoveryBudgetExhausted);
                    }
                    // Recovering -> Connecting regardless of reset outcome
                }
                Err(e) => {
                    let attempts = self.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(
                        "Connect attempt {}/{} failed: {}",
                        attempts, self.recovery_cfg.max_restart_attempts, e
                    );
                    if attempts >= self.recovery_cfg.max_restart_attempts {
                        self.state_tx.send_replace(CameraState::Error);
                        return Err(CameraError::ConnectionFailed {
                            attempt: attempts,
                            cause: e.to_string(),
                        });
                    }
                    tokio::time::sleep(self.recovery_cfg.restart_delay).await;
                }
            }
        }
    }

    /// Error -> Recovering -> (bus reset) transition
    ///
    /// Returns false when recovery is disabled or the reset budget is
    /// exhausted; the state machine then stays in terminal `Error`. The
    /// budget is charged whether or not the reset verifies.
    async fn escalate_to_reset(&self) -> bool {
        if !self.recovery_cfg.auto_recover {
            warn!("Automatic recovery disabled, staying in Error");
            return false;
        }
        let used = self.bus_resets.load(Ordering::SeqCst);
        if used >= self.recovery_cfg.max_bus_resets {
            warn!(
                "Bus reset budget exhausted ({}/{}), staying in Error",
                used, self.recovery_cfg.max_bus_resets
            );
            return false;
        }

        self.state_tx.send_replace(CameraState::Recovering);
        self.bus_resets.fetch_add(1, Ordering::SeqCst);
        self.run_bus_reset().await;
        true
    }

    async fn run_bus_reset(&self) {
        let reset = Arc::clone(&self.reset);
        let verified = tokio::task::spawn_blocking(move || reset.reset())
            .await
            .unwrap_or(false);
        if verified {
            info!("Bus reset completed, device re-enumerated");
        } else {
            warn!("Bus reset did not verify, reconnecting anyway");
        }
    }

    /// Post-connect housekeeping: cache abilities, apply tuning
    ///
    /// Tuning failures are logged and ignored; an imperfect capture target
    /// or ISO must never fail the connect sequence.
    async fn after_connect(&self) {
        match self.proxy.abilities().await {
            Ok(abilities) => {
                info!(
                    "Camera: {} on {} (preview {})",
                    abilities.model,
                    abilities.port,
                    if abilities.preview_supported {
                        "supported"
                    } else {
                        "unsupported"
                    }
                );
                if let Ok(mut cached) = self.abilities.lock() {
                    *cached = Some(abilities);
                }
            }
            Err(e) => warn!("Abilities query failed: {}", e),
        }

        self.best_effort_set(
            "settings",
            "capturetarget",
            ConfigValue::Text(self.camera_cfg.capture_target.clone()),
        )
        .await;
        self.best_effort_set(
            "imgsettings",
            "iso",
            ConfigValue::Text(self.camera_cfg.preview_iso.clone()),
        )
        .await;
    }

    async fn best_effort_set(&self, section: &str, option: &str, value: ConfigValue) {
        if let Err(e) = self.proxy.set_config(section, option, &value).await {
            debug!("Tuning {}/{} = {} skipped: {}", section, option, value, e);
        }
    }

    /// Enter live preview mode
    ///
    /// No-op success when already previewing. Devices without preview
    /// support still enter the mode; the backend serves its black-frame
    /// contract instead of erroring.
    pub async fn start_preview(&self) -> Result<(), CameraError> {
        match self.state() {
            CameraState::Ready(ReadyMode::Previewing) => Ok(()),
            CameraState::Ready(ReadyMode::Idle) => {
                self.best_effort_set("actions", "viewfinder", ConfigValue::Int(1))
                    .await;
                self.state_tx
                    .send_replace(CameraState::Ready(ReadyMode::Previewing));
                info!("Preview started");
                Ok(())
            }
            state => Err(CameraError::NotReady {
                state: state.to_string(),
            }),
        }
    }

    /// Leave live preview mode; a no-op when not previewing
    pub async fn stop_preview(&self) -> Result<(), CameraError> {
        if self.state() == CameraState::Ready(ReadyMode::Previewing) {
            self.best_effort_set("actions", "viewfinder", ConfigValue::Int(0))
                .await;
            self.state_tx
                .send_replace(CameraState::Ready(ReadyMode::Idle));
            info!("Preview stopped");
        }
        Ok(())
    }

    /// Capture a full-resolution photo
    ///
    /// Exclusive: a second capture while one is in flight is rejected with
    /// `CaptureAlreadyInProgress`. Capture preempts preview at the state
    /// layer; an already-admitted frame fetch finishes normally and the
    /// broadcaster pauses on its next tick. Ends in `Ready(Idle)` whether
    /// the capture succeeded or failed.
    pub async fn capture_photo(&self) -> Result<CapturedPhoto, CameraError> {
        match self.state() {
            CameraState::Ready(_) => {}
            state => {
                return Err(CameraError::NotReady {
                    state: state.to_string(),
                });
            }
        }

        {
            let mut tracker = self
                .capture
                .lock()
                .map_err(|_| CameraError::WorkerUnavailable)?;
            if tracker.in_progress {
                return Err(CameraError::CaptureAlreadyInProgress);
            }
            tracker.in_progress = true;
            tracker.started = Some(Instant::now());
        }

        // Capture wins over preview
        self.state_tx
            .send_replace(CameraState::Ready(ReadyMode::Capturing));

        self.best_effort_set("actions", "viewfinder", ConfigValue::Int(0))
            .await;
        self.best_effort_set(
            "imgsettings",
            "iso",
            ConfigValue::Text(self.camera_cfg.capture_iso.clone()),
        )
        .await;

        let result = self.proxy.capture_photo().await;

        self.best_effort_set(
            "imgsettings",
            "iso",
            ConfigValue::Text(self.camera_cfg.preview_iso.clone()),
        )
        .await;

        if let Ok(mut tracker) = self.capture.lock() {
            tracker.in_progress = false;
            tracker.started = None;
            if result.is_ok() {
                tracker.count += 1;
                tracker.last_at = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .ok()
                    .map(|d| d.as_secs());
            }
        }

        // Restore Idle unless recovery flipped the state mid-capture
        self.state_tx.send_if_modified(|state| {
            if *state == CameraState::Ready(ReadyMode::Capturing) {
                *state = CameraState::Ready(ReadyMode::Idle);
                true
            } else {
                false
            }
        });

        match &result {
            Ok(_) => info!("Capture completed"),
            Err(e) => warn!("Capture failed: {}", e),
        }
        result
    }

    /// Read a device configuration value
    pub async fn get_config(&self, section: &str, option: &str) -> Result<ConfigValue, CameraError> {
        self.require_ready()?;
        self.proxy.get_config(section, option).await
    }

    /// Write a device configuration value
    pub async fn set_config(
        &self,
        section: &str,
        option: &str,
        value: &ConfigValue,
    ) -> Result<(), CameraError> {
        self.require_ready()?;
        self.proxy.set_config(section, option, value).await
    }

    fn require_ready(&self) -> Result<(), CameraError> {
        let state = self.state();
        if state.is_ready() {
            Ok(())
        } else {
            Err(CameraError::NotReady {
                state: state.to_string(),
            })
        }
    }

    pub fn status(&self) -> CameraStatus {
        let state = self.state();
        let abilities = self.abilities.lock().ok().and_then(|a| a.clone());
        let (capture_in_progress, capture_elapsed_ms, capture_count, last_capture_at) =
            match self.capture.lock() {
                Ok(tracker) => (
                    tracker.in_progress,
                    tracker.started.map(|s| s.elapsed().as_millis() as u64),
                    tracker.count,
                    tracker.last_at,
                ),
                Err(_) => (false, None, 0, None),
            };

        CameraStatus {
            state,
            connected: state.is_ready(),
            abilities,
            restarts_remaining: self
                .recovery_cfg
                .max_restart_attempts
                .saturating_sub(self.restart_attempts.load(Ordering::SeqCst)),
            bus_resets_remaining: self
                .recovery_cfg
                .max_bus_resets
                .saturating_sub(self.bus_resets.load(Ordering::SeqCst)),
            capture_in_progress,
            capture_elapsed_ms,
            capture_count,
            last_capture_at,
        }
    }

    /// React to a protocol stall reported by any queue submitter
    ///
    /// Stalls arriving while a connect/recovery sequence is already running
    /// are duplicates of the same underlying fault and dropped. Stalls
    /// stamped with an epoch older than the current connection describe a
    /// device session that has already been recovered and are dropped too;
    /// without that check a second queued stall from the same wedge would
    /// reset a freshly reconnected camera.
    async fn handle_stall(&self, op: &'static str, epoch: u64) {
        if epoch < self.proxy.connection_epoch() {
            debug!("Dropping stale stall from '{}' (epoch {})", op, epoch);
            return;
        }
        match self.state() {
            CameraState::Connecting | CameraState::Recovering | CameraState::Error => {
                debug!("Dropping duplicate stall from '{}'", op);
                return;
            }
            _ => {}
        }

        let _guard = self.lifecycle.lock().await;
        // A sequence that held the lock may have handled this already
        if epoch < self.proxy.connection_epoch() {
            debug!("Stall from '{}' went stale while waiting for the lock", op);
            return;
        }
        match self.state() {
            CameraState::Connecting | CameraState::Recovering | CameraState::Error => {
                debug!("Stall from '{}' already being handled", op);
                return;
            }
            _ => {}
        }

        warn!("Protocol stall during '{}', starting recovery", op);
        self.state_tx.send_replace(CameraState::Error);

        if !self.escalate_to_reset().await {
            return;
        }
        if let Err(e) = self.connect_locked().await {
            warn!("Recovery reconnect failed: {}", e);
        }
    }

    /// Ordered teardown: recovery task, device session, worker thread
    pub async fn shutdown(&self) {
        info!("Shutting down camera supervisor");

        if let Ok(mut slot) = self.recovery_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }

        self.proxy.disconnect().await.ok();
        self.proxy.shutdown().await;
        self.state_tx.send_replace(CameraState::Disconnected);

        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            // Joining an OS thread blocks; keep it off the runtime thread
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("Camera worker thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::reset::RecordingReset;
    use camera::MockCamera;
    use common::{QueueTuning, create_camera_bridge, spawn_camera_worker};
    use std::time::Duration;

    fn fast_camera_cfg() -> CameraSettings {
        CameraSettings::default()
    }

    fn fast_recovery_cfg() -> RecoverySettings {
        RecoverySettings {
            auto_recover: true,
            max_restart_attempts: 3,
            restart_delay: Duration::from_millis(5),
            max_bus_resets: 2,
            usb_vendor_id: "04a9".to_string(),
            reset_settle: Duration::from_millis(1),
        }
    }

    fn fast_tuning() -> QueueTuning {
        QueueTuning {
            retry_base: Duration::from_millis(5),
            retry_cap: Duration::from_millis(20),
            max_retries: 3,
            op_timeout: Duration::from_secs(2),
            capture_timeout: Duration::from_secs(5),
            min_frame_interval: Duration::ZERO,
        }
    }

    fn build(
        mock: MockCamera,
        reset: Arc<RecordingReset>,
        recovery_cfg: RecoverySettings,
    ) -> Arc<CameraSupervisor> {
        let tuning = fast_tuning();
        let (proxy, ops) = create_camera_bridge(tuning.clone());
        let worker = spawn_camera_worker(Box::new(mock), ops, tuning);
        CameraSupervisor::new(proxy, reset, fast_camera_cfg(), recovery_cfg, worker)
    }

    fn refused() -> CameraError {
        CameraError::ConnectionFailed {
            attempt: 1,
            cause: "no answer".to_string(),
        }
    }

    #[tokio::test]
    async fn test_initialize_reaches_ready_idle() {
        let reset = Arc::new(RecordingReset::new(true));
        let supervisor = build(MockCamera::new(), reset.clone(), fast_recovery_cfg());

        supervisor.initialize().await.unwrap();
        assert_eq!(supervisor.state(), CameraState::Ready(ReadyMode::Idle));
        assert_eq!(reset.invocations(), 0);

        let status = supervisor.status();
        assert!(status.connected);
        assert_eq!(status.restarts_remaining, 3);
        assert_eq!(status.bus_resets_remaining, 2);
        assert!(status.abilities.is_some());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_budget_exhaustion_ends_in_error() {
        let reset = Arc::new(RecordingReset::new(true));
        let mock = MockCamera::new().with_connect_results(vec![
            Err(refused()),
            Err(refused()),
            Err(refused()),
        ]);
        let log = mock.call_log();
        let supervisor = build(mock, reset.clone(), fast_recovery_cfg());

        let err = supervisor.initialize().await.unwrap_err();
        assert!(matches!(err, CameraError::ConnectionFailed { attempt: 3, .. }));
        assert_eq!(supervisor.state(), CameraState::Error);
        assert!(!supervisor.status().connected);
        // Exactly three connect attempts, no bus reset for plain refusals
        let attempts = log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == "connect")
            .count();
        assert_eq!(attempts, 3);
        assert_eq!(reset.invocations(), 0);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_protocol_timeout_charged_to_reset_budget() {
        let reset = Arc::new(RecordingReset::new(true));
        let mock = MockCamera::new()
            .with_connect_results(vec![Err(CameraError::ProtocolTimeout), Ok(())]);
        let supervisor = build(mock, reset.clone(), fast_recovery_cfg());

        supervisor.initialize().await.unwrap();
        assert_eq!(supervisor.state(), CameraState::Ready(ReadyMode::Idle));
        assert_eq!(reset.invocations(), 1);

        // Both budgets reset to zero by the successful connect
        let status = supervisor.status();
        assert_eq!(status.restarts_remaining, 3);
        assert_eq!(status.bus_resets_remaining, 2);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_budget_exhaustion_is_terminal() {
        let reset = Arc::new(RecordingReset::new(true));
        let mock = MockCamera::new().with_connect_results(vec![
            Err(CameraError::ProtocolTimeout),
            Err(CameraError::ProtocolTimeout),
            Err(CameraError::ProtocolTimeout),
        ]);
        let supervisor = build(mock, reset.clone(), fast_recovery_cfg());

        let err = supervisor.initialize().await.unwrap_err();
        assert!(matches!(err, CameraError::RecoveryBudgetExhausted));
        assert_eq!(supervisor.state(), CameraState::Error);
        assert_eq!(reset.invocations(), 2);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_recover_disabled_stays_in_error() {
        let reset = Arc::new(RecordingReset::new(true));
        let mock =
            MockCamera::new().with_connect_results(vec![Err(CameraError::ProtocolTimeout)]);
        let cfg = RecoverySettings {
            auto_recover: false,
            ..fast_recovery_cfg()
        };
        let supervisor = build(mock, reset.clone(), cfg);

        let err = supervisor.initialize().await.unwrap_err();
        assert!(matches!(err, CameraError::RecoveryBudgetExhausted));
        assert_eq!(reset.invocations(), 0);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_preview_start_stop() {
        let reset = Arc::new(RecordingReset::new(true));
        let supervisor = build(MockCamera::new(), reset, fast_recovery_cfg());
        supervisor.initialize().await.unwrap();

        supervisor.start_preview().await.unwrap();
        assert_eq!(
            supervisor.state(),
            CameraState::Ready(ReadyMode::Previewing)
        );
        // Second start is a no-op success
        supervisor.start_preview().await.unwrap();

        supervisor.stop_preview().await.unwrap();
        assert_eq!(supervisor.state(), CameraState::Ready(ReadyMode::Idle));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_preview_rejected_when_disconnected() {
        let reset = Arc::new(RecordingReset::new(true));
        let supervisor = build(MockCamera::new(), reset, fast_recovery_cfg());

        let err = supervisor.start_preview().await.unwrap_err();
        assert!(matches!(err, CameraError::NotReady { .. }));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_capture_preempts_preview() {
        let reset = Arc::new(RecordingReset::new(true));
        let mock = MockCamera::new().with_op_delay(Duration::from_millis(30));
        let supervisor = build(mock, reset, fast_recovery_cfg());
        supervisor.initialize().await.unwrap();
        supervisor.start_preview().await.unwrap();

        let mut state_rx = supervisor.state_rx();
        let sup = Arc::clone(&supervisor);
        let capture = tokio::spawn(async move { sup.capture_photo().await });

        // Capturing is entered before the capture op completes
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if *state_rx.borrow() == CameraState::Ready(ReadyMode::Capturing) {
                    break;
                }
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("never entered Capturing");

        capture.await.unwrap().unwrap();
        assert_eq!(supervisor.state(), CameraState::Ready(ReadyMode::Idle));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_frame_fetch_during_capture_window() {
        use crate::camera::PreviewBroadcaster;
        use crate::config::BroadcastSettings;

        let reset = Arc::new(RecordingReset::new(true));
        let mock = MockCamera::new().with_op_delay(Duration::from_millis(20));
        let log = mock.call_log();
        let supervisor = build(mock, reset, fast_recovery_cfg());
        supervisor.initialize().await.unwrap();

        let broadcaster = PreviewBroadcaster::new(
            supervisor.proxy.clone(),
            supervisor.state_rx(),
            BroadcastSettings {
                subscriber_capacity: 4,
                idle_tick: Duration::from_millis(2),
                error_backoff: Duration::from_millis(2),
            },
        );
        let loop_handle = broadcaster.start();
        let (_id, mut rx) = broadcaster.attach();

        supervisor.start_preview().await.unwrap();
        // Frames are flowing before the capture begins
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no frame before capture")
            .expect("channel closed");

        supervisor.capture_photo().await.unwrap();

        // Between the pre-capture viewfinder teardown and the post-capture
        // ISO restore the state is Capturing the whole time, so a paused
        // broadcaster submits nothing into that stretch of the queue
        let entries = log.lock().unwrap().clone();
        let preamble = entries
            .iter()
            .position(|c| c == "set_config actions/viewfinder=0")
            .expect("capture preamble ran");
        let restore = entries
            .iter()
            .enumerate()
            .skip(preamble)
            .find(|(_, c)| c.as_str() == "set_config imgsettings/iso=1600")
            .map(|(i, _)| i)
            .expect("capture restore ran");
        assert!(
            entries[preamble..restore]
                .iter()
                .all(|c| c != "capture_preview_frame"),
            "frame fetch ran inside the capture window: {:?}",
            &entries[preamble..restore]
        );

        broadcaster.stop();
        let _ = tokio::time::timeout(Duration::from_secs(2), loop_handle).await;
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_capture_rejected() {
        let reset = Arc::new(RecordingReset::new(true));
        let mock = MockCamera::new().with_op_delay(Duration::from_millis(50));
        let supervisor = build(mock, reset, fast_recovery_cfg());
        supervisor.initialize().await.unwrap();

        let sup = Arc::clone(&supervisor);
        let first = tokio::spawn(async move { sup.capture_photo().await });

        // Wait until the first capture is marked in flight
        tokio::time::timeout(Duration::from_secs(2), async {
            while !supervisor.status().capture_in_progress {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("capture never started");

        let err = supervisor.capture_photo().await.unwrap_err();
        assert!(matches!(err, CameraError::CaptureAlreadyInProgress));

        first.await.unwrap().unwrap();
        assert_eq!(supervisor.status().capture_count, 1);
        assert!(supervisor.status().last_capture_at.is_some());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stall_event_triggers_recovery() {
        let reset = Arc::new(RecordingReset::new(true));
        let mock = MockCamera::new()
            .with_frame_results(vec![Err(CameraError::ProtocolTimeout)]);
        let supervisor = build(mock, reset.clone(), fast_recovery_cfg());
        supervisor.initialize().await.unwrap();
        supervisor.start();
        supervisor.start_preview().await.unwrap();

        // The failing fetch emits a stall event; the recovery task reacts
        let err = supervisor.proxy.fetch_preview_frame().await.unwrap_err();
        assert!(matches!(err, CameraError::ProtocolTimeout));

        tokio::time::timeout(Duration::from_secs(2), async {
            while supervisor.state() != CameraState::Ready(ReadyMode::Idle) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("recovery never completed");
        assert_eq!(reset.invocations(), 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_stall_from_same_wedge_recovers_once() {
        let reset = Arc::new(RecordingReset::new(true));
        let mock = MockCamera::new()
            .with_frame_results(vec![
                Err(CameraError::ProtocolTimeout),
                Err(CameraError::ProtocolTimeout),
            ])
            .with_op_delay(Duration::from_millis(20));
        let supervisor = build(mock, reset.clone(), fast_recovery_cfg());
        supervisor.initialize().await.unwrap();
        supervisor.start();
        supervisor.start_preview().await.unwrap();

        // Two fetches queued against the same wedged device; both time out
        // and both emit stall events
        let first = {
            let sup = Arc::clone(&supervisor);
            tokio::spawn(async move { sup.proxy.fetch_preview_frame().await })
        };
        let second = {
            let sup = Arc::clone(&supervisor);
            tokio::spawn(async move { sup.proxy.fetch_preview_frame().await })
        };
        first.await.unwrap().unwrap_err();
        second.await.unwrap().unwrap_err();

        tokio::time::timeout(Duration::from_secs(2), async {
            while supervisor.state() != CameraState::Ready(ReadyMode::Idle) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("recovery never completed");

        // The second event predates the reconnect; letting it drain must
        // not reset or bounce the fresh connection
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.state(), CameraState::Ready(ReadyMode::Idle));
        assert_eq!(reset.invocations(), 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_restart_resets_budget() {
        let reset = Arc::new(RecordingReset::new(true));
        let mock = MockCamera::new().with_connect_results(vec![
            Err(refused()),
            Err(refused()),
            Err(refused()),
            Ok(()),
        ]);
        let supervisor = build(mock, reset.clone(), fast_recovery_cfg());

        supervisor.initialize().await.unwrap_err();
        assert_eq!(supervisor.state(), CameraState::Error);

        // Operator restart clears the burnt budget and tries again
        supervisor.request_restart(false).await.unwrap();
        assert_eq!(supervisor.state(), CameraState::Ready(ReadyMode::Idle));
        assert_eq!(reset.invocations(), 0);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_forced_restart_invokes_reset() {
        let reset = Arc::new(RecordingReset::new(true));
        let supervisor = build(MockCamera::new(), reset.clone(), fast_recovery_cfg());
        supervisor.initialize().await.unwrap();

        supervisor.request_restart(true).await.unwrap();
        assert_eq!(supervisor.state(), CameraState::Ready(ReadyMode::Idle));
        assert_eq!(reset.invocations(), 1);
        // Forced reset is not charged to the automatic budget
        assert_eq!(supervisor.status().bus_resets_remaining, 2);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_config_passthrough_requires_ready() {
        let reset = Arc::new(RecordingReset::new(true));
        let supervisor = build(MockCamera::new(), reset, fast_recovery_cfg());

        let err = supervisor.get_config("imgsettings", "iso").await.unwrap_err();
        assert!(matches!(err, CameraError::NotReady { .. }));

        supervisor.initialize().await.unwrap();
        supervisor
            .set_config("imgsettings", "iso", &ConfigValue::Text("100".into()))
            .await
            .unwrap();
        let value = supervisor.get_config("imgsettings", "iso").await.unwrap();
        assert_eq!(value, ConfigValue::Text("100".to_string()));

        supervisor.shutdown().await;
    }
}
