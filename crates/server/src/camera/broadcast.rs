//! Preview frame broadcaster
//!
//! Single fetch loop that pulls paced preview frames through the serialized
//! queue and fans them out to any number of subscribers. With zero
//! subscribers the loop parks on a `Notify` and touches the device not at
//! all; slow subscribers lose frames individually without affecting their
//! peers.

use crate::config::BroadcastSettings;
use camera::{CameraState, PreviewFrame, ReadyMode};
use common::CameraProxy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Consecutive fetch failures before the log level escalates
const ERROR_ESCALATION_THRESHOLD: u32 = 10;

/// Handle identifying an attached preview consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

/// Broadcaster statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub subscribers: usize,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub consecutive_fetch_errors: u32,
    /// Smoothed frames-per-second estimate
    pub fps: f64,
}

#[derive(Default)]
struct Stats {
    frames_sent: u64,
    frames_dropped: u64,
    consecutive_fetch_errors: u32,
    fps: f64,
    last_frame_at: Option<Instant>,
}

impl Stats {
    fn record_frame(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_frame_at {
            let delta = now.duration_since(last).as_secs_f64();
            if delta > 0.0 {
                self.fps = self.fps * 0.8 + (1.0 / delta) * 0.2;
            }
        }
        self.last_frame_at = now.into();
        self.consecutive_fetch_errors = 0;
    }
}

struct Shared {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<PreviewFrame>>>,
    next_id: AtomicU64,
    wake: Notify,
    running: AtomicBool,
    stats: Mutex<Stats>,
}

pub struct PreviewBroadcaster {
    shared: Arc<Shared>,
    proxy: CameraProxy,
    state_rx: watch::Receiver<CameraState>,
    settings: BroadcastSettings,
}

impl PreviewBroadcaster {
    pub fn new(
        proxy: CameraProxy,
        state_rx: watch::Receiver<CameraState>,
        settings: BroadcastSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                wake: Notify::new(),
                running: AtomicBool::new(false),
                stats: Mutex::new(Stats::default()),
            }),
            proxy,
            state_rx,
            settings,
        }
    }

    /// Attach a new subscriber
    ///
    /// Wakes the fetch loop if it was parked. Detach by id or by dropping
    /// the receiver; a closed channel is cleaned up on the next delivery.
    pub fn attach(&self) -> (SubscriberId, mpsc::Receiver<PreviewFrame>) {
        let id = SubscriberId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(self.settings.subscriber_capacity);

        if let Ok(mut subscribers) = self.shared.subscribers.lock() {
            subscribers.insert(id, tx);
            info!("Preview subscriber {:?} attached ({} total)", id, subscribers.len());
        }
        self.shared.wake.notify_one();
        (id, rx)
    }

    /// Detach a subscriber by id
    pub fn detach(&self, id: SubscriberId) {
        if let Ok(mut subscribers) = self.shared.subscribers.lock() {
            if subscribers.remove(&id).is_some() {
                info!("Preview subscriber {:?} detached ({} left)", id, subscribers.len());
            }
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        let subscribers = self
            .shared
            .subscribers
            .lock()
            .map(|s| s.len())
            .unwrap_or(0);
        let stats = match self.shared.stats.lock() {
            Ok(stats) => stats,
            Err(_) => return BroadcastStats::default(),
        };
        BroadcastStats {
            subscribers,
            frames_sent: stats.frames_sent,
            frames_dropped: stats.frames_dropped,
            consecutive_fetch_errors: stats.consecutive_fetch_errors,
            fps: stats.fps,
        }
    }

    /// Spawn the fetch loop
    ///
    /// The loop only ends through `stop`; fetch failures back off and
    /// continue.
    pub fn start(&self) -> JoinHandle<()> {
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let proxy = self.proxy.clone();
        let state_rx = self.state_rx.clone();
        let settings = self.settings.clone();

        tokio::spawn(async move {
            info!("Preview broadcaster started");
            run_loop(shared, proxy, state_rx, settings).await;
            info!("Preview broadcaster stopped");
        })
    }

    /// Signal the fetch loop to exit
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    proxy: CameraProxy,
    state_rx: watch::Receiver<CameraState>,
    settings: BroadcastSettings,
) {
    while shared.running.load(Ordering::SeqCst) {
        let has_subscribers = shared
            .subscribers
            .lock()
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !has_subscribers {
            // Park with zero device interaction until someone attaches
            shared.wake.notified().await;
            continue;
        }

        if *state_rx.borrow() != CameraState::Ready(ReadyMode::Previewing) {
            tokio::time::sleep(settings.idle_tick).await;
            continue;
        }

        match proxy.fetch_preview_frame().await {
            Ok(Some(frame)) => {
                fan_out(&shared, frame);
            }
            Ok(None) => {
                // Paced out or no frame ready yet
                tokio::time::sleep(settings.error_backoff).await;
            }
            Err(e) => {
                let consecutive = match shared.stats.lock() {
                    Ok(mut stats) => {
                        stats.consecutive_fetch_errors += 1;
                        stats.consecutive_fetch_errors
                    }
                    Err(_) => 0,
                };
                if consecutive == ERROR_ESCALATION_THRESHOLD {
                    warn!("{} consecutive preview fetch failures, last: {}", consecutive, e);
                } else {
                    debug!("Preview fetch failed: {}", e);
                }
                tokio::time::sleep(settings.error_backoff).await;
            }
        }
    }
}

fn fan_out(shared: &Shared, frame: PreviewFrame) {
    let mut closed = Vec::new();
    let mut sent = 0u64;
    let mut dropped = 0u64;

    if let Ok(subscribers) = shared.subscribers.lock() {
        for (id, tx) in subscribers.iter() {
            // Bytes clone is a refcount bump, not a copy
            match tx.try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!("Subscriber {:?} is slow, dropping frame {}", id, frame.seq);
                    dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
    }

    if !closed.is_empty() {
        if let Ok(mut subscribers) = shared.subscribers.lock() {
            for id in closed {
                subscribers.remove(&id);
                debug!("Subscriber {:?} went away, removed", id);
            }
        }
    }

    if let Ok(mut stats) = shared.stats.lock() {
        stats.frames_sent += sent;
        stats.frames_dropped += dropped;
        stats.record_frame();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera::MockCamera;
    use common::{QueueTuning, create_camera_bridge, spawn_camera_worker};
    use std::time::Duration;

    fn test_settings() -> BroadcastSettings {
        BroadcastSettings {
            subscriber_capacity: 4,
            idle_tick: Duration::from_millis(5),
            error_backoff: Duration::from_millis(5),
        }
    }

    fn test_tuning() -> QueueTuning {
        QueueTuning {
            min_frame_interval: Duration::ZERO,
            ..QueueTuning::default()
        }
    }

    struct Rig {
        broadcaster: PreviewBroadcaster,
        state_tx: watch::Sender<CameraState>,
        proxy: CameraProxy,
        worker: std::thread::JoinHandle<()>,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn rig(initial: CameraState) -> Rig {
        let tuning = test_tuning();
        let (proxy, ops) = create_camera_bridge(tuning.clone());
        let mock = MockCamera::new();
        let log = mock.call_log();
        let worker = spawn_camera_worker(Box::new(mock), ops, tuning);
        let (state_tx, state_rx) = watch::channel(initial);
        let broadcaster = PreviewBroadcaster::new(proxy.clone(), state_rx, test_settings());
        Rig {
            broadcaster,
            state_tx,
            proxy,
            worker,
            log,
        }
    }

    async fn teardown(rig: Rig, handle: JoinHandle<()>) {
        rig.broadcaster.stop();
        // A parked loop needs the wake; a sleeping one needs the tick to pass
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        rig.proxy.shutdown().await;
        rig.worker.join().unwrap();
        drop(rig.state_tx);
    }

    fn frame_fetches(log: &Arc<Mutex<Vec<String>>>) -> usize {
        log.lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == "capture_preview_frame")
            .count()
    }

    #[tokio::test]
    async fn test_zero_subscribers_means_zero_fetches() {
        let rig = rig(CameraState::Ready(ReadyMode::Previewing));
        let handle = rig.broadcaster.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(frame_fetches(&rig.log), 0);

        teardown(rig, handle).await;
    }

    #[tokio::test]
    async fn test_first_attach_wakes_loop() {
        let rig = rig(CameraState::Ready(ReadyMode::Previewing));
        let handle = rig.broadcaster.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (_id, mut rx) = rig.broadcaster.attach();
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no frame after attach")
            .expect("channel closed");
        assert!(!frame.data.is_empty());
        assert!(frame_fetches(&rig.log) > 0);

        teardown(rig, handle).await;
    }

    #[tokio::test]
    async fn test_no_fetch_outside_previewing_state() {
        let rig = rig(CameraState::Ready(ReadyMode::Idle));
        let handle = rig.broadcaster.start();
        let (_id, _rx) = rig.broadcaster.attach();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(frame_fetches(&rig.log), 0);

        // Entering Previewing starts deliveries
        rig.state_tx
            .send(CameraState::Ready(ReadyMode::Previewing))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(frame_fetches(&rig.log) > 0);

        teardown(rig, handle).await;
    }

    #[tokio::test]
    async fn test_closed_subscriber_removed_others_unaffected() {
        let rig = rig(CameraState::Ready(ReadyMode::Previewing));
        let handle = rig.broadcaster.start();

        let (_gone_id, gone_rx) = rig.broadcaster.attach();
        let (_kept_a_id, mut kept_a_rx) = rig.broadcaster.attach();
        let (_kept_b_id, mut kept_b_rx) = rig.broadcaster.attach();
        drop(gone_rx);

        // Both survivors keep receiving frames after the dead peer is
        // pruned on the next delivery
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(2), kept_a_rx.recv())
                .await
                .expect("no frame for first survivor")
                .expect("channel closed");
            tokio::time::timeout(Duration::from_secs(2), kept_b_rx.recv())
                .await
                .expect("no frame for second survivor")
                .expect("channel closed");
        }
        assert_eq!(rig.broadcaster.stats().subscribers, 2);

        teardown(rig, handle).await;
    }

    #[tokio::test]
    async fn test_detach_by_id() {
        let rig = rig(CameraState::Ready(ReadyMode::Idle));
        let (id, _rx) = rig.broadcaster.attach();
        assert_eq!(rig.broadcaster.stats().subscribers, 1);
        rig.broadcaster.detach(id);
        assert_eq!(rig.broadcaster.stats().subscribers, 0);

        rig.proxy.shutdown().await;
        rig.worker.join().unwrap();
    }

    #[tokio::test]
    async fn test_stats_count_sent_frames() {
        let rig = rig(CameraState::Ready(ReadyMode::Previewing));
        let handle = rig.broadcaster.start();

        let (_id, mut rx) = rig.broadcaster.attach();
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("no frame")
                .expect("channel closed");
        }
        let stats = rig.broadcaster.stats();
        assert!(stats.frames_sent >= 3);

        teardown(rig, handle).await;
    }
}
