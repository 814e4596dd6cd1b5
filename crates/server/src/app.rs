//! Application context
//!
//! Wires the configured backend, the serialized queue, the supervisor, and
//! the broadcaster into one object with defined init and teardown, built
//! once at startup and passed by reference from there on.

use crate::camera::{CameraSupervisor, PreviewBroadcaster, SysfsReset};
use crate::config::{BackendKind, ServerConfig};
use anyhow::Result;
use camera::{CameraBackend, CameraError, GphotoCamera, GphotoSettings, MockCamera};
use common::{CameraProxy, QueueTuning, create_camera_bridge, spawn_camera_worker};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

pub struct App {
    pub config: ServerConfig,
    pub supervisor: Arc<CameraSupervisor>,
    pub broadcaster: Arc<PreviewBroadcaster>,
    broadcast_task: JoinHandle<()>,
}

fn build_backend(config: &ServerConfig) -> Box<dyn CameraBackend> {
    match config.camera.backend {
        BackendKind::Gphoto2 => Box::new(GphotoCamera::new(GphotoSettings {
            binary: config.camera.gphoto2_binary.clone(),
            port: config.camera.port.clone(),
            call_timeout: config.camera.op_timeout.max(Duration::from_secs(10)),
        })),
        BackendKind::Mock => {
            info!("Using mock camera backend");
            Box::new(MockCamera::new())
        }
    }
}

fn tuning_from(config: &ServerConfig) -> QueueTuning {
    QueueTuning {
        op_timeout: config.camera.op_timeout,
        capture_timeout: config.camera.capture_timeout,
        max_retries: config.camera.op_max_retries,
        min_frame_interval: Duration::from_secs(1) / config.camera.frame_rate_cap.max(1),
        ..QueueTuning::default()
    }
}

impl App {
    /// Build the full control stack from configuration
    pub fn build(config: ServerConfig) -> Result<Self> {
        let tuning = tuning_from(&config);
        let (proxy, ops) = create_camera_bridge(tuning.clone());
        let worker = spawn_camera_worker(build_backend(&config), ops, tuning);

        let reset = Arc::new(SysfsReset::new(
            config.recovery.usb_vendor_id.clone(),
            config.recovery.reset_settle,
        ));

        let supervisor = CameraSupervisor::new(
            proxy.clone(),
            reset,
            config.camera.clone(),
            config.recovery.clone(),
            worker,
        );
        supervisor.start();

        let broadcaster = Arc::new(PreviewBroadcaster::new(
            proxy,
            supervisor.state_rx(),
            config.broadcast.clone(),
        ));
        let broadcast_task = broadcaster.start();

        Ok(Self {
            config,
            supervisor,
            broadcaster,
            broadcast_task,
        })
    }

    /// Initial connect sequence
    ///
    /// A failure leaves the supervisor in its terminal state; the process
    /// stays up so an operator can request a restart.
    pub async fn initialize(&self) -> Result<(), CameraError> {
        self.supervisor.initialize().await
    }

    /// Ordered teardown: broadcaster first, then the supervisor and its
    /// worker thread
    pub async fn shutdown(self) {
        self.broadcaster.stop();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.broadcast_task).await;
        self.supervisor.shutdown().await;
    }
}

/// Detect the attached camera and print what it reports, without starting
/// the service
pub async fn probe(config: &ServerConfig) -> Result<()> {
    let tuning = tuning_from(config);
    let (proxy, ops) = create_camera_bridge(tuning.clone());
    let worker = spawn_camera_worker(build_backend(config), ops, tuning);

    let result = probe_inner(&proxy).await;

    proxy.shutdown().await;
    if worker.join().is_err() {
        tracing::warn!("Camera worker thread panicked during probe");
    }
    result
}

async fn probe_inner(proxy: &CameraProxy) -> Result<()> {
    proxy.connect().await?;
    let abilities = proxy.abilities().await?;

    println!("Model:   {}", abilities.model);
    println!("Port:    {}", abilities.port);
    println!(
        "Preview: {}",
        if abilities.preview_supported {
            "supported"
        } else {
            "not supported"
        }
    );

    proxy.disconnect().await.ok();
    Ok(())
}
