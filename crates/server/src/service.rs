//! sd-notify integration
//!
//! Lets systemd track the camera service through `Type=notify`: readiness
//! once the supervisor is wired up, live status text for `systemctl
//! status`, and watchdog keepalives. Every call degrades to a no-op when
//! `NOTIFY_SOCKET` is absent, so running from a plain shell costs nothing.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use tracing::{debug, error, info};

fn sd_send(message: &str) -> Result<bool> {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        return Ok(false);
    };
    let socket = UnixDatagram::unbound().context("Failed to create notify socket")?;
    socket
        .send_to(message.as_bytes(), &socket_path)
        .with_context(|| format!("Failed to send '{}' to systemd", message))?;
    Ok(true)
}

/// Report the service ready; call once the camera stack is constructed
///
/// The camera itself may still be absent at this point. Readiness means
/// the supervisor is running, not that a device answered.
pub fn notify_ready() -> Result<()> {
    if sd_send("READY=1")? {
        info!("Notified systemd: service ready");
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

/// Report the start of the shutdown sequence
pub fn notify_stopping() -> Result<()> {
    if sd_send("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

/// Send one watchdog keepalive
///
/// Must arrive at least once per `WatchdogSec`; a missed deadline makes
/// systemd restart the service.
pub fn notify_watchdog() -> Result<()> {
    if sd_send("WATCHDOG=1")? {
        debug!("Notified systemd: watchdog keepalive");
    }
    Ok(())
}

/// Publish free-form status text (camera state, recovery progress)
pub fn notify_status(status: &str) -> Result<()> {
    if sd_send(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

/// Watchdog interval requested by systemd, in microseconds
pub fn get_watchdog_timeout() -> Option<u64> {
    env::var("WATCHDOG_USEC").ok().and_then(|s| s.parse().ok())
}

/// Whether a notify socket is available
pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

/// Spawn a task sending keepalives at half the watchdog interval
///
/// Without `WATCHDOG_USEC` the returned task finishes immediately, so the
/// caller can hold and abort the handle unconditionally.
pub async fn spawn_watchdog_task() -> Result<tokio::task::JoinHandle<()>> {
    let Some(timeout_usec) = get_watchdog_timeout() else {
        debug!("Systemd watchdog not enabled, skipping watchdog task");
        return Ok(tokio::spawn(async {}));
    };

    let interval_secs = (timeout_usec / 1_000_000) / 2;
    let interval = std::time::Duration::from_secs(interval_secs.max(1));
    info!(
        "Systemd watchdog enabled, interval: {}s (timeout: {}s)",
        interval.as_secs(),
        timeout_usec / 1_000_000
    );

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = notify_watchdog() {
                // Keep trying; a single failed datagram is not fatal
                error!("Failed to send watchdog keepalive: {:#}", e);
            }
        }
    });

    Ok(handle)
}
