//! Server configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub camera: CameraSettings,
    /// Automatic recovery configuration
    #[serde(default)]
    pub recovery: RecoverySettings,
    /// Preview fan-out configuration
    #[serde(default)]
    pub broadcast: BroadcastSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub log_level: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Which backend drives the physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Real hardware through the gphoto2 command-line tool
    Gphoto2,
    /// Deterministic scripted double, for development without a camera
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Backend selection (gphoto2, mock)
    #[serde(default = "CameraSettings::default_backend")]
    pub backend: BackendKind,
    /// Path to the gphoto2 binary
    #[serde(default = "CameraSettings::default_binary")]
    pub gphoto2_binary: String,
    /// Port hint passed to gphoto2 (e.g. "usb:001,006"); auto-detected if unset
    #[serde(default)]
    pub port: Option<String>,
    /// Maximum preview frame rate in frames per second (1-60)
    #[serde(default = "CameraSettings::default_frame_rate_cap")]
    pub frame_rate_cap: u32,
    /// Timeout for a single queued operation
    #[serde(default = "CameraSettings::default_op_timeout", with = "duration_serde")]
    pub op_timeout: Duration,
    /// Timeout for connect and photo-capture operations
    #[serde(
        default = "CameraSettings::default_capture_timeout",
        with = "duration_serde"
    )]
    pub capture_timeout: Duration,
    /// Retry limit for transient I/O failures within one operation
    #[serde(default = "CameraSettings::default_op_max_retries")]
    pub op_max_retries: u32,
    /// ISO applied while previewing
    #[serde(default = "CameraSettings::default_preview_iso")]
    pub preview_iso: String,
    /// ISO applied for photo capture
    #[serde(default = "CameraSettings::default_capture_iso")]
    pub capture_iso: String,
    /// Where captured images land on the device (sdram keeps the card clean)
    #[serde(default = "CameraSettings::default_capture_target")]
    pub capture_target: String,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            backend: Self::default_backend(),
            gphoto2_binary: Self::default_binary(),
            port: None,
            frame_rate_cap: Self::default_frame_rate_cap(),
            op_timeout: Self::default_op_timeout(),
            capture_timeout: Self::default_capture_timeout(),
            op_max_retries: Self::default_op_max_retries(),
            preview_iso: Self::default_preview_iso(),
            capture_iso: Self::default_capture_iso(),
            capture_target: Self::default_capture_target(),
        }
    }
}

impl CameraSettings {
    fn default_backend() -> BackendKind {
        BackendKind::Gphoto2
    }

    fn default_binary() -> String {
        "gphoto2".to_string()
    }

    fn default_frame_rate_cap() -> u32 {
        20
    }

    fn default_op_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn default_capture_timeout() -> Duration {
        Duration::from_secs(15)
    }

    fn default_op_max_retries() -> u32 {
        3
    }

    fn default_preview_iso() -> String {
        "1600".to_string()
    }

    fn default_capture_iso() -> String {
        "100".to_string()
    }

    fn default_capture_target() -> String {
        "sdram".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    /// Attempt automatic recovery when the connection drops or stalls
    #[serde(default = "RecoverySettings::default_auto_recover")]
    pub auto_recover: bool,
    /// Plain reconnect attempts before escalating (at least 1)
    #[serde(default = "RecoverySettings::default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// Delay between reconnect attempts
    #[serde(
        default = "RecoverySettings::default_restart_delay",
        with = "duration_serde"
    )]
    pub restart_delay: Duration,
    /// USB bus resets allowed per recovery cycle (0 disables resets)
    #[serde(default = "RecoverySettings::default_max_bus_resets")]
    pub max_bus_resets: u32,
    /// USB vendor id of the camera, 4 hex digits (04a9 = Canon)
    #[serde(default = "RecoverySettings::default_usb_vendor_id")]
    pub usb_vendor_id: String,
    /// Settle time after re-authorizing the device, before locating it again
    #[serde(
        default = "RecoverySettings::default_reset_settle",
        with = "duration_serde"
    )]
    pub reset_settle: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            auto_recover: Self::default_auto_recover(),
            max_restart_attempts: Self::default_max_restart_attempts(),
            restart_delay: Self::default_restart_delay(),
            max_bus_resets: Self::default_max_bus_resets(),
            usb_vendor_id: Self::default_usb_vendor_id(),
            reset_settle: Self::default_reset_settle(),
        }
    }
}

impl RecoverySettings {
    fn default_auto_recover() -> bool {
        true
    }

    fn default_max_restart_attempts() -> u32 {
        3
    }

    fn default_restart_delay() -> Duration {
        Duration::from_secs(5)
    }

    fn default_max_bus_resets() -> u32 {
        2
    }

    fn default_usb_vendor_id() -> String {
        "04a9".to_string()
    }

    fn default_reset_settle() -> Duration {
        Duration::from_secs(3)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastSettings {
    /// Per-subscriber frame channel capacity (at least 1)
    #[serde(default = "BroadcastSettings::default_subscriber_capacity")]
    pub subscriber_capacity: usize,
    /// Poll interval while the device is not previewing
    #[serde(default = "BroadcastSettings::default_idle_tick", with = "duration_serde")]
    pub idle_tick: Duration,
    /// Backoff after a failed or empty frame fetch
    #[serde(
        default = "BroadcastSettings::default_error_backoff",
        with = "duration_serde"
    )]
    pub error_backoff: Duration,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            subscriber_capacity: Self::default_subscriber_capacity(),
            idle_tick: Self::default_idle_tick(),
            error_backoff: Self::default_error_backoff(),
        }
    }
}

impl BroadcastSettings {
    fn default_subscriber_capacity() -> usize {
        8
    }

    fn default_idle_tick() -> Duration {
        Duration::from_millis(100)
    }

    fn default_error_backoff() -> Duration {
        Duration::from_millis(50)
    }
}

/// Custom serde module for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "1h30m", "90s", "50ms"
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total = Duration::ZERO;
        let mut current_num = String::new();
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                current_num.push(c);
                continue;
            }
            if current_num.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            current_num.clear();

            match c {
                'h' => total += Duration::from_secs(num * 3600),
                'm' => {
                    // "m" is minutes unless followed by "s"
                    if chars.peek() == Some(&'s') {
                        chars.next();
                        total += Duration::from_millis(num);
                    } else {
                        total += Duration::from_secs(num * 60);
                    }
                }
                's' => total += Duration::from_secs(num),
                _ => return Err(format!("Invalid duration unit: {}", c)),
            }
        }

        // Trailing bare number is seconds
        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            total += Duration::from_secs(num);
        }

        if total == Duration::ZERO {
            return Err("Duration must be greater than 0".to_string());
        }

        Ok(total)
    }

    fn format_duration(d: Duration) -> String {
        let millis = d.as_millis();
        if millis < 1000 || millis % 1000 != 0 {
            return format!("{}ms", millis);
        }

        let secs = d.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 || result.is_empty() {
            result.push_str(&format!("{}s", secs));
        }
        result
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service: ServiceSettings::default(),
            camera: CameraSettings::default(),
            recovery: RecoverySettings::default(),
            broadcast: BroadcastSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/tethercam/server.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("tethercam").join("server.toml")
        } else {
            PathBuf::from(".config/tethercam/server.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.service.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.service.log_level,
                valid_levels.join(", ")
            ));
        }

        if !(1..=60).contains(&self.camera.frame_rate_cap) {
            return Err(anyhow!(
                "Invalid frame_rate_cap {}, must be between 1 and 60",
                self.camera.frame_rate_cap
            ));
        }

        if self.recovery.max_restart_attempts == 0 {
            return Err(anyhow!("max_restart_attempts must be at least 1"));
        }

        Self::validate_vendor_id(&self.recovery.usb_vendor_id)?;

        if self.broadcast.subscriber_capacity == 0 {
            return Err(anyhow!("subscriber_capacity must be at least 1"));
        }

        Ok(())
    }

    /// Validate a USB vendor id (4 hex digits, e.g. "04a9")
    fn validate_vendor_id(id: &str) -> Result<()> {
        if id.len() != 4 {
            return Err(anyhow!(
                "Invalid usb_vendor_id '{}', must be 4 hex digits (e.g. '04a9')",
                id
            ));
        }

        u16::from_str_radix(id, 16)
            .map_err(|_| anyhow!("Invalid usb_vendor_id '{}', not a valid hex number", id))?;

        Ok(())
    }
}
