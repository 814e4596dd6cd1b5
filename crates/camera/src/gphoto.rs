//! Real hardware backend driving the gphoto2 command-line tool
//!
//! The device protocol itself lives in the external gphoto2 process; this
//! backend spawns it per operation, enforces a per-call timeout by killing
//! the child, and classifies its stderr output into the camera error
//! taxonomy. All calls are blocking and only ever run on the worker thread.

use crate::backend::{CameraBackend, coerce_config_value};
use crate::error::{CameraError, Result};
use crate::types::{CameraAbilities, CapturedPhoto, ConfigValue, PhotoMetadata, WidgetKind};
use bytes::Bytes;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Frames smaller than this are corrupt partial transfers, not data
const MIN_FRAME_BYTES: usize = 1000;

/// Minimal 1x1 black JPEG served when the device lacks preview support
const BLACK_FRAME_JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xFF, 0xDB, 0x00, 0x43, 0x00, 0x08, 0x06, 0x06, 0x07, 0x06,
    0x05, 0x08, 0x07, 0x07, 0x07, 0x09, 0x09, 0x08, 0x0A, 0x0C, 0x14, 0x0D, 0x0C, 0x0B, 0x0B,
    0x0C, 0x19, 0x12, 0x13, 0x0F, 0x14, 0x1D, 0x1A, 0x1F, 0x1E, 0x1D, 0x1A, 0x1C, 0x1C, 0x20,
    0x24, 0x2E, 0x27, 0x20, 0x22, 0x2C, 0x23, 0x1C, 0x1C, 0x28, 0x37, 0x29, 0x2C, 0x30, 0x31,
    0x34, 0x34, 0x34, 0x1F, 0x27, 0x39, 0x3D, 0x38, 0x32, 0x3C, 0x2E, 0x33, 0x34, 0x32, 0xFF,
    0xC0, 0x00, 0x0B, 0x08, 0x00, 0x01, 0x00, 0x01, 0x01, 0x01, 0x11, 0x00, 0xFF, 0xC4, 0x00,
    0x1F, 0x00, 0x00, 0x01, 0x05, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B,
    0xFF, 0xC4, 0x00, 0x14, 0x10, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00,
    0x3F, 0x00, 0x7F, 0xFF, 0xD9,
];

/// Settings for the gphoto2 CLI backend
#[derive(Debug, Clone)]
pub struct GphotoSettings {
    /// Path or name of the gphoto2 binary
    pub binary: String,
    /// Optional port hint (e.g. "usb:001,004"); auto-detected when None
    pub port: Option<String>,
    /// Per-invocation timeout; the child is killed past this and the
    /// call reported as a protocol timeout
    pub call_timeout: Duration,
}

impl Default for GphotoSettings {
    fn default() -> Self {
        Self {
            binary: "gphoto2".to_string(),
            port: None,
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Real hardware camera backend
pub struct GphotoCamera {
    settings: GphotoSettings,
    abilities: Option<CameraAbilities>,
    connected: bool,
}

impl GphotoCamera {
    pub fn new(settings: GphotoSettings) -> Self {
        Self {
            settings,
            abilities: None,
            connected: false,
        }
    }

    /// Run the gphoto2 binary with the given arguments
    ///
    /// Stdout is captured as raw bytes (it may be image data), stderr as
    /// text. A child outliving the call timeout is killed and reported as
    /// a protocol timeout, since a hung CLI invocation means the device's
    /// command state machine is stuck.
    fn run(&self, args: &[&str]) -> Result<(Vec<u8>, String)> {
        let mut cmd = Command::new(&self.settings.binary);
        if let Some(port) = &self.settings.port {
            cmd.arg("--port").arg(port);
        }
        cmd.args(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Running {} {}", self.settings.binary, args.join(" "));

        let mut child = cmd.spawn().map_err(|e| CameraError::ConnectionFailed {
            attempt: 0,
            cause: format!("failed to spawn {}: {}", self.settings.binary, e),
        })?;

        let stdout_reader = drain_pipe(child.stdout.take());
        let stderr_reader = drain_pipe(child.stderr.take());

        let status = wait_with_timeout(&mut child, self.settings.call_timeout);

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr_bytes = stderr_reader.join().unwrap_or_default();
        let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();

        match status {
            Some(status) if status.success() => Ok((stdout, stderr)),
            Some(_) => Err(classify_stderr(&stderr)),
            None => {
                warn!(
                    "gphoto2 call exceeded {:?}, killed: {}",
                    self.settings.call_timeout,
                    args.join(" ")
                );
                Err(CameraError::ProtocolTimeout)
            }
        }
    }

    fn detect(&self) -> Result<(String, String)> {
        let (stdout, _) = self.run(&["--auto-detect"])?;
        let text = String::from_utf8_lossy(&stdout);
        parse_auto_detect(&text).ok_or(CameraError::DeviceNotFound)
    }

    fn query_abilities(&self, model: String, port: String) -> CameraAbilities {
        let preview_supported = match self.run(&["--abilities"]) {
            Ok((stdout, _)) => parse_abilities(&String::from_utf8_lossy(&stdout)),
            Err(e) => {
                // Not fatal: assume preview works and let the first fetch decide
                warn!("Could not query abilities: {}", e);
                true
            }
        };
        CameraAbilities {
            preview_supported,
            model,
            port,
        }
    }

    fn config_path(section: &str, option: &str) -> String {
        format!("/main/{}/{}", section, option)
    }

    /// Read widget kind and current value for a config entry
    fn read_config(&self, section: &str, option: &str) -> Result<(WidgetKind, ConfigValue)> {
        let path = Self::config_path(section, option);
        let (stdout, _) = self
            .run(&["--get-config", &path])
            .map_err(|e| match e {
                CameraError::ConnectionFailed { .. } => CameraError::UnknownOption {
                    section: section.to_string(),
                    option: option.to_string(),
                },
                other => other,
            })?;
        parse_get_config(&String::from_utf8_lossy(&stdout)).ok_or(CameraError::UnknownOption {
            section: section.to_string(),
            option: option.to_string(),
        })
    }

    /// Best-effort capture metadata from the device's current settings
    fn capture_metadata(&self) -> PhotoMetadata {
        let mut metadata = PhotoMetadata {
            model: self.abilities.as_ref().map(|a| a.model.clone()),
            timestamp: unix_now(),
            ..Default::default()
        };

        if let Ok((stdout, _)) = self.run(&[
            "--get-config",
            "iso",
            "--get-config",
            "shutterspeed",
            "--get-config",
            "aperture",
        ]) {
            let text = String::from_utf8_lossy(&stdout);
            let currents = parse_current_values(&text);
            let mut iter = currents.into_iter();
            metadata.iso = iter.next();
            metadata.shutter_speed = iter.next();
            metadata.aperture = iter.next();
        }

        metadata
    }
}

impl CameraBackend for GphotoCamera {
    fn connect(&mut self) -> Result<()> {
        let (model, port) = self.detect()?;
        info!("Detected camera: {} on {}", model, port);

        let abilities = self.query_abilities(model, port);
        if !abilities.preview_supported {
            warn!("Camera does not support live preview");
        }

        self.abilities = Some(abilities);
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.abilities = None;
        debug!("gphoto2 backend disconnected");
    }

    fn abilities(&self) -> Result<CameraAbilities> {
        self.abilities.clone().ok_or(CameraError::NotReady {
            state: "disconnected".to_string(),
        })
    }

    fn capture_preview_frame(&mut self) -> Result<Option<Bytes>> {
        if !self.connected {
            return Err(CameraError::NotReady {
                state: "disconnected".to_string(),
            });
        }

        // Preview-incompatible devices serve the black frame contract
        if let Some(abilities) = &self.abilities
            && !abilities.preview_supported
        {
            return Ok(Some(Bytes::from_static(BLACK_FRAME_JPEG)));
        }

        let (stdout, _) = self.run(&["--capture-preview", "--stdout"])?;

        if stdout.len() < MIN_FRAME_BYTES {
            debug!("Frame too small: {} bytes", stdout.len());
            return Ok(None);
        }

        Ok(Some(Bytes::from(stdout)))
    }

    fn capture_photo(&mut self) -> Result<CapturedPhoto> {
        if !self.connected {
            return Err(CameraError::NotReady {
                state: "disconnected".to_string(),
            });
        }

        let (stdout, stderr) = self.run(&[
            "--capture-image-and-download",
            "--stdout",
            "--force-overwrite",
        ])?;

        if stdout.is_empty() {
            return Err(classify_stderr(&stderr));
        }

        Ok(CapturedPhoto {
            data: Bytes::from(stdout),
            metadata: self.capture_metadata(),
        })
    }

    fn get_config(&mut self, section: &str, option: &str) -> Result<ConfigValue> {
        let (_, current) = self.read_config(section, option)?;
        Ok(current)
    }

    fn set_config(&mut self, section: &str, option: &str, value: &ConfigValue) -> Result<()> {
        let (kind, _) = self.read_config(section, option)?;

        let coerced =
            coerce_config_value(&kind, value).map_err(|_| CameraError::UnsupportedOption {
                section: section.to_string(),
                option: option.to_string(),
                value: value.to_string(),
            })?;

        let path = Self::config_path(section, option);
        let assignment = format!("{}={}", path, coerced);
        self.run(&["--set-config", &assignment]).map_err(|e| {
            if e.is_transient() || e.is_protocol_stall() {
                e
            } else {
                CameraError::UnsupportedOption {
                    section: section.to_string(),
                    option: option.to_string(),
                    value: value.to_string(),
                }
            }
        })?;

        debug!("Set {}/{} = {}", section, option, coerced);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Drain a child pipe on a helper thread to avoid blocking the child on a
/// full pipe buffer while we wait for it
fn drain_pipe<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Wait for the child with a deadline; kill it and return None on expiry
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
        }
    }
}

/// Classify a gphoto2 stderr transcript into the error taxonomy
///
/// Bus-busy conditions are transient and retried by the queue; PTP timeouts
/// mean the device's command state machine is stuck and need a bus reset.
fn classify_stderr(stderr: &str) -> CameraError {
    let lowered = stderr.to_lowercase();

    if lowered.contains("i/o in progress")
        || lowered.contains("could not claim the usb device")
        || lowered.contains("device busy")
    {
        return CameraError::TransientIoBusy;
    }

    if lowered.contains("ptp timeout")
        || lowered.contains("timed out")
        || lowered.contains("timeout")
        || lowered.contains("-110")
    {
        return CameraError::ProtocolTimeout;
    }

    if lowered.contains("no camera found") || lowered.contains("could not detect") {
        return CameraError::DeviceNotFound;
    }

    let cause = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("gphoto2 exited with error")
        .trim()
        .to_string();
    CameraError::ConnectionFailed { attempt: 0, cause }
}

/// Parse `--auto-detect` output into (model, port)
///
/// ```text
/// Model                          Port
/// ----------------------------------------------------------
/// Canon EOS 550D                 usb:001,006
/// ```
fn parse_auto_detect(output: &str) -> Option<(String, String)> {
    for line in output.lines().skip(2) {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(pos) = line.rfind("usb:") {
            let model = line[..pos].trim().to_string();
            let port = line[pos..].trim().to_string();
            if !model.is_empty() {
                return Some((model, port));
            }
        }
    }
    None
}

/// Parse `--abilities` output for preview support
///
/// Preview support shows up as a "Preview" entry under "Capture choices".
fn parse_abilities(output: &str) -> bool {
    let mut in_choices = false;
    for line in output.lines() {
        if line.contains("Capture choices") {
            in_choices = true;
            continue;
        }
        if in_choices {
            let trimmed = line.trim_start();
            if let Some(choice) = trimmed.strip_prefix(':') {
                if choice.trim() == "Preview" {
                    return true;
                }
            } else {
                // Next section header ends the choices block
                in_choices = false;
            }
        }
    }
    false
}

/// Parse `--get-config` output into widget kind and current value
///
/// ```text
/// Label: ISO Speed
/// Readonly: 0
/// Type: RADIO
/// Current: 1600
/// Choice: 0 Auto
/// Choice: 1 100
/// ```
fn parse_get_config(output: &str) -> Option<(WidgetKind, ConfigValue)> {
    let mut widget_type = None;
    let mut current = None;
    let mut choices = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if let Some(t) = line.strip_prefix("Type:") {
            widget_type = Some(t.trim().to_string());
        } else if let Some(v) = line.strip_prefix("Current:") {
            current = Some(v.trim().to_string());
        } else if let Some(c) = line.strip_prefix("Choice:") {
            // "Choice: <index> <value>"
            let value = c.trim().split_once(' ').map(|(_, v)| v.trim().to_string());
            if let Some(value) = value {
                choices.push(value);
            }
        }
    }

    let widget_type = widget_type?;
    let current = current.unwrap_or_default();

    let (kind, value) = match widget_type.as_str() {
        "TOGGLE" => (
            WidgetKind::Toggle,
            ConfigValue::Int(current.parse().unwrap_or(0)),
        ),
        "RADIO" | "MENU" => (WidgetKind::Choice(choices), ConfigValue::Text(current)),
        "RANGE" => (
            WidgetKind::Range,
            ConfigValue::Float(current.parse().unwrap_or(0.0)),
        ),
        "DATE" => (
            WidgetKind::Date,
            ConfigValue::Int(current.parse().unwrap_or(0)),
        ),
        _ => (WidgetKind::Text, ConfigValue::Text(current)),
    };

    Some((kind, value))
}

/// Collect all "Current:" values in order (for multi --get-config calls)
fn parse_current_values(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|l| l.trim().strip_prefix("Current:"))
        .map(|v| v.trim().to_string())
        .collect()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
