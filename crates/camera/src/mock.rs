//! Deterministic mock backend for testing without hardware
//!
//! Outcomes are scripted per call with builder methods; when a script queue
//! runs dry the call succeeds with a canned result. The mock records every
//! call in a shared log and asserts serialized access with an in-flight
//! guard, so tests can verify both execution order and mutual exclusion.

use crate::backend::{CameraBackend, coerce_config_value};
use crate::error::{CameraError, Result};
use crate::types::{CameraAbilities, CapturedPhoto, ConfigValue, PhotoMetadata, WidgetKind};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A plausible preview-frame payload (zero-filled past the SOI marker)
pub fn sample_frame() -> Bytes {
    let mut data = vec![0u8; 2048];
    data[0] = 0xFF;
    data[1] = 0xD8;
    data[2046] = 0xFF;
    data[2047] = 0xD9;
    Bytes::from(data)
}

/// Mock camera backend with scripted outcomes
pub struct MockCamera {
    abilities: CameraAbilities,
    connect_script: VecDeque<Result<()>>,
    frame_script: VecDeque<Result<Option<Bytes>>>,
    photo_script: VecDeque<Result<CapturedPhoto>>,
    config_script: VecDeque<Result<ConfigValue>>,
    config: HashMap<(String, String), (WidgetKind, ConfigValue)>,
    op_delay: Option<Duration>,
    connected: bool,
    log: Arc<std::sync::Mutex<Vec<String>>>,
    in_flight: Arc<AtomicBool>,
    overlap_detected: Arc<AtomicBool>,
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCamera {
    pub fn new() -> Self {
        let mut config = HashMap::new();
        config.insert(
            ("settings".to_string(), "capturetarget".to_string()),
            (
                WidgetKind::Choice(vec!["sdram".to_string(), "card".to_string()]),
                ConfigValue::Text("sdram".to_string()),
            ),
        );
        config.insert(
            ("imgsettings".to_string(), "iso".to_string()),
            (
                WidgetKind::Choice(vec![
                    "Auto".to_string(),
                    "100".to_string(),
                    "1600".to_string(),
                ]),
                ConfigValue::Text("Auto".to_string()),
            ),
        );
        config.insert(
            ("actions".to_string(), "viewfinder".to_string()),
            (WidgetKind::Toggle, ConfigValue::Int(0)),
        );

        Self {
            abilities: CameraAbilities {
                preview_supported: true,
                model: "Mock Camera".to_string(),
                port: "mock:0".to_string(),
            },
            connect_script: VecDeque::new(),
            frame_script: VecDeque::new(),
            photo_script: VecDeque::new(),
            config_script: VecDeque::new(),
            config,
            op_delay: None,
            connected: false,
            log: Arc::new(std::sync::Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicBool::new(false)),
            overlap_detected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue connect outcomes; exhausted queue means success
    #[must_use]
    pub fn with_connect_results(mut self, results: Vec<Result<()>>) -> Self {
        self.connect_script = results.into();
        self
    }

    /// Queue preview-frame outcomes; exhausted queue serves `sample_frame`
    #[must_use]
    pub fn with_frame_results(mut self, results: Vec<Result<Option<Bytes>>>) -> Self {
        self.frame_script = results.into();
        self
    }

    /// Queue capture-photo outcomes
    #[must_use]
    pub fn with_photo_results(mut self, results: Vec<Result<CapturedPhoto>>) -> Self {
        self.photo_script = results.into();
        self
    }

    /// Queue get-config outcomes ahead of the virtual config tree
    #[must_use]
    pub fn with_config_results(mut self, results: Vec<Result<ConfigValue>>) -> Self {
        self.config_script = results.into();
        self
    }

    /// Set abilities reported after connect
    #[must_use]
    pub fn with_abilities(mut self, abilities: CameraAbilities) -> Self {
        self.abilities = abilities;
        self
    }

    /// Hold the in-flight guard for this long on every call, making
    /// overlapping access detectable in concurrency tests
    #[must_use]
    pub fn with_op_delay(mut self, delay: Duration) -> Self {
        self.op_delay = Some(delay);
        self
    }

    /// Shared handle to the call log (labels in execution order)
    pub fn call_log(&self) -> Arc<std::sync::Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }

    /// Shared flag set if two calls ever overlapped
    pub fn overlap_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.overlap_detected)
    }

    fn enter(&self, label: String) -> CallGuard {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlap_detected.store(true, Ordering::SeqCst);
        }
        if let Ok(mut log) = self.log.lock() {
            log.push(label);
        }
        if let Some(delay) = self.op_delay {
            std::thread::sleep(delay);
        }
        CallGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    fn sample_photo() -> CapturedPhoto {
        CapturedPhoto {
            data: sample_frame(),
            metadata: PhotoMetadata {
                model: Some("Mock Camera".to_string()),
                iso: Some("100".to_string()),
                timestamp: 0,
                ..Default::default()
            },
        }
    }
}

struct CallGuard {
    in_flight: Arc<AtomicBool>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

impl CameraBackend for MockCamera {
    fn connect(&mut self) -> Result<()> {
        let _guard = self.enter("connect".to_string());
        let result = self.connect_script.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.connected = true;
        }
        result
    }

    fn disconnect(&mut self) {
        let _guard = self.enter("disconnect".to_string());
        self.connected = false;
    }

    fn abilities(&self) -> Result<CameraAbilities> {
        Ok(self.abilities.clone())
    }

    fn capture_preview_frame(&mut self) -> Result<Option<Bytes>> {
        let _guard = self.enter("capture_preview_frame".to_string());
        self.frame_script
            .pop_front()
            .unwrap_or_else(|| Ok(Some(sample_frame())))
    }

    fn capture_photo(&mut self) -> Result<CapturedPhoto> {
        let _guard = self.enter("capture_photo".to_string());
        self.photo_script
            .pop_front()
            .unwrap_or_else(|| Ok(Self::sample_photo()))
    }

    fn get_config(&mut self, section: &str, option: &str) -> Result<ConfigValue> {
        let _guard = self.enter(format!("get_config {}/{}", section, option));
        if let Some(scripted) = self.config_script.pop_front() {
            return scripted;
        }
        self.config
            .get(&(section.to_string(), option.to_string()))
            .map(|(_, value)| value.clone())
            .ok_or_else(|| CameraError::UnknownOption {
                section: section.to_string(),
                option: option.to_string(),
            })
    }

    fn set_config(&mut self, section: &str, option: &str, value: &ConfigValue) -> Result<()> {
        let _guard = self.enter(format!("set_config {}/{}={}", section, option, value));
        let key = (section.to_string(), option.to_string());
        let kind = match self.config.get(&key) {
            Some((kind, _)) => kind.clone(),
            None => {
                return Err(CameraError::UnknownOption {
                    section: section.to_string(),
                    option: option.to_string(),
                });
            }
        };

        let coerced =
            coerce_config_value(&kind, value).map_err(|_| CameraError::UnsupportedOption {
                section: section.to_string(),
                option: option.to_string(),
                value: value.to_string(),
            })?;

        if let Some((_, current)) = self.config.get_mut(&key) {
            *current = coerced;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
