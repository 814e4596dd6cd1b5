//! Camera backend trait and configuration value coercion
//!
//! All backend calls are synchronous: they only ever run on the dedicated
//! worker thread of the serialized access queue, which is what guarantees
//! the device protocol's non-reentrant access requirement.

use crate::error::{CameraError, Result};
use crate::types::{CameraAbilities, CapturedPhoto, ConfigValue, WidgetKind};
use bytes::Bytes;

/// Capability interface for a tethered camera
///
/// Implemented by `GphotoCamera` (real hardware via the gphoto2 CLI) and
/// `MockCamera` (deterministic test double).
pub trait CameraBackend: Send {
    /// Establish the device connection and query abilities
    fn connect(&mut self) -> Result<()>;

    /// Release the device connection (best effort, never fails the caller)
    fn disconnect(&mut self);

    /// Abilities from the last successful connect
    fn abilities(&self) -> Result<CameraAbilities>;

    /// Capture a single preview frame
    ///
    /// `Ok(None)` means no frame is available yet (too soon, or the device
    /// returned an implausibly small payload).
    fn capture_preview_frame(&mut self) -> Result<Option<Bytes>>;

    /// Capture a full-quality photo and download it
    fn capture_photo(&mut self) -> Result<CapturedPhoto>;

    /// Read a configuration value
    fn get_config(&mut self, section: &str, option: &str) -> Result<ConfigValue>;

    /// Write a configuration value, coercing it per the widget kind
    fn set_config(&mut self, section: &str, option: &str, value: &ConfigValue) -> Result<()>;

    /// True while the device handle is live
    fn is_connected(&self) -> bool;
}

/// Capture-target aliases accepted for choice widgets
///
/// Cameras disagree on the canonical name for the removable-storage target;
/// "Memory card" is the commonly used request string.
const CAPTURE_TARGET_ALIASES: &[(&str, &[&str])] =
    &[("Memory card", &["card", "card+sdram"])];

/// Coerce a configuration value to the form a widget kind accepts
///
/// Toggle widgets take integer 0/1 (also accepting "on"/"off" and
/// "true"/"false" text), choice widgets take a string matched against the
/// allowed set (with the capture-target alias table and a case-insensitive
/// match as fallbacks), range widgets take a float, text widgets a string,
/// and date widgets an integer unix timestamp.
pub fn coerce_config_value(kind: &WidgetKind, value: &ConfigValue) -> Result<ConfigValue> {
    match kind {
        WidgetKind::Toggle => coerce_toggle(value),
        WidgetKind::Choice(choices) => coerce_choice(choices, value),
        WidgetKind::Range => coerce_range(value),
        WidgetKind::Text => Ok(ConfigValue::Text(value.to_string())),
        WidgetKind::Date => coerce_date(value),
    }
}

fn coercion_error(value: &ConfigValue) -> CameraError {
    // Section/option are filled in by the backend that knows them
    CameraError::UnsupportedOption {
        section: String::new(),
        option: String::new(),
        value: value.to_string(),
    }
}

fn coerce_toggle(value: &ConfigValue) -> Result<ConfigValue> {
    let flag = match value {
        ConfigValue::Int(0) => 0,
        ConfigValue::Int(1) => 1,
        ConfigValue::Text(s) => match s.to_lowercase().as_str() {
            "0" | "off" | "false" => 0,
            "1" | "on" | "true" => 1,
            _ => return Err(coercion_error(value)),
        },
        _ => return Err(coercion_error(value)),
    };
    Ok(ConfigValue::Int(flag))
}

fn coerce_choice(choices: &[String], value: &ConfigValue) -> Result<ConfigValue> {
    let requested = value.to_string();

    if choices.iter().any(|c| c == &requested) {
        return Ok(ConfigValue::Text(requested));
    }

    // Alias fallback (e.g. "Memory card" -> "card" on Canon bodies)
    for (alias, targets) in CAPTURE_TARGET_ALIASES {
        if *alias == requested {
            for target in *targets {
                if choices.iter().any(|c| c == target) {
                    return Ok(ConfigValue::Text(target.to_string()));
                }
            }
        }
    }

    // Case-insensitive near-match as a last resort
    let lowered = requested.to_lowercase();
    if let Some(hit) = choices.iter().find(|c| c.to_lowercase() == lowered) {
        return Ok(ConfigValue::Text(hit.clone()));
    }

    Err(coercion_error(value))
}

fn coerce_range(value: &ConfigValue) -> Result<ConfigValue> {
    let v = match value {
        ConfigValue::Float(v) => *v,
        ConfigValue::Int(i) => *i as f64,
        ConfigValue::Text(s) => s.parse::<f64>().map_err(|_| coercion_error(value))?,
    };
    Ok(ConfigValue::Float(v))
}

fn coerce_date(value: &ConfigValue) -> Result<ConfigValue> {
    let ts = match value {
        ConfigValue::Int(i) => *i,
        ConfigValue::Text(s) => s.parse::<i64>().map_err(|_| coercion_error(value))?,
        ConfigValue::Float(_) => return Err(coercion_error(value)),
    };
    Ok(ConfigValue::Int(ts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choices(items: &[&str]) -> WidgetKind {
        WidgetKind::Choice(items.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_toggle_coercion() {
        let kind = WidgetKind::Toggle;
        assert_eq!(
            coerce_config_value(&kind, &ConfigValue::Int(1)).unwrap(),
            ConfigValue::Int(1)
        );
        assert_eq!(
            coerce_config_value(&kind, &ConfigValue::Text("on".into())).unwrap(),
            ConfigValue::Int(1)
        );
        assert_eq!(
            coerce_config_value(&kind, &ConfigValue::Text("false".into())).unwrap(),
            ConfigValue::Int(0)
        );
        assert_eq!(
            coerce_config_value(&kind, &ConfigValue::Text("0".into())).unwrap(),
            ConfigValue::Int(0)
        );
    }

    #[test]
    fn test_toggle_rejects_garbage() {
        let kind = WidgetKind::Toggle;
        assert!(coerce_config_value(&kind, &ConfigValue::Int(2)).is_err());
        assert!(coerce_config_value(&kind, &ConfigValue::Text("maybe".into())).is_err());
        assert!(coerce_config_value(&kind, &ConfigValue::Float(0.5)).is_err());
    }

    #[test]
    fn test_choice_exact_match() {
        let kind = choices(&["sdram", "card", "card+sdram"]);
        assert_eq!(
            coerce_config_value(&kind, &ConfigValue::Text("sdram".into())).unwrap(),
            ConfigValue::Text("sdram".into())
        );
    }

    #[test]
    fn test_choice_capture_target_alias() {
        let kind = choices(&["sdram", "card"]);
        assert_eq!(
            coerce_config_value(&kind, &ConfigValue::Text("Memory card".into())).unwrap(),
            ConfigValue::Text("card".into())
        );

        let kind = choices(&["sdram", "card+sdram"]);
        assert_eq!(
            coerce_config_value(&kind, &ConfigValue::Text("Memory card".into())).unwrap(),
            ConfigValue::Text("card+sdram".into())
        );
    }

    #[test]
    fn test_choice_case_insensitive_fallback() {
        let kind = choices(&["Internal RAM", "Memory card"]);
        assert_eq!(
            coerce_config_value(&kind, &ConfigValue::Text("internal ram".into())).unwrap(),
            ConfigValue::Text("Internal RAM".into())
        );
    }

    #[test]
    fn test_choice_rejects_unknown() {
        let kind = choices(&["sdram", "card"]);
        assert!(coerce_config_value(&kind, &ConfigValue::Text("floppy".into())).is_err());
    }

    #[test]
    fn test_range_coercion() {
        let kind = WidgetKind::Range;
        assert_eq!(
            coerce_config_value(&kind, &ConfigValue::Int(4)).unwrap(),
            ConfigValue::Float(4.0)
        );
        assert_eq!(
            coerce_config_value(&kind, &ConfigValue::Text("5.6".into())).unwrap(),
            ConfigValue::Float(5.6)
        );
        assert!(coerce_config_value(&kind, &ConfigValue::Text("wide".into())).is_err());
    }

    #[test]
    fn test_text_coercion() {
        let kind = WidgetKind::Text;
        assert_eq!(
            coerce_config_value(&kind, &ConfigValue::Int(1600)).unwrap(),
            ConfigValue::Text("1600".into())
        );
    }

    #[test]
    fn test_date_coercion() {
        let kind = WidgetKind::Date;
        assert_eq!(
            coerce_config_value(&kind, &ConfigValue::Int(1735689600)).unwrap(),
            ConfigValue::Int(1735689600)
        );
        assert_eq!(
            coerce_config_value(&kind, &ConfigValue::Text("1735689600".into())).unwrap(),
            ConfigValue::Int(1735689600)
        );
        assert!(coerce_config_value(&kind, &ConfigValue::Float(1.0)).is_err());
    }
}
