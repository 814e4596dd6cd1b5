//! Test utilities for rust-tethercam
//!
//! Helper functions shared by unit and integration tests across crates.

use camera::CameraAbilities;
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Abilities of a preview-capable test camera
pub fn sample_abilities() -> CameraAbilities {
    CameraAbilities {
        preview_supported: true,
        model: "Canon EOS 550D".to_string(),
        port: "usb:001,006".to_string(),
    }
}

/// Abilities of a device without live preview support
pub fn sample_abilities_no_preview() -> CameraAbilities {
    CameraAbilities {
        preview_supported: false,
        model: "Old Compact".to_string(),
        port: "usb:001,009".to_string(),
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_abilities() {
        let abilities = sample_abilities();
        assert!(abilities.preview_supported);
        assert!(!sample_abilities_no_preview().preview_supported);
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        assert!(result.is_err());
    }
}
