//! Connection recovery for the digitizer.
//!
//! The device may be powered off when the readout server starts. Connecting is
//! retried with a fixed delay, and every failed attempt is reported to the caller
//! so it can tell clients the device is offline.

use crate::config::DeviceSettings;
use crate::error::{AppResult, DaqError};
use crate::hardware::Digitizer;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Policy for retrying the device connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt gate. The attempt at index `max_retries - 1` is not made and the
    /// connection is declared failed instead, so at most `max_retries - 1`
    /// connects are tried.
    pub max_retries: u32,
    /// The delay after each failed attempt.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Build the policy from the device section of the settings.
    pub fn from_settings(settings: &DeviceSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            delay: settings.retry_delay(),
        }
    }
}

/// Connect to `device`, retrying according to `policy`.
///
/// `on_offline` is called after every failed attempt with the 1-based attempt
/// number and the error, before the delay. Returns the number of attempts made,
/// including the successful one.
///
/// # Errors
///
/// Returns [`DaqError::ConnectionFailed`] once the attempt gate is reached.
pub async fn connect_with_retry<D, F>(
    device: &D,
    policy: &RetryPolicy,
    mut on_offline: F,
) -> AppResult<u32>
where
    D: Digitizer + ?Sized,
    F: FnMut(u32, &DaqError),
{
    let mut attempts = 0;
    for index in 0..policy.max_retries {
        if index + 1 == policy.max_retries {
            break;
        }
        attempts += 1;
        match device.connect().await {
            Ok(()) => {
                if attempts > 1 {
                    warn!(
                        attempts,
                        "Device reconnected after a failure, the configuration may need reloading"
                    );
                }
                info!(attempts, "Device connected");
                return Ok(attempts);
            }
            Err(e) => {
                warn!(attempt = attempts, error = %e, "Device connection failed");
                on_offline(attempts, &e);
                sleep(policy.delay).await;
            }
        }
    }
    Err(DaqError::ConnectionFailed { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockDigitizer;
    use tracing_test::traced_test;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            delay: Duration::from_secs(3),
        }
    }

    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn test_connect_succeeds_after_failures() {
        let device = MockDigitizer::new().with_connect_failures(2);
        let mut notices = Vec::new();

        let attempts = connect_with_retry(&device, &policy(10), |n, _| notices.push(n))
            .await
            .unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(notices, vec![1, 2]);
        assert!(device.is_connected());
        assert!(logs_contain("configuration may need reloading"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_limits_attempts() {
        let device = MockDigitizer::new().with_connect_failures(u32::MAX);
        let mut notices = 0;
        let started = tokio::time::Instant::now();

        let err = connect_with_retry(&device, &policy(3), |_, _| notices += 1)
            .await
            .unwrap_err();

        assert!(matches!(err, DaqError::ConnectionFailed { attempts: 2 }));
        assert_eq!(notices, 2);
        assert_eq!(device.connect_attempts(), 2);
        // Two delays plus the simulated handshakes
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_or_one_retry_is_immediately_fatal() {
        for max in [0, 1] {
            let device = MockDigitizer::new();
            let err = connect_with_retry(&device, &policy(max), |_, _| {})
                .await
                .unwrap_err();
            assert!(matches!(err, DaqError::ConnectionFailed { attempts: 0 }));
            assert_eq!(device.connect_attempts(), 0);
        }
    }

    #[test]
    fn test_policy_from_settings() {
        let settings = DeviceSettings {
            max_retries: 4,
            retry_delay_ms: 250,
            ..DeviceSettings::default()
        };
        assert_eq!(
            RetryPolicy::from_settings(&settings),
            RetryPolicy {
                max_retries: 4,
                delay: Duration::from_millis(250),
            }
        );
    }
}
