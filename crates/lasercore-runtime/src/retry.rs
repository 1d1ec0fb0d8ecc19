//! [`RetryPolicy`] – fixed-delay retries for transient hardware failures.
//!
//! Only errors for which [`HardwareError::is_transient`] holds are retried.
//! Anything else ends the attempt sequence immediately.

use std::future::Future;
use std::time::Duration;

use lasercore_types::{EngineConfig, HardwareError};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

/// A failed attempt sequence: the last error and how many attempts were made.
#[derive(Debug, Clone, PartialEq)]
pub struct Exhausted {
    pub attempts: u32,
    pub error: HardwareError,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: config.retry_delay(),
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the retries run out.
    /// `retries` is incremented once per retry.
    pub async fn run<T, F, Fut>(&self, retries: &mut u32, mut op: F) -> Result<T, Exhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HardwareError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempts <= self.max_retries => {
                    warn!(attempt = attempts, error = %error, "transient hardware failure, retrying");
                    *retries += 1;
                    tokio::time::sleep(self.delay).await;
                }
                Err(error) => return Err(Exhausted { attempts, error }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lasercore_types::DeviceKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn timeout() -> HardwareError {
        HardwareError::Timeout {
            device: DeviceKind::Laser,
            command: "PWR 1.000".into(),
            timeout_ms: 500,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn three_retries_means_four_attempts() {
        let calls = AtomicU32::new(0);
        let mut retries = 0;
        let err = policy()
            .run(&mut retries, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(timeout())
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(retries, 3);
    }

    #[tokio::test]
    async fn recovers_after_a_transient_failure() {
        let calls = AtomicU32::new(0);
        let mut retries = 0;
        let value = policy()
            .run(&mut retries, || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(timeout())
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(retries, 1);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let mut retries = 0;
        let err = policy()
            .run(&mut retries, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(HardwareError::NotConnected {
                    device: DeviceKind::Actuator,
                })
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(retries, 0);
    }
}
