//! Timer-based reconnection.
//!
//! `maintain_connection` dials, hands the connection to a session future that
//! runs until the connection is lost, then dials again with exponential
//! backoff. The session future is expected to re-subscribe with the current
//! known state, so sync resumes from where it stopped.

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Consecutive failed dials before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
        self.initial_delay
            .mul_f64(factor.min(u32::MAX as f64))
            .min(self.max_delay)
    }
}

/// Keep a connection alive until `session` asks to stop.
///
/// `connect` dials once. `session` runs for the lifetime of one connection
/// and returns `true` to reconnect or `false` to stop.
pub async fn maintain_connection<C, CF, T, S, SF>(
    config: ReconnectConfig,
    mut connect: C,
    mut session: S,
) -> Result<()>
where
    C: FnMut() -> CF,
    CF: Future<Output = Result<T>>,
    S: FnMut(T) -> SF,
    SF: Future<Output = bool>,
{
    let mut failures = 0u32;
    loop {
        match connect().await {
            Ok(connection) => {
                failures = 0;
                tracing::info!("connected");
                if !session(connection).await {
                    return Ok(());
                }
                tracing::info!("connection lost, reconnecting");
                tokio::time::sleep(config.initial_delay).await;
            }
            Err(e) => {
                failures += 1;
                if config.max_attempts.map_or(false, |max| failures >= max) {
                    tracing::warn!(error = %e, attempts = failures, "giving up reconnecting");
                    return Err(SyncError::GaveUp(failures));
                }
                let delay = config.delay_for(failures - 1);
                tracing::debug!(error = %e, delay_ms = delay.as_millis() as u64, "connect failed");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_is_capped() {
        let config = ReconnectConfig::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000));
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(800));
        assert_eq!(config.delay_for(4), Duration::from_millis(1000));
        assert_eq!(config.delay_for(60), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_redials_after_loss_and_failures() {
        let config = ReconnectConfig::default()
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(4));
        let dials = Arc::new(AtomicU32::new(0));
        let sessions = Arc::new(AtomicU32::new(0));

        let result = {
            let dials = dials.clone();
            let sessions = sessions.clone();
            maintain_connection(
                config,
                move || {
                    let n = dials.fetch_add(1, Ordering::SeqCst);
                    async move {
                        // Every other dial fails.
                        if n % 2 == 1 {
                            Err(SyncError::TransportError("refused".into()))
                        } else {
                            Ok(n)
                        }
                    }
                },
                move |_connection: u32| {
                    let count = sessions.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { count < 3 }
                },
            )
            .await
        };

        assert!(result.is_ok());
        assert_eq!(sessions.load(Ordering::SeqCst), 3);
        assert_eq!(dials.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let config = ReconnectConfig::default()
            .with_initial_delay(Duration::from_millis(1))
            .with_max_attempts(3);
        let result = maintain_connection(
            config,
            || async { Err::<(), _>(SyncError::TransportError("refused".into())) },
            |_| async { true },
        )
        .await;
        assert!(matches!(result, Err(SyncError::GaveUp(3))));
    }
}
