use std::future::Future;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tokio::time::sleep;

/// Bounded retry policy for transport-layer calls.
///
/// Retries are attached only to the NPS, thermistor and alert transports,
/// never to orchestrator methods: a retried `purge()` would re-open valves.
#[derive(Debug, Clone, Copy)]
pub struct Retrier {
    max_attempts: u32,
    delay: Duration,
    timeout: Option<Duration>,
}

impl Retrier {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            timeout: None,
        }
    }

    /// Caps the total time spent across all attempts, delays included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = async {
            let mut last_err: Option<anyhow::Error> = None;

            for attempt in 1..=self.max_attempts {
                match op().await {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        if attempt < self.max_attempts {
                            log::debug!(
                                "{label}: attempt {attempt}/{} failed: {err:#}",
                                self.max_attempts
                            );
                            sleep(self.delay).await;
                        }
                        last_err = Some(err);
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| anyhow!("no attempts were made")))
        };

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, attempts)
                .await
                .map_err(|_| anyhow!("{label} timed out after {timeout:?}"))?,
            None => attempts.await,
        }
        .with_context(|| format!("{label} failed after {} attempts", self.max_attempts))
    }
}
