//! Bounded fixed-interval readiness polling.
//!
//! Every wait in the installer (DNS propagation, HTTP endpoints coming up,
//! API calls that need a retry) goes through [`Poller`] so the retry policy
//! lives in one place.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default interval between attempts.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Attempts allowed for DNS propagation (~16 minutes at the default interval).
pub const DNS_MAX_ATTEMPTS: u32 = 100;

/// Attempts allowed for HTTP readiness gates (~33 minutes at the default interval).
pub const HTTP_MAX_ATTEMPTS: u32 = 200;

/// Extra wait once an HTTP endpoint first answers, for trailing propagation.
pub const HTTP_GRACE: Duration = Duration::from_secs(30);

/// Errors returned when a poll does not observe readiness.
#[derive(Error, Debug)]
pub enum PollError {
    /// Every attempt came back not-ready or failed.
    #[error("{target} not ready after {attempts} attempts{}", last_error_suffix(.last_error))]
    Exhausted {
        target: String,
        attempts: u32,
        last_error: Option<String>,
    },

    /// The poll was cancelled before readiness was observed.
    #[error("polling {target} cancelled at attempt {attempt}")]
    Cancelled { target: String, attempt: u32 },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_deref()
        .map(|e| format!(" (last error: {e})"))
        .unwrap_or_default()
}

/// Progress of a single poll call. Lives only for the duration of the call.
#[derive(Debug, Clone)]
pub struct AttemptState {
    /// What is being waited on (URL, DNS name, ...).
    pub target: String,
    /// Attempts made so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub interval: Duration,
    /// Error from the most recent failing probe, if any.
    pub last_error: Option<String>,
}

impl AttemptState {
    fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Fixed-interval bounded poller.
#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    max_attempts: u32,
    grace: Duration,
    cancel: Option<CancellationToken>,
}

impl Poller {
    /// Create a poller making at most `max_attempts` probe calls, `interval` apart.
    #[must_use]
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
            grace: Duration::ZERO,
            cancel: None,
        }
    }

    /// Cadence used for TXT record propagation checks.
    #[must_use]
    pub fn dns() -> Self {
        Self::new(DEFAULT_INTERVAL, DNS_MAX_ATTEMPTS)
    }

    /// Cadence used for HTTP readiness gates, including the grace sleep.
    #[must_use]
    pub fn http() -> Self {
        Self::new(DEFAULT_INTERVAL, HTTP_MAX_ATTEMPTS).with_grace(HTTP_GRACE)
    }

    /// Sleep `grace` once readiness is first observed.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Abort between attempts when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Call `probe` until it reports ready or the attempts run out.
    ///
    /// `Ok(false)` and `Err(_)` from the probe are both retried. The poller
    /// sleeps `interval` between attempts but never after the last one.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::Exhausted`] after `max_attempts` unsuccessful
    /// calls, or [`PollError::Cancelled`] if cancellation was requested.
    pub async fn poll<F, Fut>(&self, target: &str, mut probe: F) -> Result<(), PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        let mut state = AttemptState {
            target: target.to_string(),
            attempt: 0,
            max_attempts: self.max_attempts,
            interval: self.interval,
            last_error: None,
        };

        loop {
            if self.is_cancelled() {
                return Err(PollError::Cancelled {
                    target: state.target,
                    attempt: state.attempt,
                });
            }

            state.attempt += 1;
            match probe().await {
                Ok(true) => {
                    info!(resource = %state.target, attempt = state.attempt, "Ready");
                    if !self.grace.is_zero() {
                        info!(
                            resource = %state.target,
                            grace_secs = self.grace.as_secs(),
                            "Waiting out grace period"
                        );
                        tokio::time::sleep(self.grace).await;
                    }
                    return Ok(());
                }
                Ok(false) => {
                    debug!(
                        resource = %state.target,
                        attempt = state.attempt,
                        max_attempts = state.max_attempts,
                        "Not ready yet"
                    );
                }
                Err(e) => {
                    warn!(
                        resource = %state.target,
                        attempt = state.attempt,
                        max_attempts = state.max_attempts,
                        error = %e,
                        "Probe failed"
                    );
                    state.last_error = Some(format!("{e:#}"));
                }
            }

            if state.exhausted() {
                return Err(PollError::Exhausted {
                    target: state.target,
                    attempts: state.attempt,
                    last_error: state.last_error,
                });
            }

            self.wait(&state).await?;
        }
    }

    /// Boolean form of [`Poller::poll`]: `false` on exhaustion or cancellation.
    pub async fn is_ready<F, Fut>(&self, target: &str, probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        match self.poll(target, probe).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Readiness not observed");
                false
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    async fn wait(&self, state: &AttemptState) -> Result<(), PollError> {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => Err(PollError::Cancelled {
                        target: state.target.clone(),
                        attempt: state.attempt,
                    }),
                    () = tokio::time::sleep(state.interval) => Ok(()),
                }
            }
            None => {
                tokio::time::sleep(state.interval).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_k_failures() {
        let poller = Poller::new(Duration::from_secs(10), 100);
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let probe_calls = Arc::clone(&calls);
        poller
            .poll("example", move || {
                let n = probe_calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(n > 4) }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // Four sleeps between five calls.
        assert_eq!(start.elapsed(), Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_makes_exactly_max_attempts() {
        let poller = Poller::new(Duration::from_secs(10), 7);
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let probe_calls = Arc::clone(&calls);
        let err = poller
            .poll("never", move || {
                probe_calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(false) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 7);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert!(matches!(err, PollError::Exhausted { attempts: 7, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_retried_and_reported() {
        let poller = Poller::new(Duration::from_secs(1), 3);
        let calls = Arc::new(AtomicU32::new(0));

        let probe_calls = Arc::clone(&calls);
        let err = poller
            .poll("flaky", move || {
                probe_calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("connection refused")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let message = err.to_string();
        assert!(message.contains("flaky"));
        assert!(message.contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_then_ready_succeeds() {
        let poller = Poller::new(Duration::from_secs(1), 5);
        let calls = Arc::new(AtomicU32::new(0));

        let probe_calls = Arc::clone(&calls);
        let ready = poller
            .is_ready("recovering", move || {
                let n = probe_calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        anyhow::bail!("timed out");
                    }
                    Ok(true)
                }
            })
            .await;

        assert!(ready);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_sleep_after_ready() {
        let poller = Poller::new(Duration::from_secs(10), 5).with_grace(Duration::from_secs(30));
        let start = Instant::now();

        poller.poll("immediate", || async { Ok(true) }).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let poller = Poller::new(Duration::from_secs(10), 5).with_cancellation(token);
        let calls = Arc::new(AtomicU32::new(0));

        let probe_calls = Arc::clone(&calls);
        let err = poller
            .poll("cancelled", move || {
                probe_calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(false) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::Cancelled { attempt: 0, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_presets() {
        let dns = Poller::dns();
        assert_eq!(dns.interval(), Duration::from_secs(10));
        assert_eq!(dns.max_attempts(), 100);
        assert!(dns.grace().is_zero());

        let http = Poller::http();
        assert_eq!(http.max_attempts(), 200);
        assert_eq!(http.grace(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        assert_eq!(Poller::new(Duration::from_secs(1), 0).max_attempts(), 1);
    }
}
