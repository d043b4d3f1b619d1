//! Readiness polling.
//!
//! A started container is not a ready database: the postgres entrypoint boots
//! a temporary server, runs init scripts, stops it and starts the real one.
//! The poller keeps probing until a probe succeeds or the fixture deadline
//! fires, whichever comes first.

use crate::driver::Driver;
use crate::telemetry::Telemetry;
use config::HandleKind;
use errors::FixtureError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Fixture-wide deadline. Armed once at setup start; a timer cancels the
/// token when the timeout elapses.
pub struct Deadline {
    token: CancellationToken,
    timeout: Duration,
    started: Instant,
    timer: JoinHandle<()>
}

impl Deadline {
    /// Must be called inside a tokio runtime.
    pub fn arm(timeout: Duration) -> Self {
        let token = CancellationToken::new();
        let timer = tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            }
        });

        Self {
            token,
            timeout,
            started: Instant::now(),
            timer
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// Delay between probe attempts: starts at `initial_delay`, doubles, capped at
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(250)
        }
    }
}

impl ProbePolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay
        }
    }

    /// `initial_delay * 2^n`, capped at `max_delay`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send + 'static {
        let ProbePolicy {
            initial_delay,
            max_delay
        } = *self;
        // With factor 1 the strategy yields 2, 4, 8... ms; half of that is
        // the doubling multiplier.
        ExponentialBackoff::from_millis(2).map(move |step| {
            u32::try_from(step.as_millis() / 2)
                .ok()
                .and_then(|multiplier| initial_delay.checked_mul(multiplier))
                .map_or(max_delay, |delay| delay.min(max_delay))
        })
    }
}

/// What the probe task saw before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub attempts: u32,
    pub last_error: Option<String>
}

pub struct ReadinessPoller<D: Driver> {
    driver: Arc<D>,
    policy: ProbePolicy
}

impl<D: Driver> ReadinessPoller<D> {
    pub fn new(driver: Arc<D>, policy: ProbePolicy) -> Self {
        Self { driver, policy }
    }

    /// Probe `address` until it answers or `deadline` fires.
    ///
    /// The probe task shares the deadline's token, so it stops as soon as the
    /// caller gives up; on timeout it is joined before returning and any
    /// handle it still holds is closed.
    #[instrument(skip_all, fields(handle_kind = ?kind))]
    pub async fn wait_until_ready(
        &self,
        address: &str,
        kind: HandleKind,
        deadline: &Deadline
    ) -> Result<D::Handle, FixtureError> {
        let token = deadline.token().clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        let prober = tokio::spawn(probe_loop(
            Arc::clone(&self.driver),
            address.to_string(),
            kind,
            self.policy,
            token.clone(),
            ready_tx
        ));

        tokio::select! {
            biased;
            ready = ready_rx => {
                if let Ok(handle) = ready {
                    info!(elapsed_ms = deadline.elapsed().as_millis() as u64, "Database is ready");
                    return Ok(handle);
                }
            }
            () = token.cancelled() => {}
        }

        // Deadline fired, or the prober went away without a handle.
        token.cancel();
        let report = match prober.await {
            Ok(report) => report,
            Err(e) => ProbeReport {
                attempts: 0,
                last_error: Some(format!("probe task failed: {e}"))
            }
        };

        Err(FixtureError::ReadinessTimeout {
            timeout: deadline.timeout(),
            attempts: report.attempts,
            last_error: report.last_error
        })
    }
}

async fn probe_loop<D: Driver>(
    driver: Arc<D>,
    address: String,
    kind: HandleKind,
    policy: ProbePolicy,
    token: CancellationToken,
    ready_tx: oneshot::Sender<D::Handle>
) -> ProbeReport {
    let mut report = ProbeReport::default();
    let mut delays = policy.delays();
    let mut handle: Option<D::Handle> = None;

    loop {
        let attempt = tokio::select! {
            biased;
            () = token.cancelled() => break,
            result = probe_once(driver.as_ref(), &address, kind, &mut handle) => result,
        };
        report.attempts += 1;
        Telemetry::record_probe_attempt(attempt.is_ok());

        match attempt {
            Ok(()) => {
                if let Some(ready) = handle.take() {
                    if let Err(unclaimed) = ready_tx.send(ready) {
                        // Caller already gave up.
                        close_quietly(driver.as_ref(), unclaimed).await;
                    }
                }
                return report;
            }
            Err(e) => {
                debug!(attempt = report.attempts, error = %e, "Database not ready yet");
                report.last_error = Some(e.to_string());
                if let Some(broken) = handle.take() {
                    close_quietly(driver.as_ref(), broken).await;
                }
            }
        }

        let delay = delays.next().unwrap_or(policy.max_delay);
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    if let Some(abandoned) = handle.take() {
        close_quietly(driver.as_ref(), abandoned).await;
    }
    debug!(attempts = report.attempts, "Probe loop cancelled");
    report
}

async fn probe_once<D: Driver>(
    driver: &D,
    address: &str,
    kind: HandleKind,
    handle: &mut Option<D::Handle>
) -> Result<(), D::Error> {
    let live = match handle.take() {
        Some(existing) => handle.insert(existing),
        None => handle.insert(driver.open(address, kind).await?)
    };
    driver.ping(live).await
}

async fn close_quietly<D: Driver>(driver: &D, handle: D::Handle) {
    if let Err(e) = driver.close(handle).await {
        debug!(error = %e, "Ignoring close error on discarded handle");
    }
}
