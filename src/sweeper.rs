use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{now_ms, Engine, EngineError};

/// First retry delay after a failed sweep; doubles per consecutive failure.
const RETRY_BASE: Duration = Duration::from_secs(5);

/// How often the compactor looks at the WAL size.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct SweepPolicy {
    pub interval: Duration,
    /// Execution budget of one sweep.
    pub budget: Duration,
    /// Consecutive failures before the log level escalates to `error`.
    pub alert_after: u32,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            budget: Duration::from_secs(30),
            alert_after: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("sweep exceeded its {0:?} budget")]
    Timeout(Duration),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("sweep task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Delay before the next attempt after `failures` consecutive failures.
pub fn retry_delay(failures: u32, cadence: Duration) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    RETRY_BASE.saturating_mul(1 << exp).min(cadence)
}

/// One bounded sweep: completes every active booking whose session ended
/// before now. The work runs in its own task; past the budget only the wait
/// is abandoned, and the task still applies whatever it wrote to the log.
pub async fn sweep_once(engine: &Arc<Engine>, budget: Duration) -> Result<usize, SweepError> {
    let started = Instant::now();
    let work = tokio::spawn({
        let engine = engine.clone();
        async move { engine.complete_elapsed(now_ms()).await }
    });
    let result = tokio::time::timeout(budget, work).await;
    metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    let status = match &result {
        Ok(Ok(Ok(_))) => "ok",
        Ok(_) => "error",
        Err(_) => "timeout",
    };
    metrics::counter!(crate::observability::SWEEP_RUNS_TOTAL, "status" => status).increment(1);
    let completed = result.map_err(|_| SweepError::Timeout(budget))???;
    metrics::counter!(crate::observability::SWEEP_COMPLETED_BOOKINGS_TOTAL)
        .increment(completed as u64);
    Ok(completed)
}

/// Background task that moves finished bookings to `completed`. Runs once at
/// startup, then on the configured cadence until `token` is cancelled.
pub async fn run_sweeper(engine: Arc<Engine>, policy: SweepPolicy, token: CancellationToken) {
    let mut failures: u32 = 0;
    let mut delay = Duration::ZERO;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        match sweep_once(&engine, policy.budget).await {
            Ok(completed) => {
                if failures > 0 {
                    info!("tenant {}: sweep recovered after {failures} failures", engine.tenant);
                }
                failures = 0;
                delay = policy.interval;
                if completed > 0 {
                    info!("tenant {}: completed {completed} bookings", engine.tenant);
                } else {
                    debug!("tenant {}: sweep found nothing to complete", engine.tenant);
                }
            }
            Err(e) => {
                failures += 1;
                delay = retry_delay(failures, policy.interval);
                if failures >= policy.alert_after {
                    error!(
                        "tenant {}: sweep failed {failures} times in a row, retrying in {delay:?}: {e}",
                        engine.tenant
                    );
                } else {
                    warn!("tenant {}: sweep failed, retrying in {delay:?}: {e}", engine.tenant);
                }
            }
        }
        metrics::gauge!(
            crate::observability::SWEEP_CONSECUTIVE_FAILURES,
            "tenant" => engine.tenant.clone()
        )
        .set(failures as f64);
    }
    debug!("tenant {}: sweeper stopped", engine.tenant);
}

/// Background task that keeps every active series generated `window_days`
/// ahead.
pub async fn run_roller(
    engine: Arc<Engine>,
    interval: Duration,
    window_days: u32,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match engine.roll_series(window_days, now_ms()).await {
            Ok(0) => {}
            Ok(created) => info!("tenant {}: rolled {created} sessions", engine.tenant),
            Err(e) => error!("tenant {}: series roll failed: {e}", engine.tenant),
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, token: CancellationToken) {
    let mut ticker = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            error!("tenant {}: WAL compaction failed: {e}", engine.tenant);
        }
    }
}
