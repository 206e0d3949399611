use super::AppState;
use super::orchestrator::CoreError;
use chrono::{Duration, Utc};
use rally_storage::{NewJob, ScheduledJob, Storage, StorageError};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::time::interval;
use tracing::{debug, info, warn};

pub const TIMEOUT_JOB_KIND: &str = "handshake-timeout";
pub const MAINTENANCE_JOB_KIND: &str = "maintenance-sweep";
pub const MAINTENANCE_JOB_ID: &str = "maintenance-sweep";

const DISPATCH_INTERVAL_SECS: u64 = 2;
const DISPATCH_LIMIT: i64 = 16;
const DISPATCH_LEASE_SECS: i64 = 30;
const BASE_BACKOFF_SECS: i64 = 5;
const MAX_BACKOFF_EXP: u32 = 6;
const MAX_BACKOFF_SECS: i64 = 300;
const LIMITER_IDLE_PRUNE_SECS: u64 = 1800;

/// Job ids are deterministic per (challenge, attempt) so re-scheduling the
/// same timeout is a no-op at the queue.
pub fn timeout_job_id(challenge_id: &str, attempt: i32) -> String {
    format!("timeout-{challenge_id}-{attempt}")
}

pub type ScheduleFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + 'a>>;

/// Capability interface the orchestrator uses to arm and disarm wake-up
/// timeouts without depending on the dispatcher.
pub trait TimeoutScheduler: Send + Sync {
    fn schedule_timeout<'a>(
        &'a self,
        challenge_id: &'a str,
        attempt: i32,
        after_seconds: i64,
    ) -> ScheduleFuture<'a>;

    fn cancel_timeout<'a>(&'a self, challenge_id: &'a str, attempt: i32) -> ScheduleFuture<'a>;
}

/// Storage-backed job queue front-end.
pub struct JobQueue {
    storage: Arc<Storage>,
}

impl JobQueue {
    pub fn new(storage: Arc<Storage>) -> Self {
        JobQueue { storage }
    }

    /// Registers the recurring maintenance sweep; idempotent across workers.
    pub async fn ensure_maintenance(&self, interval_seconds: i64) -> Result<(), StorageError> {
        let job = NewJob {
            job_id: MAINTENANCE_JOB_ID,
            kind: MAINTENANCE_JOB_KIND,
            payload: &json!({}),
            run_at: Utc::now() + Duration::seconds(interval_seconds),
            repeat_seconds: Some(interval_seconds),
        };
        self.storage.schedule_job(&job).await?;
        Ok(())
    }
}

impl TimeoutScheduler for JobQueue {
    fn schedule_timeout<'a>(
        &'a self,
        challenge_id: &'a str,
        attempt: i32,
        after_seconds: i64,
    ) -> ScheduleFuture<'a> {
        Box::pin(async move {
            let job_id = timeout_job_id(challenge_id, attempt);
            let payload = json!({
                "challenge_id": challenge_id,
                "attempt": attempt,
            });
            let job = NewJob {
                job_id: &job_id,
                kind: TIMEOUT_JOB_KIND,
                payload: &payload,
                run_at: Utc::now() + Duration::seconds(after_seconds),
                repeat_seconds: None,
            };
            self.storage.schedule_job(&job).await?;
            Ok(())
        })
    }

    fn cancel_timeout<'a>(&'a self, challenge_id: &'a str, attempt: i32) -> ScheduleFuture<'a> {
        Box::pin(async move {
            self.storage
                .cancel_job(&timeout_job_id(challenge_id, attempt))
                .await?;
            Ok(())
        })
    }
}

fn retry_backoff(attempts: i32) -> Duration {
    let exp = attempts.saturating_sub(1).min(MAX_BACKOFF_EXP as i32) as u32;
    let multiplier = 1_i64 << exp;
    let delay_secs = BASE_BACKOFF_SECS
        .saturating_mul(multiplier)
        .min(MAX_BACKOFF_SECS);
    Duration::seconds(delay_secs)
}

/// Runs the per-process dispatcher loop: claim due jobs under a lease,
/// route them to their handlers, settle the outcome.
pub fn spawn_dispatcher(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = interval(StdDuration::from_secs(DISPATCH_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if let Err(err) = dispatch(&state).await {
                warn!("job dispatch iteration failed: {}", err);
            }
        }
    });
}

async fn dispatch(state: &Arc<AppState>) -> Result<(), String> {
    let now = Utc::now();
    let jobs = state
        .storage
        .claim_due_jobs(DISPATCH_LIMIT, Duration::seconds(DISPATCH_LEASE_SECS), now)
        .await
        .map_err(|err| format!("claim failed: {err}"))?;
    for job in jobs {
        process_job(state, job).await;
    }
    Ok(())
}

async fn process_job(state: &Arc<AppState>, job: ScheduledJob) {
    match job.kind.as_str() {
        TIMEOUT_JOB_KIND => process_timeout_job(state, job).await,
        MAINTENANCE_JOB_KIND => {
            run_maintenance(state).await;
            state.metrics.mark_job_processed();
            if let Err(err) = state.storage.rearm_job(&job.job_id, Utc::now()).await {
                warn!(job = %job.job_id, "maintenance re-arm failed: {}", err);
            }
        }
        other => {
            warn!(job = %job.job_id, kind = other, "unknown job kind; dropping");
            if let Err(err) = state.storage.complete_job(&job.job_id).await {
                warn!(job = %job.job_id, "job completion failed: {}", err);
            }
        }
    }
}

async fn process_timeout_job(state: &Arc<AppState>, job: ScheduledJob) {
    let challenge_id = job.payload.get("challenge_id").and_then(|v| v.as_str());
    let attempt = job
        .payload
        .get("attempt")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);
    let (Some(challenge_id), Some(attempt)) = (challenge_id, attempt) else {
        warn!(job = %job.job_id, "malformed timeout payload; dropping");
        if let Err(err) = state.storage.complete_job(&job.job_id).await {
            warn!(job = %job.job_id, "job completion failed: {}", err);
        }
        return;
    };
    match state.orchestrator.handle_timeout(challenge_id, attempt).await {
        Ok(()) => {
            state.metrics.mark_job_processed();
            if let Err(err) = state.storage.complete_job(&job.job_id).await {
                warn!(job = %job.job_id, "job completion failed: {}", err);
            }
        }
        Err(CoreError::Transient(reason)) => {
            let delay = retry_backoff(job.attempts);
            debug!(
                job = %job.job_id,
                attempts = job.attempts,
                delay_secs = delay.num_seconds(),
                "timeout handler hit a transient failure; rescheduled: {}", reason
            );
            if let Err(err) = state
                .storage
                .reschedule_job(&job.job_id, delay, Utc::now(), Some(&reason))
                .await
            {
                warn!(job = %job.job_id, "job reschedule failed: {}", err);
            }
        }
        Err(err) => {
            // a non-transient handler failure will not improve on retry
            warn!(job = %job.job_id, "timeout handler failed terminally: {}", err);
            if let Err(err) = state.storage.complete_job(&job.job_id).await {
                warn!(job = %job.job_id, "job completion failed: {}", err);
            }
        }
    }
}

async fn run_maintenance(state: &Arc<AppState>) {
    let now = Utc::now();
    match state.storage.mark_expired(now).await {
        Ok(expired) if expired > 0 => {
            info!(challenges = expired, "expired pending challenges")
        }
        Ok(_) => {}
        Err(err) => warn!("expiry sweep failed: {}", err),
    }
    match state
        .storage
        .delete_terminal_older_than(state.config.terminal_retention_days, now)
        .await
    {
        Ok(pruned) if pruned > 0 => info!(challenges = pruned, "pruned terminal challenges"),
        Ok(_) => {}
        Err(err) => warn!("retention sweep failed: {}", err),
    }
    match state.storage.purge_expired_auth_tokens(now).await {
        Ok(purged) if purged > 0 => info!(tokens = purged, "purged expired bearer tokens"),
        Ok(_) => {}
        Err(err) => warn!("token sweep failed: {}", err),
    }
    let pruned = state
        .rate_limits
        .prune_idle(StdDuration::from_secs(LIMITER_IDLE_PRUNE_SECS))
        .await;
    if pruned > 0 {
        debug!(windows = pruned, "pruned idle rate-limit windows");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_job_ids_are_deterministic() {
        assert_eq!(timeout_job_id("ch-1", 2), "timeout-ch-1-2");
        assert_eq!(timeout_job_id("ch-1", 2), timeout_job_id("ch-1", 2));
        assert_ne!(timeout_job_id("ch-1", 2), timeout_job_id("ch-1", 3));
    }

    #[test]
    fn backoff_grows_and_saturates() {
        assert_eq!(retry_backoff(1).num_seconds(), 5);
        assert_eq!(retry_backoff(2).num_seconds(), 10);
        assert_eq!(retry_backoff(3).num_seconds(), 20);
        assert_eq!(retry_backoff(8).num_seconds(), MAX_BACKOFF_SECS);
        assert_eq!(retry_backoff(100).num_seconds(), MAX_BACKOFF_SECS);
        // a claim always increments attempts first, but tolerate zero
        assert_eq!(retry_backoff(0).num_seconds(), 5);
    }
}
