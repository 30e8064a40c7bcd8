use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::executor::DeliveryExecutor;
use crate::ledger::CapacityLedger;
use crate::selector::select_inbox;
use crate::store::{DispatchStore, StoreError};
use crate::suppression;
use crate::types::SKIP_REASON_SUPPRESSED;
use crate::utils::jitter;

/// Attempts at committing an outcome before the claim is abandoned to the
/// stale-claim sweeper.
const RECORD_RETRY_ATTEMPTS: u32 = 3;
const RECORD_RETRY_BACKOFF_MS: u64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("store unavailable after {0} consecutive errors")]
    StoreUnavailable(u32),
}

/// What one loop iteration did; drives the pacing delay that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// No job was due.
    Idle,
    /// A message went out through the inbox with this pace.
    Dispatched { pace_seconds: u32 },
    /// The claimed job was suppressed and skipped without a network call.
    Skipped,
    /// No inbox (or the global pool) had headroom; the job went back to
    /// `queued` unconsumed.
    Deferred,
    /// Delivery failed; the outcome recorder applied the retry policy.
    Failed,
}

/// Single sequential dispatch loop. One claimed job at a time preserves
/// per-inbox pacing without extra coordination; horizontal throughput comes
/// from running more worker processes against the same store.
pub struct Dispatcher<E: DeliveryExecutor> {
    config: WorkerConfig,
    store: Arc<dyn DispatchStore>,
    executor: E,
}

impl<E: DeliveryExecutor> Dispatcher<E> {
    pub fn new(config: WorkerConfig, store: Arc<dyn DispatchStore>, executor: E) -> Self {
        Self {
            config,
            store,
            executor,
        }
    }

    /// Claim -> gate -> select -> send -> record. Exactly one outcome path
    /// fires per claimed job; a job claimed here never leaves this method
    /// still `claimed` unless the store itself went down mid-record.
    pub fn dispatch_once(&self) -> Result<Tick, StoreError> {
        let now = Utc::now();
        let Some(job) = self
            .store
            .claim_next_job(now, &self.config.instance_id)?
        else {
            return Ok(Tick::Idle);
        };

        if suppression::is_blocked(self.store.as_ref(), &job)? {
            let recorded = self.record_with_retry(|| {
                self.store
                    .record_skipped(&job, SKIP_REASON_SUPPRESSED, Utc::now())
            })?;
            if recorded {
                info!(
                    "skipped job {}: recipient {} is suppressed",
                    job.id, job.recipient_email
                );
            }
            self.refresh_heartbeat();
            return Ok(Tick::Skipped);
        }

        let ledger = CapacityLedger::new(self.store.as_ref(), self.config.global_daily_cap);
        if ledger.global_headroom(now)? == 0 {
            self.store.requeue_job(job.id)?;
            info!("global daily cap reached; deferring job {}", job.id);
            return Ok(Tick::Deferred);
        }

        let candidates = self.store.load_candidate_inboxes()?;
        let Some((inbox, headroom)) = select_inbox(&ledger, &candidates, now)? else {
            self.store.requeue_job(job.id)?;
            info!("no inbox with headroom; deferring job {}", job.id);
            return Ok(Tick::Deferred);
        };

        let tick = match self.executor.send(&inbox, &job) {
            Ok(receipt) => {
                self.record_with_retry(|| {
                    self.store
                        .record_sent(&job, inbox.id, &receipt.message_id, Utc::now())
                })?;
                info!(
                    "sent job {} to {} via inbox {} ({} remaining today)",
                    job.id,
                    job.recipient_email,
                    inbox.id,
                    headroom.remaining - 1
                );
                Tick::Dispatched {
                    pace_seconds: inbox.pace_seconds,
                }
            }
            Err(err) => {
                let permanent = err.is_permanent();
                self.record_with_retry(|| {
                    self.store
                        .record_failed(&job, &err.to_string(), !permanent, Utc::now())
                })?;
                warn!(
                    "delivery failed for job {} via inbox {}: {}",
                    job.id, inbox.id, err
                );
                Tick::Failed
            }
        };
        self.refresh_heartbeat();
        Ok(tick)
    }

    /// Run until the stop flag is set. Shutdown is only observed between
    /// iterations and during pacing sleeps, never mid-send, so an in-flight
    /// job always reaches a terminal or requeued state before exit.
    pub fn run_loop(&self, stop: &AtomicBool) -> Result<(), DispatchError> {
        let mut consecutive_errors = 0u32;
        let mut last_sweep: Option<Instant> = None;

        while !stop.load(Ordering::Relaxed) {
            let sweep_due = last_sweep
                .map(|at| at.elapsed() >= self.config.sweep_interval)
                .unwrap_or(true);
            if sweep_due {
                let cutoff = Utc::now() - ChronoDuration::seconds(self.config.claim_stale_secs);
                match self.store.reclaim_stale_claims(cutoff) {
                    Ok(0) => {}
                    Ok(recovered) => warn!("requeued {} stale claim(s)", recovered),
                    Err(err) => warn!("stale claim sweep failed: {}", err),
                }
                // Keeps the liveness row fresh through long idle stretches.
                self.refresh_heartbeat();
                last_sweep = Some(Instant::now());
            }

            // Checked again right before claiming: no new claim once shutdown
            // has been requested.
            if stop.load(Ordering::Relaxed) {
                break;
            }

            match self.dispatch_once() {
                Ok(tick) => {
                    consecutive_errors = 0;
                    let delay = match tick {
                        Tick::Dispatched { pace_seconds } => {
                            jitter(pace_seconds, self.config.pace_jitter_pct)
                        }
                        Tick::Idle => self.config.idle_sleep,
                        Tick::Deferred => self.config.defer_sleep,
                        Tick::Skipped | Tick::Failed => Duration::ZERO,
                    };
                    sleep_with_stop(delay, stop);
                }
                Err(err) => {
                    consecutive_errors += 1;
                    error!(
                        "dispatch iteration failed ({} consecutive): {}",
                        consecutive_errors, err
                    );
                    if consecutive_errors >= self.config.store_error_threshold {
                        error!("store unavailable; stopping dispatch loop");
                        return Err(DispatchError::StoreUnavailable(consecutive_errors));
                    }
                    sleep_with_stop(
                        Duration::from_secs(2 * u64::from(consecutive_errors)),
                        stop,
                    );
                }
            }
        }

        info!("dispatch loop stopped");
        Ok(())
    }

    /// The record step must not silently lose a claim: retry with backoff and
    /// never infer success. An exhausted claim is recovered by the sweeper.
    fn record_with_retry<F>(&self, mut op: F) -> Result<bool, StoreError>
    where
        F: FnMut() -> Result<bool, StoreError>,
    {
        let mut last_err = None;
        for attempt in 1..=RECORD_RETRY_ATTEMPTS {
            match op() {
                Ok(transitioned) => return Ok(transitioned),
                Err(err) => {
                    warn!("outcome record attempt {} failed: {}", attempt, err);
                    last_err = Some(err);
                    if attempt < RECORD_RETRY_ATTEMPTS {
                        thread::sleep(Duration::from_millis(
                            RECORD_RETRY_BACKOFF_MS * u64::from(attempt),
                        ));
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| StoreError::Storage("record retry exhausted".to_string())))
    }

    fn refresh_heartbeat(&self) {
        if let Err(err) = self
            .store
            .record_heartbeat(&self.config.service_name, Utc::now())
        {
            warn!("heartbeat refresh failed: {}", err);
        }
    }
}

/// Cancellable sleep: naps in slices so a shutdown signal cuts a long pacing
/// delay short instead of holding the process open.
fn sleep_with_stop(total: Duration, stop: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(250);
    let mut remaining = total;
    while !remaining.is_zero() && !stop.load(Ordering::Relaxed) {
        let step = remaining.min(SLICE);
        thread::sleep(step);
        remaining -= step;
    }
}
