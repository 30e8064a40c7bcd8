use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{Inbox, NewEvent, SendJob};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("uuid parse error: {0}")]
    UuidParse(#[from] uuid::Error),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("store config error: {0}")]
    Config(String),
}

/// Bounded-retry policy applied to transient delivery failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total delivery attempts a job gets before failing terminally.
    pub max_attempts: i32,
    /// Cool-down per retry; the n-th retry waits n * backoff_secs.
    pub backoff_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: 300,
        }
    }
}

/// Durable state shared by all scheduler instances: jobs, inboxes, the event
/// log, suppression sets, and heartbeats. Cross-process correctness rests on
/// these operations being atomic in the backing store; no in-process lock
/// protects against other workers.
pub trait DispatchStore: Send + Sync {
    /// Atomically claim the oldest due `queued` job (ties broken by id) and
    /// transition it to `claimed`. Returns `None` when nothing is due. Two
    /// concurrent claimants never receive the same job.
    fn claim_next_job(
        &self,
        now: DateTime<Utc>,
        claimed_by: &str,
    ) -> Result<Option<SendJob>, StoreError>;

    /// Return a claimed job to `queued` untouched (capacity deferral).
    fn requeue_job(&self, id: Uuid) -> Result<(), StoreError>;

    /// Transition `claimed -> sent` and append the `sent` event in one
    /// transaction. Returns false when the job was no longer claimed, which
    /// makes crash-replay recording idempotent.
    fn record_sent(
        &self,
        job: &SendJob,
        inbox_id: i64,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Transition `claimed -> skipped` with a policy reason; appends no event.
    fn record_skipped(
        &self,
        job: &SendJob,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Record a delivery failure. Retryable failures requeue with a cool-down
    /// until the retry policy is exhausted; everything else is terminal.
    fn record_failed(
        &self,
        job: &SendJob,
        reason: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Requeue every claim older than `cutoff`. Returns the number of jobs
    /// recovered.
    fn reclaim_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Count `sent` events since `since`, for one inbox or the whole pool.
    /// Always derived from the event log, never cached.
    fn sent_count_since(
        &self,
        inbox_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Enabled inboxes ordered by health_score descending, id ascending.
    fn load_candidate_inboxes(&self) -> Result<Vec<Inbox>, StoreError>;

    fn load_job(&self, id: Uuid) -> Result<Option<SendJob>, StoreError>;

    fn is_suppressed(&self, email: &str) -> Result<bool, StoreError>;

    fn is_unsubscribed(&self, email: &str) -> Result<bool, StoreError>;

    /// Whether the contact ever replied within this campaign.
    fn has_reply_event(&self, campaign_id: i64, contact_id: i64) -> Result<bool, StoreError>;

    /// Last-write-wins liveness row for this scheduler instance.
    fn record_heartbeat(&self, service_name: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Append one event row. Used internally by `record_sent` and by external
    /// writers (webhook ingestion, tests).
    fn append_event(&self, event: &NewEvent) -> Result<(), StoreError>;
}
