use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a send job. A job leaves `queued` at most once per claim and
/// is terminal once it reaches `sent`, `skipped`, or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Claimed,
    Sent,
    Skipped,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Claimed => "claimed",
            JobState::Sent => "sent",
            JobState::Skipped => "skipped",
            JobState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "queued" => Ok(JobState::Queued),
            "claimed" => Ok(JobState::Claimed),
            "sent" => Ok(JobState::Sent),
            "skipped" => Ok(JobState::Skipped),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state {}", other)),
        }
    }
}

/// One outbound email job with already-resolved subject and body.
#[derive(Debug, Clone)]
pub struct SendJob {
    pub id: Uuid,
    pub campaign_id: i64,
    pub contact_id: i64,
    pub recipient_email: String,
    pub subject: String,
    pub body_html: String,
    pub state: JobState,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: i32,
    pub failure_reason: Option<String>,
}

/// Fields the enqueueing surface provides when creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub campaign_id: i64,
    pub contact_id: i64,
    pub recipient_email: String,
    pub subject: String,
    pub body_html: String,
    pub scheduled_at: DateTime<Utc>,
}

/// A configured sending identity. Read-only to the dispatch engine; caps,
/// pacing, and health_score are owned by the admin surface.
#[derive(Debug, Clone)]
pub struct Inbox {
    pub id: i64,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_name: String,
    pub from_email: String,
    pub daily_cap: i64,
    pub monthly_cap: Option<i64>,
    pub pace_seconds: u32,
    pub health_score: f64,
    pub disabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Sent,
    Bounce,
    Complaint,
    Reply,
    Unsubscribe,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Sent => "sent",
            EventKind::Bounce => "bounce",
            EventKind::Complaint => "complaint",
            EventKind::Reply => "reply",
            EventKind::Unsubscribe => "unsubscribe",
        }
    }
}

/// An append-only event row. The event log is the sole source of truth for
/// send counting; rows are never updated or deleted.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub kind: EventKind,
    pub campaign_id: Option<i64>,
    pub contact_id: Option<i64>,
    pub inbox_id: Option<i64>,
    pub ts: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Reason string recorded on policy skips.
pub const SKIP_REASON_SUPPRESSED: &str = "suppressed";
