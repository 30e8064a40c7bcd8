use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::store::{DispatchStore, RetryPolicy, StoreError};
use crate::types::{Inbox, JobState, NewEvent, NewJob, SendJob};
use crate::utils::{format_datetime, parse_datetime};

const DISPATCH_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS send_jobs (
    id TEXT PRIMARY KEY,
    campaign_id INTEGER NOT NULL,
    contact_id INTEGER NOT NULL,
    recipient_email TEXT NOT NULL,
    subject TEXT NOT NULL,
    body_html TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'queued',
    scheduled_at TEXT NOT NULL,
    claimed_at TEXT,
    claimed_by TEXT,
    completed_at TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    failure_reason TEXT
);
CREATE INDEX IF NOT EXISTS send_jobs_queued_idx
    ON send_jobs(state, scheduled_at, id);

CREATE TABLE IF NOT EXISTS inboxes (
    id INTEGER PRIMARY KEY,
    smtp_host TEXT NOT NULL,
    smtp_port INTEGER NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL,
    from_name TEXT NOT NULL,
    from_email TEXT NOT NULL,
    daily_cap INTEGER NOT NULL,
    monthly_cap INTEGER,
    pace_seconds INTEGER NOT NULL,
    health_score REAL NOT NULL DEFAULT 1.0,
    disabled INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    campaign_id INTEGER,
    contact_id INTEGER,
    inbox_id INTEGER,
    ts TEXT NOT NULL,
    metadata TEXT
);
CREATE INDEX IF NOT EXISTS events_sent_idx ON events(type, ts, inbox_id);

CREATE TABLE IF NOT EXISTS suppressions (
    email TEXT PRIMARY KEY,
    reason TEXT,
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS unsubscribes (
    email TEXT PRIMARY KEY,
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS heartbeats (
    service_name TEXT PRIMARY KEY,
    ts TEXT NOT NULL
);
"#;

/// File-backed dispatch store for single-host deployments and tests. Claim
/// atomicity comes from SQLite's serialized writers: the claim is one
/// conditional UPDATE returning the claimed row.
#[derive(Debug)]
pub struct SqliteDispatchStore {
    path: PathBuf,
    retry: RetryPolicy,
}

impl SqliteDispatchStore {
    pub fn new(path: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self, StoreError> {
        let store = Self {
            path: path.into(),
            retry,
        };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| StoreError::Config(err.to_string()))?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(DISPATCH_SCHEMA)?;
        Ok(conn)
    }

    /// Insert a queued job. The enqueueing surface owns this in production;
    /// exposed here for seeding and operational tooling.
    pub fn insert_job(&self, job: &NewJob) -> Result<Uuid, StoreError> {
        let conn = self.open()?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO send_jobs
                (id, campaign_id, contact_id, recipient_email, subject, body_html, state, scheduled_at, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, 0)",
            params![
                id.to_string(),
                job.campaign_id,
                job.contact_id,
                job.recipient_email,
                job.subject,
                job.body_html,
                format_datetime(job.scheduled_at)
            ],
        )?;
        Ok(id)
    }

    pub fn upsert_inbox(&self, inbox: &Inbox) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO inboxes
                (id, smtp_host, smtp_port, username, password, from_name, from_email,
                 daily_cap, monthly_cap, pace_seconds, health_score, disabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                inbox.id,
                inbox.smtp_host,
                inbox.smtp_port,
                inbox.username,
                inbox.password,
                inbox.from_name,
                inbox.from_email,
                inbox.daily_cap,
                inbox.monthly_cap,
                inbox.pace_seconds,
                inbox.health_score,
                inbox.disabled as i64
            ],
        )?;
        Ok(())
    }

    pub fn add_suppression(&self, email: &str, reason: &str) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO suppressions (email, reason, ts) VALUES (LOWER(?1), ?2, ?3)",
            params![email, reason, format_datetime(Utc::now())],
        )?;
        Ok(())
    }

    pub fn add_unsubscribe(&self, email: &str) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO unsubscribes (email, ts) VALUES (LOWER(?1), ?2)",
            params![email, format_datetime(Utc::now())],
        )?;
        Ok(())
    }

    pub fn load_heartbeat(&self, service_name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.open()?;
        let raw = conn
            .query_row(
                "SELECT ts FROM heartbeats WHERE service_name = ?1",
                params![service_name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(parse_datetime(&raw)?)),
            None => Ok(None),
        }
    }
}

type JobRow = (
    String,
    i64,
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
);

fn job_from_row(row: JobRow) -> Result<SendJob, StoreError> {
    let (id_raw, campaign_id, contact_id, recipient_email, subject, body_html, state_raw, scheduled_raw, attempts, failure_reason) =
        row;
    let state: JobState = state_raw
        .parse()
        .map_err(StoreError::Storage)?;
    Ok(SendJob {
        id: Uuid::parse_str(&id_raw)?,
        campaign_id,
        contact_id,
        recipient_email,
        subject,
        body_html,
        state,
        scheduled_at: parse_datetime(&scheduled_raw)?,
        attempts: attempts as i32,
        failure_reason,
    })
}

impl DispatchStore for SqliteDispatchStore {
    fn claim_next_job(
        &self,
        now: DateTime<Utc>,
        claimed_by: &str,
    ) -> Result<Option<SendJob>, StoreError> {
        let conn = self.open()?;
        let now_raw = format_datetime(now);
        let mut stmt = conn.prepare(
            "UPDATE send_jobs
             SET state = 'claimed', claimed_at = ?1, claimed_by = ?2
             WHERE id = (
                 SELECT id FROM send_jobs
                 WHERE state = 'queued' AND scheduled_at <= ?1
                 ORDER BY scheduled_at ASC, id ASC
                 LIMIT 1
             )
             RETURNING id, campaign_id, contact_id, recipient_email, subject, body_html,
                       state, scheduled_at, attempts, failure_reason",
        )?;
        let row = stmt
            .query_row(params![now_raw, claimed_by], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            })
            .optional()?;
        row.map(job_from_row).transpose()
    }

    fn requeue_job(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE send_jobs
             SET state = 'queued', claimed_at = NULL, claimed_by = NULL
             WHERE id = ?1 AND state = 'claimed'",
            params![id.to_string()],
        )?;
        Ok(())
    }

    fn record_sent(
        &self,
        job: &SendJob,
        inbox_id: i64,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.open()?;
        let now_raw = format_datetime(now);
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE send_jobs
             SET state = 'sent', completed_at = ?2, failure_reason = NULL
             WHERE id = ?1 AND state = 'claimed'",
            params![job.id.to_string(), now_raw],
        )?;
        if updated > 0 {
            let metadata = serde_json::json!({ "message_id": message_id }).to_string();
            tx.execute(
                "INSERT INTO events (type, campaign_id, contact_id, inbox_id, ts, metadata)
                 VALUES ('sent', ?1, ?2, ?3, ?4, ?5)",
                params![job.campaign_id, job.contact_id, inbox_id, now_raw, metadata],
            )?;
        }
        tx.commit()?;
        Ok(updated > 0)
    }

    fn record_skipped(
        &self,
        job: &SendJob,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE send_jobs
             SET state = 'skipped', completed_at = ?2, failure_reason = ?3
             WHERE id = ?1 AND state = 'claimed'",
            params![job.id.to_string(), format_datetime(now), reason],
        )?;
        Ok(updated > 0)
    }

    fn record_failed(
        &self,
        job: &SendJob,
        reason: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let updated = if retryable && job.attempts + 1 < self.retry.max_attempts {
            let backoff_secs =
                i64::from(job.attempts.max(1)).saturating_mul(self.retry.backoff_secs);
            let next_attempt = now + ChronoDuration::seconds(backoff_secs);
            conn.execute(
                "UPDATE send_jobs
                 SET state = 'queued', attempts = attempts + 1, scheduled_at = ?2,
                     claimed_at = NULL, claimed_by = NULL, failure_reason = ?3
                 WHERE id = ?1 AND state = 'claimed'",
                params![job.id.to_string(), format_datetime(next_attempt), reason],
            )?
        } else {
            conn.execute(
                "UPDATE send_jobs
                 SET state = 'failed', attempts = attempts + 1, completed_at = ?2,
                     claimed_at = NULL, claimed_by = NULL, failure_reason = ?3
                 WHERE id = ?1 AND state = 'claimed'",
                params![job.id.to_string(), format_datetime(now), reason],
            )?
        };
        Ok(updated > 0)
    }

    fn reclaim_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE send_jobs
             SET state = 'queued', claimed_at = NULL, claimed_by = NULL
             WHERE state = 'claimed' AND claimed_at < ?1",
            params![format_datetime(cutoff)],
        )?;
        Ok(updated as u64)
    }

    fn sent_count_since(
        &self,
        inbox_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.open()?;
        let since_raw = format_datetime(since);
        let count = match inbox_id {
            Some(inbox_id) => conn.query_row(
                "SELECT COUNT(*) FROM events
                 WHERE type = 'sent' AND ts >= ?1 AND inbox_id = ?2",
                params![since_raw, inbox_id],
                |row| row.get::<_, i64>(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM events WHERE type = 'sent' AND ts >= ?1",
                params![since_raw],
                |row| row.get::<_, i64>(0),
            )?,
        };
        Ok(count)
    }

    fn load_candidate_inboxes(&self) -> Result<Vec<Inbox>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, smtp_host, smtp_port, username, password, from_name, from_email,
                    daily_cap, monthly_cap, pace_seconds, health_score, disabled
             FROM inboxes
             WHERE disabled = 0
             ORDER BY health_score DESC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Inbox {
                id: row.get(0)?,
                smtp_host: row.get(1)?,
                smtp_port: row.get::<_, i64>(2)? as u16,
                username: row.get(3)?,
                password: row.get(4)?,
                from_name: row.get(5)?,
                from_email: row.get(6)?,
                daily_cap: row.get(7)?,
                monthly_cap: row.get(8)?,
                pace_seconds: row.get::<_, i64>(9)?.max(0) as u32,
                health_score: row.get(10)?,
                disabled: row.get::<_, i64>(11)? != 0,
            })
        })?;
        let mut inboxes = Vec::new();
        for row in rows {
            inboxes.push(row?);
        }
        Ok(inboxes)
    }

    fn load_job(&self, id: Uuid) -> Result<Option<SendJob>, StoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT id, campaign_id, contact_id, recipient_email, subject, body_html,
                        state, scheduled_at, attempts, failure_reason
                 FROM send_jobs WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, Option<String>>(9)?,
                    ))
                },
            )
            .optional()?;
        row.map(job_from_row).transpose()
    }

    fn is_suppressed(&self, email: &str) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM suppressions WHERE email = LOWER(?1) LIMIT 1",
                params![email],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn is_unsubscribed(&self, email: &str) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM unsubscribes WHERE email = LOWER(?1) LIMIT 1",
                params![email],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn has_reply_event(&self, campaign_id: i64, contact_id: i64) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM events
                 WHERE type = 'reply' AND campaign_id = ?1 AND contact_id = ?2
                 LIMIT 1",
                params![campaign_id, contact_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn record_heartbeat(&self, service_name: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO heartbeats (service_name, ts) VALUES (?1, ?2)
             ON CONFLICT(service_name) DO UPDATE SET ts = excluded.ts",
            params![service_name, format_datetime(now)],
        )?;
        Ok(())
    }

    fn append_event(&self, event: &NewEvent) -> Result<(), StoreError> {
        let conn = self.open()?;
        let metadata = if event.metadata.is_null() {
            None
        } else {
            Some(event.metadata.to_string())
        };
        conn.execute(
            "INSERT INTO events (type, campaign_id, contact_id, inbox_id, ts, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.kind.as_str(),
                event.campaign_id,
                event.contact_id,
                event.inbox_id,
                format_datetime(event.ts),
                metadata
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn test_store(temp: &TempDir) -> SqliteDispatchStore {
        SqliteDispatchStore::new(temp.path().join("dispatch.db"), RetryPolicy::default())
            .expect("store")
    }

    fn queued_job(email: &str, scheduled_at: DateTime<Utc>) -> NewJob {
        NewJob {
            campaign_id: 1,
            contact_id: 10,
            recipient_email: email.to_string(),
            subject: "Hello".to_string(),
            body_html: "<p>Hi</p>".to_string(),
            scheduled_at,
        }
    }

    #[test]
    fn claim_takes_oldest_scheduled_first() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();
        let late = store
            .insert_job(&queued_job("late@example.com", now - ChronoDuration::minutes(1)))
            .expect("late");
        let early = store
            .insert_job(&queued_job("early@example.com", now - ChronoDuration::minutes(5)))
            .expect("early");

        let first = store.claim_next_job(now, "w1").expect("claim").expect("job");
        assert_eq!(first.id, early);
        assert_eq!(first.state, JobState::Claimed);
        let second = store.claim_next_job(now, "w1").expect("claim").expect("job");
        assert_eq!(second.id, late);
        assert!(store.claim_next_job(now, "w1").expect("claim").is_none());
    }

    #[test]
    fn claim_breaks_scheduled_ties_by_id() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();
        let scheduled = now - ChronoDuration::minutes(1);
        let a = store
            .insert_job(&queued_job("a@example.com", scheduled))
            .expect("a");
        let b = store
            .insert_job(&queued_job("b@example.com", scheduled))
            .expect("b");
        let expected_first = if a.to_string() < b.to_string() { a } else { b };

        let first = store.claim_next_job(now, "w1").expect("claim").expect("job");
        assert_eq!(first.id, expected_first);
    }

    #[test]
    fn future_jobs_are_not_claimable() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();
        store
            .insert_job(&queued_job("later@example.com", now + ChronoDuration::minutes(5)))
            .expect("job");
        assert!(store.claim_next_job(now, "w1").expect("claim").is_none());
    }

    #[test]
    fn transient_failure_requeues_with_cooldown_then_exhausts() {
        let temp = TempDir::new().expect("tempdir");
        let store = SqliteDispatchStore::new(
            temp.path().join("dispatch.db"),
            RetryPolicy {
                max_attempts: 2,
                backoff_secs: 60,
            },
        )
        .expect("store");
        let now = Utc::now();
        let id = store
            .insert_job(&queued_job("retry@example.com", now - ChronoDuration::minutes(1)))
            .expect("job");

        let job = store.claim_next_job(now, "w1").expect("claim").expect("job");
        store
            .record_failed(&job, "connection timed out", true, now)
            .expect("record");
        let requeued = store.load_job(id).expect("load").expect("job");
        assert_eq!(requeued.state, JobState::Queued);
        assert_eq!(requeued.attempts, 1);
        assert!(requeued.scheduled_at >= now + ChronoDuration::seconds(59));
        assert!(store.claim_next_job(now, "w1").expect("claim").is_none());

        let later = requeued.scheduled_at + ChronoDuration::seconds(1);
        let job = store.claim_next_job(later, "w1").expect("claim").expect("job");
        store
            .record_failed(&job, "connection timed out", true, later)
            .expect("record");
        let exhausted = store.load_job(id).expect("load").expect("job");
        assert_eq!(exhausted.state, JobState::Failed);
        assert_eq!(exhausted.attempts, 2);
        assert_eq!(exhausted.failure_reason.as_deref(), Some("connection timed out"));
    }

    #[test]
    fn stale_claims_are_requeued() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();
        let id = store
            .insert_job(&queued_job("stuck@example.com", now - ChronoDuration::minutes(1)))
            .expect("job");
        store.claim_next_job(now, "w1").expect("claim").expect("job");

        let recovered = store
            .reclaim_stale_claims(now + ChronoDuration::seconds(1))
            .expect("reclaim");
        assert_eq!(recovered, 1);
        let job = store.load_job(id).expect("load").expect("job");
        assert_eq!(job.state, JobState::Queued);
    }

    #[test]
    fn heartbeat_upsert_is_last_write_wins() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let first = Utc::now() - ChronoDuration::minutes(5);
        let second = Utc::now();
        store.record_heartbeat("sendbot-worker", first).expect("first");
        store.record_heartbeat("sendbot-worker", second).expect("second");
        let ts = store
            .load_heartbeat("sendbot-worker")
            .expect("load")
            .expect("row");
        assert_eq!(format_datetime(ts), format_datetime(second));
        assert!(ts > first);
        assert!(store.load_heartbeat("other").expect("load").is_none());
    }

    #[test]
    fn suppression_lookups_are_case_insensitive() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        store
            .add_suppression("Blocked@Example.com", "complaint")
            .expect("suppress");
        assert!(store.is_suppressed("blocked@example.com").expect("check"));
        assert!(store.is_suppressed("BLOCKED@EXAMPLE.COM").expect("check"));
        assert!(!store.is_suppressed("fine@example.com").expect("check"));
    }

    #[test]
    fn sent_counts_are_windowed_and_scoped() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();
        for (inbox_id, ts) in [
            (1, now),
            (1, now - ChronoDuration::minutes(10)),
            (2, now),
            (1, now - ChronoDuration::days(2)),
        ] {
            store
                .append_event(&NewEvent {
                    kind: EventKind::Sent,
                    campaign_id: Some(1),
                    contact_id: Some(10),
                    inbox_id: Some(inbox_id),
                    ts,
                    metadata: serde_json::Value::Null,
                })
                .expect("event");
        }
        let since = now - ChronoDuration::hours(1);
        assert_eq!(store.sent_count_since(Some(1), since).expect("count"), 2);
        assert_eq!(store.sent_count_since(Some(2), since).expect("count"), 1);
        assert_eq!(store.sent_count_since(None, since).expect("count"), 3);
    }
}
