use chrono::{DateTime, Duration as ChronoDuration, Utc};
use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use std::env;
use tracing::error;
use uuid::Uuid;

use crate::store::{DispatchStore, RetryPolicy, StoreError};
use crate::types::{Inbox, JobState, NewEvent, NewJob, SendJob};

const DISPATCH_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS send_jobs (
    id UUID PRIMARY KEY,
    campaign_id BIGINT NOT NULL,
    contact_id BIGINT NOT NULL,
    recipient_email TEXT NOT NULL,
    subject TEXT NOT NULL,
    body_html TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'queued',
    scheduled_at TIMESTAMPTZ NOT NULL,
    claimed_at TIMESTAMPTZ,
    claimed_by TEXT,
    completed_at TIMESTAMPTZ,
    attempts INTEGER NOT NULL DEFAULT 0,
    failure_reason TEXT
);
CREATE INDEX IF NOT EXISTS send_jobs_queued_idx
    ON send_jobs(state, scheduled_at, id);

CREATE TABLE IF NOT EXISTS inboxes (
    id BIGSERIAL PRIMARY KEY,
    smtp_host TEXT NOT NULL,
    smtp_port INTEGER NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL,
    from_name TEXT NOT NULL,
    from_email TEXT NOT NULL,
    daily_cap BIGINT NOT NULL,
    monthly_cap BIGINT,
    pace_seconds INTEGER NOT NULL,
    health_score DOUBLE PRECISION NOT NULL DEFAULT 1.0,
    disabled BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS events (
    id BIGSERIAL PRIMARY KEY,
    type TEXT NOT NULL,
    campaign_id BIGINT,
    contact_id BIGINT,
    inbox_id BIGINT,
    ts TIMESTAMPTZ NOT NULL,
    metadata TEXT
);
CREATE INDEX IF NOT EXISTS events_sent_idx ON events(type, ts, inbox_id);

CREATE TABLE IF NOT EXISTS suppressions (
    email TEXT PRIMARY KEY,
    reason TEXT,
    ts TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS unsubscribes (
    email TEXT PRIMARY KEY,
    ts TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS heartbeats (
    service_name TEXT PRIMARY KEY,
    ts TIMESTAMPTZ NOT NULL
);
";

/// Logs pool connection errors instead of swallowing them.
#[derive(Debug)]
struct LoggingErrorHandler;

impl r2d2::HandleError<postgres::Error> for LoggingErrorHandler {
    fn handle_error(&self, err: postgres::Error) {
        error!("dispatch store postgres pool error: {:?}", err);
    }
}

/// Shared dispatch store for multi-worker deployments. Claiming runs
/// SELECT ... FOR UPDATE SKIP LOCKED plus the state transition inside one
/// transaction, so concurrent workers never take the same job.
#[derive(Clone)]
pub struct PostgresDispatchStore {
    pool: Option<Pool<PostgresConnectionManager<MakeTlsConnector>>>,
    retry: RetryPolicy,
}

impl PostgresDispatchStore {
    pub fn new(db_url: &str, retry: RetryPolicy) -> Result<Self, StoreError> {
        let config: postgres::Config = db_url.parse()?;

        let mut tls_builder = native_tls::TlsConnector::builder();
        if env::var("DISPATCH_TLS_ALLOW_INVALID_CERTS")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
        {
            tls_builder.danger_accept_invalid_certs(true);
            tls_builder.danger_accept_invalid_hostnames(true);
        }
        let tls_connector = tls_builder
            .build()
            .map_err(|err| StoreError::Config(err.to_string()))?;
        let tls = MakeTlsConnector::new(tls_connector);

        let manager = PostgresConnectionManager::new(config, tls);
        let pool = Pool::builder()
            .max_size(4)
            .connection_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(Some(std::time::Duration::from_secs(300)))
            .error_handler(Box::new(LoggingErrorHandler))
            .build(manager)?;
        let store = Self {
            pool: Some(pool),
            retry,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connection(
        &self,
    ) -> Result<PooledConnection<PostgresConnectionManager<MakeTlsConnector>>, StoreError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| StoreError::Config("dispatch store pool dropped".to_string()))?;
        Ok(pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.batch_execute(DISPATCH_SCHEMA)?;
        Ok(())
    }

    /// Insert a queued job. The enqueueing surface owns this in production;
    /// exposed here for seeding and operational tooling.
    pub fn insert_job(&self, job: &NewJob) -> Result<Uuid, StoreError> {
        let mut conn = self.connection()?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO send_jobs
                (id, campaign_id, contact_id, recipient_email, subject, body_html, state, scheduled_at, attempts)
             VALUES ($1, $2, $3, $4, $5, $6, 'queued', $7, 0)",
            &[
                &id,
                &job.campaign_id,
                &job.contact_id,
                &job.recipient_email,
                &job.subject,
                &job.body_html,
                &job.scheduled_at,
            ],
        )?;
        Ok(id)
    }

    pub fn upsert_inbox(&self, inbox: &Inbox) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "INSERT INTO inboxes
                (id, smtp_host, smtp_port, username, password, from_name, from_email,
                 daily_cap, monthly_cap, pace_seconds, health_score, disabled)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (id) DO UPDATE SET
                smtp_host = excluded.smtp_host,
                smtp_port = excluded.smtp_port,
                username = excluded.username,
                password = excluded.password,
                from_name = excluded.from_name,
                from_email = excluded.from_email,
                daily_cap = excluded.daily_cap,
                monthly_cap = excluded.monthly_cap,
                pace_seconds = excluded.pace_seconds,
                health_score = excluded.health_score,
                disabled = excluded.disabled",
            &[
                &inbox.id,
                &inbox.smtp_host,
                &i32::from(inbox.smtp_port),
                &inbox.username,
                &inbox.password,
                &inbox.from_name,
                &inbox.from_email,
                &inbox.daily_cap,
                &inbox.monthly_cap,
                &(inbox.pace_seconds as i32),
                &inbox.health_score,
                &inbox.disabled,
            ],
        )?;
        Ok(())
    }

    pub fn add_suppression(&self, email: &str, reason: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "INSERT INTO suppressions (email, reason, ts) VALUES (LOWER($1), $2, $3)
             ON CONFLICT (email) DO UPDATE SET reason = excluded.reason, ts = excluded.ts",
            &[&email, &reason, &Utc::now()],
        )?;
        Ok(())
    }

    pub fn add_unsubscribe(&self, email: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "INSERT INTO unsubscribes (email, ts) VALUES (LOWER($1), $2)
             ON CONFLICT (email) DO UPDATE SET ts = excluded.ts",
            &[&email, &Utc::now()],
        )?;
        Ok(())
    }
}

fn job_from_pg_row(row: &postgres::Row, state: JobState) -> SendJob {
    SendJob {
        id: row.get(0),
        campaign_id: row.get(1),
        contact_id: row.get(2),
        recipient_email: row.get(3),
        subject: row.get(4),
        body_html: row.get(5),
        state,
        scheduled_at: row.get(7),
        attempts: row.get(8),
        failure_reason: row.get(9),
    }
}

const JOB_COLUMNS: &str = "id, campaign_id, contact_id, recipient_email, subject, body_html, \
                           state, scheduled_at, attempts, failure_reason";

impl DispatchStore for PostgresDispatchStore {
    fn claim_next_job(
        &self,
        now: DateTime<Utc>,
        claimed_by: &str,
    ) -> Result<Option<SendJob>, StoreError> {
        let mut conn = self.connection()?;
        let mut tx = conn.transaction()?;
        let row = tx.query_opt(
            &format!(
                "SELECT {JOB_COLUMNS}
                 FROM send_jobs
                 WHERE state = 'queued' AND scheduled_at <= $1
                 ORDER BY scheduled_at, id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED"
            ),
            &[&now],
        )?;

        let Some(row) = row else {
            tx.commit()?;
            return Ok(None);
        };

        let id: Uuid = row.get(0);
        let updated = tx.execute(
            "UPDATE send_jobs
             SET state = 'claimed', claimed_at = $2, claimed_by = $3
             WHERE id = $1 AND state = 'queued'",
            &[&id, &now, &claimed_by],
        )?;
        if updated == 0 {
            tx.commit()?;
            return Ok(None);
        }
        tx.commit()?;

        Ok(Some(job_from_pg_row(&row, JobState::Claimed)))
    }

    fn requeue_job(&self, id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "UPDATE send_jobs
             SET state = 'queued', claimed_at = NULL, claimed_by = NULL
             WHERE id = $1 AND state = 'claimed'",
            &[&id],
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
        let mut conn = self.connection()?;
        let mut tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE send_jobs
             SET state = 'sent', completed_at = $2, failure_reason = NULL
             WHERE id = $1 AND state = 'claimed'",
            &[&job.id, &now],
        )?;
        if updated > 0 {
            let metadata = serde_json::json!({ "message_id": message_id }).to_string();
            tx.execute(
                "INSERT INTO events (type, campaign_id, contact_id, inbox_id, ts, metadata)
                 VALUES ('sent', $1, $2, $3, $4, $5)",
                &[&job.campaign_id, &job.contact_id, &inbox_id, &now, &metadata],
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
        let mut conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE send_jobs
             SET state = 'skipped', completed_at = $2, failure_reason = $3
             WHERE id = $1 AND state = 'claimed'",
            &[&job.id, &now, &reason],
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
        let mut conn = self.connection()?;
        let updated = if retryable && job.attempts + 1 < self.retry.max_attempts {
            let backoff_secs =
                i64::from(job.attempts.max(1)).saturating_mul(self.retry.backoff_secs);
            let next_attempt = now + ChronoDuration::seconds(backoff_secs);
            conn.execute(
                "UPDATE send_jobs
                 SET state = 'queued', attempts = attempts + 1, scheduled_at = $2,
                     claimed_at = NULL, claimed_by = NULL, failure_reason = $3
                 WHERE id = $1 AND state = 'claimed'",
                &[&job.id, &next_attempt, &reason],
            )?
        } else {
            conn.execute(
                "UPDATE send_jobs
                 SET state = 'failed', attempts = attempts + 1, completed_at = $2,
                     claimed_at = NULL, claimed_by = NULL, failure_reason = $3
                 WHERE id = $1 AND state = 'claimed'",
                &[&job.id, &now, &reason],
            )?
        };
        Ok(updated > 0)
    }

    fn reclaim_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE send_jobs
             SET state = 'queued', claimed_at = NULL, claimed_by = NULL
             WHERE state = 'claimed' AND claimed_at < $1",
            &[&cutoff],
        )?;
        Ok(updated)
    }

    fn sent_count_since(
        &self,
        inbox_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut conn = self.connection()?;
        let row = match inbox_id {
            Some(inbox_id) => conn.query_one(
                "SELECT COUNT(*) FROM events
                 WHERE type = 'sent' AND ts >= $1 AND inbox_id = $2",
                &[&since, &inbox_id],
            )?,
            None => conn.query_one(
                "SELECT COUNT(*) FROM events WHERE type = 'sent' AND ts >= $1",
                &[&since],
            )?,
        };
        Ok(row.get(0))
    }

    fn load_candidate_inboxes(&self) -> Result<Vec<Inbox>, StoreError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            "SELECT id, smtp_host, smtp_port, username, password, from_name, from_email,
                    daily_cap, monthly_cap, pace_seconds, health_score, disabled
             FROM inboxes
             WHERE NOT disabled
             ORDER BY health_score DESC, id ASC",
            &[],
        )?;
        let inboxes = rows
            .iter()
            .map(|row| Inbox {
                id: row.get(0),
                smtp_host: row.get(1),
                smtp_port: row.get::<_, i32>(2) as u16,
                username: row.get(3),
                password: row.get(4),
                from_name: row.get(5),
                from_email: row.get(6),
                daily_cap: row.get(7),
                monthly_cap: row.get(8),
                pace_seconds: row.get::<_, i32>(9).max(0) as u32,
                health_score: row.get(10),
                disabled: row.get(11),
            })
            .collect();
        Ok(inboxes)
    }

    fn load_job(&self, id: Uuid) -> Result<Option<SendJob>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!("SELECT {JOB_COLUMNS} FROM send_jobs WHERE id = $1"),
            &[&id],
        )?;
        match row {
            Some(row) => {
                let state: JobState = row
                    .get::<_, String>(6)
                    .parse()
                    .map_err(StoreError::Storage)?;
                Ok(Some(job_from_pg_row(&row, state)))
            }
            None => Ok(None),
        }
    }

    fn is_suppressed(&self, email: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            "SELECT 1 FROM suppressions WHERE email = LOWER($1) LIMIT 1",
            &[&email],
        )?;
        Ok(row.is_some())
    }

    fn is_unsubscribed(&self, email: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            "SELECT 1 FROM unsubscribes WHERE email = LOWER($1) LIMIT 1",
            &[&email],
        )?;
        Ok(row.is_some())
    }

    fn has_reply_event(&self, campaign_id: i64, contact_id: i64) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            "SELECT 1 FROM events
             WHERE type = 'reply' AND campaign_id = $1 AND contact_id = $2
             LIMIT 1",
            &[&campaign_id, &contact_id],
        )?;
        Ok(row.is_some())
    }

    fn record_heartbeat(&self, service_name: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "INSERT INTO heartbeats (service_name, ts) VALUES ($1, $2)
             ON CONFLICT (service_name) DO UPDATE SET ts = excluded.ts",
            &[&service_name, &now],
        )?;
        Ok(())
    }

    fn append_event(&self, event: &NewEvent) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let metadata = if event.metadata.is_null() {
            None
        } else {
            Some(event.metadata.to_string())
        };
        conn.execute(
            "INSERT INTO events (type, campaign_id, contact_id, inbox_id, ts, metadata)
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &event.kind.as_str(),
                &event.campaign_id,
                &event.contact_id,
                &event.inbox_id,
                &event.ts,
                &metadata,
            ],
        )?;
        Ok(())
    }
}

impl Drop for PostgresDispatchStore {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            std::thread::spawn(move || drop(pool));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn require_db_url(test_name: &str) -> Option<String> {
        dotenvy::dotenv().ok();
        for key in ["DB_URL", "DATABASE_URL"] {
            if let Ok(value) = env::var(key) {
                if !value.trim().is_empty() {
                    return Some(value);
                }
            }
        }
        eprintln!("Skipping {test_name}; DB_URL not set.");
        None
    }

    #[test]
    fn claim_and_record_roundtrip() {
        let Some(db_url) = require_db_url("claim_and_record_roundtrip") else {
            return;
        };
        let store = PostgresDispatchStore::new(&db_url, RetryPolicy::default()).expect("store");
        let campaign_id: i64 = rand::thread_rng().gen_range(1_000_000..i64::MAX);
        let now = Utc::now();
        let id = store
            .insert_job(&NewJob {
                campaign_id,
                contact_id: 1,
                recipient_email: "roundtrip@example.com".to_string(),
                subject: "Hello".to_string(),
                body_html: "<p>Hi</p>".to_string(),
                scheduled_at: now - ChronoDuration::minutes(1),
            })
            .expect("insert");

        // A shared database may hold unrelated queued jobs; hold foreign
        // claims until our job comes up, then put them back.
        let mut foreign = Vec::new();
        let mut job = None;
        for _ in 0..50 {
            let Some(claimed) = store.claim_next_job(now, "test-worker").expect("claim") else {
                break;
            };
            if claimed.id == id {
                job = Some(claimed);
                break;
            }
            foreign.push(claimed.id);
        }
        for foreign_id in foreign {
            store.requeue_job(foreign_id).expect("requeue foreign job");
        }
        let job = job.expect("our job claimed");
        assert!(store
            .record_sent(&job, 0, "<roundtrip@test>", now)
            .expect("record"));
        let stored = store.load_job(id).expect("load").expect("job");
        assert_eq!(stored.state, JobState::Sent);
        assert!(
            store
                .sent_count_since(None, now - ChronoDuration::minutes(1))
                .expect("count")
                > 0
        );

        let mut conn = store.connection().expect("conn");
        conn.execute("DELETE FROM send_jobs WHERE id = $1", &[&id])
            .expect("cleanup jobs");
        conn.execute("DELETE FROM events WHERE campaign_id = $1", &[&campaign_id])
            .expect("cleanup events");
    }
}
