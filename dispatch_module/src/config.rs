use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Worker configuration, read once at startup. Env names follow the deployed
/// worker: `DB_URL`, `SERVICE_NAME`, `GLOBAL_DAILY_CAP`, `APP_BASE_URL`,
/// `UNSUBSCRIBE_INBOX`.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Postgres connection string; absent means the SQLite store is used.
    pub db_url: Option<String>,
    /// SQLite fallback path when `DB_URL` is not set.
    pub sqlite_path: PathBuf,
    /// Heartbeat row name for this service.
    pub service_name: String,
    /// Claimant id stamped on leased jobs.
    pub instance_id: String,
    pub global_daily_cap: i64,
    pub pace_jitter_pct: f64,
    /// Claims older than this are requeued by the sweeper.
    pub claim_stale_secs: i64,
    pub sweep_interval: Duration,
    pub idle_sleep: Duration,
    pub defer_sleep: Duration,
    pub max_send_attempts: i32,
    pub retry_backoff_secs: i64,
    /// Consecutive store failures tolerated before the loop exits.
    pub store_error_threshold: u32,
    pub app_base_url: String,
    pub unsubscribe_inbox: String,
    /// Render and record without transmitting.
    pub dry_run: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let db_url = env_var_non_empty("DB_URL").or_else(|| env_var_non_empty("DATABASE_URL"));
        let sqlite_path = resolve_path(
            env_var_non_empty("DISPATCH_DB_PATH")
                .unwrap_or_else(|| "state/dispatch.db".to_string()),
        )?;
        let service_name =
            env_var_non_empty("SERVICE_NAME").unwrap_or_else(|| "sendbot-worker".to_string());
        let instance_id = resolve_worker_instance_id(&service_name);

        Ok(Self {
            db_url,
            sqlite_path,
            service_name,
            instance_id,
            global_daily_cap: resolve_i64_env("GLOBAL_DAILY_CAP", 300),
            pace_jitter_pct: resolve_f64_env("PACE_JITTER_PCT", 0.2),
            claim_stale_secs: resolve_i64_env("CLAIM_STALE_SECS", 600),
            sweep_interval: Duration::from_secs(resolve_u64_env("SWEEP_INTERVAL_SECS", 60)),
            idle_sleep: Duration::from_secs(resolve_u64_env("IDLE_SLEEP_SECS", 5)),
            defer_sleep: Duration::from_secs(resolve_u64_env("DEFER_SLEEP_SECS", 30)),
            max_send_attempts: resolve_i64_env("MAX_SEND_ATTEMPTS", 3) as i32,
            retry_backoff_secs: resolve_i64_env("RETRY_BACKOFF_SECS", 300),
            store_error_threshold: resolve_u64_env("STORE_ERROR_THRESHOLD", 5) as u32,
            app_base_url: env_var_non_empty("APP_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8000".to_string()),
            unsubscribe_inbox: env_var_non_empty("UNSUBSCRIBE_INBOX")
                .unwrap_or_else(|| "unsubscribe@yourdomain.com".to_string()),
            dry_run: env_flag("DRY_RUN", false),
        })
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y"
        ),
        Err(_) => default,
    }
}

fn resolve_i64_env(key: &str, default_value: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_value)
}

fn resolve_u64_env(key: &str, default_value: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_value)
}

fn resolve_f64_env(key: &str, default_value: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| *value >= 0.0 && *value < 1.0)
        .unwrap_or(default_value)
}

fn resolve_worker_instance_id(service_name: &str) -> String {
    if let Some(value) = env_var_non_empty("WORKER_INSTANCE_ID") {
        return value;
    }
    if let Some(hostname) = env_var_non_empty("HOSTNAME") {
        return format!("{}@{}", service_name, hostname);
    }
    format!("{}-pid-{}", service_name, std::process::id())
}

fn resolve_path(raw: String) -> Result<PathBuf, std::io::Error> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = env::current_dir()?;
        Ok(cwd.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = env::var(key).ok();
            env::set_var(key, value);
            Self { key, previous }
        }

        fn unset(key: &'static str) -> Self {
            let previous = env::var(key).ok();
            env::remove_var(key);
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.previous {
                Some(value) => env::set_var(self.key, value),
                None => env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn defaults_apply_without_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _db = EnvGuard::unset("DB_URL");
        let _database = EnvGuard::unset("DATABASE_URL");
        let _cap = EnvGuard::unset("GLOBAL_DAILY_CAP");
        let _name = EnvGuard::unset("SERVICE_NAME");
        let _dry = EnvGuard::unset("DRY_RUN");

        let config = WorkerConfig::from_env().expect("config");
        assert!(config.db_url.is_none());
        assert_eq!(config.service_name, "sendbot-worker");
        assert_eq!(config.global_daily_cap, 300);
        assert!((config.pace_jitter_pct - 0.2).abs() < f64::EPSILON);
        assert!(!config.dry_run);
        assert!(config.sqlite_path.is_absolute());
    }

    #[test]
    fn env_overrides_are_honored() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _cap = EnvGuard::set("GLOBAL_DAILY_CAP", "25");
        let _name = EnvGuard::set("SERVICE_NAME", "sendbot-worker-2");
        let _dry = EnvGuard::set("DRY_RUN", "true");
        let _instance = EnvGuard::set("WORKER_INSTANCE_ID", "worker-a");

        let config = WorkerConfig::from_env().expect("config");
        assert_eq!(config.global_daily_cap, 25);
        assert_eq!(config.service_name, "sendbot-worker-2");
        assert_eq!(config.instance_id, "worker-a");
        assert!(config.dry_run);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _db = EnvGuard::set("DB_URL", "  ");
        let _database = EnvGuard::unset("DATABASE_URL");
        let _cap = EnvGuard::set("GLOBAL_DAILY_CAP", "not-a-number");

        let config = WorkerConfig::from_env().expect("config");
        assert!(config.db_url.is_none());
        assert_eq!(config.global_daily_cap, 300);
    }
}
