use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use dispatch_module::{
    DispatchStore, Dispatcher, DryRunExecutor, PostgresDispatchStore, RetryPolicy, SmtpExecutor,
    SqliteDispatchStore, WorkerConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().init();

    let config = WorkerConfig::from_env()?;
    let retry = RetryPolicy {
        max_attempts: config.max_send_attempts,
        backoff_secs: config.retry_backoff_secs,
    };

    let store: Arc<dyn DispatchStore> = match config.db_url.clone() {
        Some(db_url) => {
            let retry = retry.clone();
            let store =
                tokio::task::spawn_blocking(move || PostgresDispatchStore::new(&db_url, retry))
                    .await??;
            Arc::new(store)
        }
        None => Arc::new(SqliteDispatchStore::new(&config.sqlite_path, retry)?),
    };

    info!(
        "{} starting (instance {}, global cap {}, dry_run {})",
        config.service_name, config.instance_id, config.global_daily_cap, config.dry_run
    );

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received; finishing current job");
            stop.store(true, Ordering::Relaxed);
        });
    }

    if config.dry_run {
        let dispatcher = Dispatcher::new(config, store, DryRunExecutor);
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || dispatcher.run_loop(&stop)).await??;
    } else {
        let executor = SmtpExecutor::new(
            config.app_base_url.clone(),
            config.unsubscribe_inbox.clone(),
        );
        let dispatcher = Dispatcher::new(config, store, executor);
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || dispatcher.run_loop(&stop)).await??;
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
