use std::path::PathBuf;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genloop_comfyui::api::ComfyUIApi;
use genloop_comfyui::queue::HttpQueueClient;
use genloop_comfyui::retry::RetryPolicy;
use genloop_core::config::ConfigModel;
use genloop_core::settings::Settings;
use genloop_db::repositories::RunRecordRepo;
use genloop_db::store::SqliteRunStore;
use genloop_worker::orchestrator::Orchestrator;
use genloop_worker::recorder::RunRecorder;
use genloop_worker::watcher::ResultWatcher;

/// Configuration file used when `GENLOOP_CONFIG` is unset.
const DEFAULT_CONFIG_FILE: &str = "config.yml";

/// How many checkpoints the end-of-run usage table lists.
const USAGE_TOP_N: usize = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "genloop=info,genloop_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = PathBuf::from(
        std::env::var("GENLOOP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string()),
    );
    let mut settings = Settings::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Ok(url) = std::env::var("COMFYUI_URL") {
        tracing::info!(url = %url, "Server URL overridden from environment");
        settings.server.url = url;
    }
    let config = ConfigModel::from_settings(settings).context("invalid configuration")?;
    let settings = config.settings();

    let run_tag = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let client_id = settings
        .server
        .client_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::info!(
        run_tag = %run_tag,
        server = %settings.server.url,
        client_id = %client_id,
        config = %config_path.display(),
        "genloop starting",
    );

    let pool = genloop_db::open(&settings.paths.data_dir)
        .await
        .context("opening run database")?;

    let api = ComfyUIApi::new(settings.server.url.clone()).context("building HTTP client")?;
    let queue = HttpQueueClient::new(
        api,
        client_id,
        RetryPolicy::from(&settings.run.retry),
        settings.paths.output_dir.clone(),
    );

    let watcher = if settings.run.watch_outputs {
        match ResultWatcher::watch(&settings.paths.output_dir, &run_tag) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "Output watcher unavailable, using history outputs only");
                None
            }
        }
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let recorder = RunRecorder::new(SqliteRunStore::new(pool.clone()));
    let orchestrator = Orchestrator::new(config, queue, recorder, watcher, run_tag.clone());
    let summary = orchestrator.run(cancel).await?;

    report_usage(&pool, &run_tag).await;
    pool.close().await;

    if summary.lost_records > 0 {
        tracing::error!(lost = summary.lost_records, "Some run records could not be written");
    }
    Ok(())
}

/// Log outcome counts of this run and overall checkpoint usage.
async fn report_usage(pool: &genloop_db::DbPool, run_tag: &str) {
    match RunRecordRepo::outcome_counts(pool, run_tag).await {
        Ok(counts) => {
            for c in counts {
                tracing::info!(outcome = %c.outcome, count = c.count, "Run outcomes");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to read outcome counts"),
    }
    match RunRecordRepo::checkpoint_usage(pool).await {
        Ok(usage) => {
            for u in usage.into_iter().take(USAGE_TOP_N) {
                tracing::info!(
                    checkpoint_type = %u.checkpoint_type,
                    checkpoint = %u.checkpoint,
                    count = u.count,
                    "Checkpoint usage",
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to read checkpoint usage"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), finishing in-flight jobs");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, finishing in-flight jobs");
        }
    }
}
