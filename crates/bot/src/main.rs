//! `fluxbot` -- Telegram front end for a local ComfyUI image-edit workflow.
//!
//! Accepts an image and a prompt per request, queues it, and runs jobs one
//! at a time on the GPU. The engine is started on demand once enough GPU
//! memory is free and stopped again when the queue runs dry.
//!
//! See [`fluxbot_bot::config::BotConfig::from_env`] for the environment
//! variables.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fluxbot_bot::config::BotConfig;
use fluxbot_bot::handlers::Bot;
use fluxbot_bot::notifier::TelegramNotifier;
use fluxbot_bot::telegram::TelegramApi;
use fluxbot_bot::workspace;
use fluxbot_engine::{EngineClient, EngineLifecycle, EngineProcessController, WorkflowTemplate};
use fluxbot_gpu::{AdmissionController, NvmlProbe};
use fluxbot_worker::{AbortController, CompletionLog, JobQueue, JobService, WorkerLoop};
use tokio_util::sync::CancellationToken;

/// How long `getUpdates` holds a request open.
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on waiting for the poller to finish its current update.
const POLLER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fluxbot=info,fluxbot_bot=info,fluxbot_worker=info,fluxbot_engine=info,fluxbot_gpu=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = BotConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });
    let config = Arc::new(config);
    tracing::info!(
        engine = %config.engine_address,
        workspace = %config.workspace_dir.display(),
        gpu_index = config.gpu_index,
        max_used_percent = config.admission.max_used_percent,
        "Loaded configuration",
    );

    // --- Workspace and workflow ---
    workspace::prepare(&config.workspace_dir)
        .await
        .with_context(|| format!("preparing workspace {}", config.workspace_dir.display()))?;
    let workflow = WorkflowTemplate::load(&config.workflow_path, config.nodes.clone())
        .await
        .with_context(|| format!("loading workflow {}", config.workflow_path.display()))?;

    // --- Engine ---
    let engine = Arc::new(EngineProcessController::new(config.process_config()));
    let client = Arc::new(EngineClient::new(
        config.endpoint(),
        workflow,
        config.workspace_dir.clone(),
    ));

    // --- GPU admission ---
    let probe = Arc::new(NvmlProbe::new(config.gpu_index));
    if !probe.nvml_available() {
        tracing::info!("Reading GPU memory through nvidia-smi");
    }
    let admission = Arc::new(AdmissionController::new(probe, config.admission));

    // --- Telegram ---
    let api = Arc::new(
        TelegramApi::new(&config.telegram_api_url, &config.telegram_token, POLL_TIMEOUT)
            .context("building Telegram client")?,
    );
    let me = api.get_me().await.context("verifying Telegram token")?;
    tracing::info!(bot_id = me.id, username = ?me.username, "Connected to Telegram");
    let notifier = Arc::new(TelegramNotifier::new(Arc::clone(&api)));

    // --- Queue, service, worker ---
    let queue = Arc::new(JobQueue::new());
    let completions = Arc::new(CompletionLog::new(config.completion_log_path.clone()));
    let service = Arc::new(
        JobService::new(
            Arc::clone(&queue),
            AbortController::new(Arc::clone(&queue), engine.clone()),
            notifier.clone(),
            Arc::clone(&completions),
        )
        .with_job_estimate(config.job_estimate),
    );

    let worker = WorkerLoop::new(
        queue,
        engine.clone(),
        client,
        admission,
        notifier,
        completions,
        config.worker_config(),
    )
    .spawn();

    // --- Poller ---
    let cancel = CancellationToken::new();
    let bot = Bot::new(api, service, Arc::clone(&config));
    let poller = {
        let cancel = cancel.clone();
        tokio::spawn(async move { bot.run(cancel).await })
    };

    shutdown_signal().await;

    // --- Shutdown ---
    cancel.cancel();
    if tokio::time::timeout(POLLER_SHUTDOWN_TIMEOUT, poller).await.is_err() {
        tracing::warn!("Update poller did not stop in time");
    }
    worker.shutdown().await;
    engine.kill().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
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
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
