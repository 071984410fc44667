mod bot;
mod commands;
mod config;
mod db;
mod error;
mod notify;
mod reconciler;
mod render;
mod source;
mod state;
mod status;
mod telegram;
mod timestamp;
mod web;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use commands::CommandRouter;
use config::Env;
use db::Db;
use notify::NotificationDispatcher;
use reconciler::Reconciler;
use source::{DataSource, SrcfulClient};
use state::MonitorState;
use telegram::TelegramClient;

/// Log to stdout and to a daily rolling file in `log_dir`, keeping the
/// newest three files. The guard flushes the file writer on drop.
fn init_tracing(log_dir: &str) -> Result<WorkerGuard> {
    let appender = Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix("gateway-monitor")
        .filename_suffix("log")
        .max_log_files(3)
        .build(log_dir)
        .with_context(|| format!("failed to open log directory: {log_dir}"))?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Env + logging ───────────────────────────────────────────────
    let env = Env::from_env()?;
    let _log_guard = init_tracing(&env.log_dir)?;

    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load(&env.config_path)?;
    let settings = cfg.reconciler_settings()?;
    let web_port = env.web_port.unwrap_or(cfg.web.port);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&env.db_url).await?;
    db.migrate().await?;

    let subscribed = db.subscribed_gateway_ids().await?;
    info!(gateways = subscribed.len(), "db ready");

    // ── Collaborators ───────────────────────────────────────────────
    let source: Arc<dyn DataSource> = Arc::new(
        SrcfulClient::new(&cfg.data_source.api_url, &env.auth_token, settings.fetch_timeout)
            .context("failed to build data source client")?,
    );
    let telegram = Arc::new(TelegramClient::new(&env.telegram_token)?);

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared = MonitorState::shared();
    shared
        .write()
        .await
        .record_system("monitor started".to_string());

    let (stop_tx, stop_rx) = watch::channel(false);

    // ── Status API ──────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: Arc::clone(&shared),
        db: db.clone(),
    };
    let web_stop = stop_rx.clone();
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port, web_stop).await {
            error!("web: {e:#}");
        }
    });

    // ── Bot ─────────────────────────────────────────────────────────
    let router = CommandRouter::new(db.clone(), Arc::clone(&source), settings.fetch_timeout);
    let bot_task = tokio::spawn(bot::run(
        Arc::clone(&telegram),
        router,
        Arc::clone(&shared),
        stop_rx.clone(),
    ));

    // ── Reconciler ──────────────────────────────────────────────────
    let dispatcher = NotificationDispatcher::new(db.clone(), telegram, Arc::clone(&shared));
    let reconciler = Reconciler::new(db, source, dispatcher, Arc::clone(&shared), settings);
    let reconciler_task = tokio::spawn(reconciler.run(stop_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    shared
        .write()
        .await
        .record_system("shutdown requested".to_string());
    // Receivers may already be gone if a task exited early.
    let _ = stop_tx.send(true);

    for (name, task) in [
        ("reconciler", reconciler_task),
        ("bot", bot_task),
        ("web", web_task),
    ] {
        if let Err(e) = task.await {
            error!("{name} task panicked: {e}");
        }
    }

    info!("monitor stopped");
    Ok(())
}
