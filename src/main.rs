use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use revision_bot::channels::{Channel, TelegramChannel};
use revision_bot::config::BotConfig;
use revision_bot::google::{
    DriveClient, GoogleClient, ServiceAccountKey, SheetAnswerSink, SheetQuestions, SheetRoster,
    SheetsClient, TokenProvider,
};
use revision_bot::review::{
    AuthorizationGate, Dispatcher, PersistenceAdapter, QuestionCatalog, QuestionSource,
    ReviewEngine, ReviewScheduler, spawn_scheduler_ticker,
};
use revision_bot::store::{LibSqlBackend, StateStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BotConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export TELEGRAM_BOT_TOKEN=... REVIEW_DRIVE_ROOT_FOLDER=...");
        std::process::exit(1);
    });

    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📋 Revision Bot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Schedule: {} (UTC{})",
        config.scheduler.schedule, config.scheduler.utc_offset
    );
    eprintln!("   Answers: {} / {}", config.google.answers_spreadsheet, config.google.answers_worksheet);
    eprintln!("   State DB: {}", config.db_path.display());

    // ── State ────────────────────────────────────────────────────────────
    let state: Arc<dyn StateStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening state database {}", config.db_path.display()))?,
    );

    // ── Google ───────────────────────────────────────────────────────────
    let http = reqwest::Client::new();
    let key = ServiceAccountKey::from_file(&config.google.credentials_path)?;
    eprintln!("   Service account: {}", key.client_email);
    let auth = Arc::new(TokenProvider::new(key, http.clone()));
    let google = GoogleClient::new(http, auth, config.engine.io_timeout);
    let drive = Arc::new(DriveClient::new(google.clone(), &config.google.drive_root_folder));
    let sheets = Arc::new(SheetsClient::new(google, Arc::clone(&drive)));

    let questions: Arc<dyn QuestionSource> = Arc::new(SheetQuestions::new(
        Arc::clone(&sheets),
        &config.google.questions_spreadsheet,
    ));
    let catalog = QuestionCatalog::load(questions.as_ref())
        .await
        .context("cannot start without the question catalog")?;
    eprintln!("   Questions: {}", catalog.len());

    let roster = Arc::new(SheetRoster::new(
        Arc::clone(&sheets),
        &config.google.users_spreadsheet,
    ));
    let sink = Arc::new(SheetAnswerSink::new(
        Arc::clone(&sheets),
        &config.google.answers_spreadsheet,
        &config.google.answers_worksheet,
    ));
    let persistence = PersistenceAdapter::new(
        sink,
        drive,
        config.engine.io_timeout,
        config.engine.utc_offset,
    );

    // ── Telegram ─────────────────────────────────────────────────────────
    let telegram = TelegramChannel::new(config.telegram.bot_token.clone());
    telegram
        .health_check()
        .await
        .context("Telegram bot token rejected")?;
    let channel: Arc<dyn Channel> = Arc::new(telegram);

    // ── Engine, scheduler, dispatcher ────────────────────────────────────
    let engine = Arc::new(
        ReviewEngine::new(
            AuthorizationGate::new(roster),
            catalog,
            persistence,
            Arc::clone(&channel),
            config.engine.clone(),
        )
        .with_state_store(Arc::clone(&state))
        .with_catalog_source(questions),
    );

    let scheduler = Arc::new(
        ReviewScheduler::new(&config.scheduler, engine.clone())?.with_state_store(state),
    );
    let _ticker = spawn_scheduler_ticker(scheduler, config.scheduler.tick_interval);
    let _heartbeat = spawn_heartbeat(config.heartbeat_interval);

    let dispatcher = Dispatcher::new(engine, config.engine.max_concurrent_events);
    let events = channel.start().await?;
    eprintln!("   Listening for Telegram updates. Ctrl-C to stop.\n");

    tokio::select! {
        _ = dispatcher.run(events) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
        }
    }

    dispatcher.shutdown().await;
    channel.shutdown().await?;
    Ok(())
}

/// stderr logging, plus a daily-rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "revision-bot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

fn spawn_heartbeat(interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tracing::debug!("Bot running, waiting for Telegram updates");
        }
    })
}
