use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use roomwatch_core::{Config, KnownStore};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod bot;
mod engine;

/// Batches that may wait for the bot before new ones are dropped.
const ALERT_QUEUE: usize = 8;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("roomwatchd starting");

    let config = Config::load().context("failed to load configuration")?;
    let store = KnownStore::load_or_empty(&config.store_path)
        .with_context(|| format!("failed to load {}", config.store_path.display()))?;

    if store.is_empty() {
        tracing::warn!(
            path = %config.store_path.display(),
            "no known faces loaded; every detected face will be reported as an intruder"
        );
    } else {
        tracing::info!(
            people = store.len(),
            encodings = store.encoding_count(),
            "known faces loaded"
        );
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_quit_listener(shutdown.clone());

    let (watch, bot) = match &config.telegram {
        Some(settings) => {
            let client =
                bot::TelegramClient::new(settings).context("failed to build telegram client")?;
            let (tx, rx) = mpsc::channel(ALERT_QUEUE);
            let sink = bot::AlertChannel::new(tx);
            let watch = engine::spawn_watch(&config, store, sink, shutdown.clone())?;
            (watch, Some(tokio::spawn(bot::run(client, rx))))
        }
        None => {
            tracing::warn!("telegram not configured; intruder alerts will only be logged");
            let watch = engine::spawn_watch(&config, store, bot::LogOnlySink, shutdown.clone())?;
            (watch, None)
        }
    };

    tracing::info!("roomwatchd ready; type q and Enter or press Ctrl-C to stop");

    let signal_flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
            signal_flag.store(true, Ordering::Relaxed);
        }
    });

    let summary = tokio::task::spawn_blocking(move || watch.join())
        .await?
        .map_err(|_| anyhow!("watch thread panicked"))?;

    // The processor (and with it the alert sender) is gone, so the bot drains and exits.
    if let Some(bot) = bot {
        bot.await?;
    }

    tracing::info!(
        frames = summary.frames,
        alerts = summary.alerts,
        reason = ?summary.reason,
        "roomwatchd stopped"
    );
    Ok(())
}

/// Set `shutdown` when a line reading `q` arrives on stdin.
fn spawn_quit_listener(shutdown: Arc<AtomicBool>) {
    let spawned = std::thread::Builder::new()
        .name("roomwatch-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().eq_ignore_ascii_case("q") {
                    tracing::info!("quit requested");
                    shutdown.store(true, Ordering::Relaxed);
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "stdin listener unavailable; use Ctrl-C to stop");
    }
}
