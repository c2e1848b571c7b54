mod stdio;

use std::sync::Arc;

use anyhow::Context;
use odb_core::{
    config::Config,
    dispatcher::{Dispatcher, Outcome},
    messaging::{
        port::ChatPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    utils::AuditLogger,
};
use odb_fetch::{FetchLimits, UrlFetcher};
use odb_ollama::OllamaGateway;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::stdio::{parse_inbound, Inbound, StdioChatPort};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    odb_core::logging::init("odb")?;

    let cfg = Arc::new(Config::load().context("failed to load configuration")?);
    tracing::info!(
        model = %cfg.ollama.model,
        ollama = %cfg.ollama.ollama_path.display(),
        posts_per_window = cfg.posts_per_window,
        window_secs = cfg.window.as_secs(),
        "odb starting"
    );

    let gateway = Arc::new(OllamaGateway::new(cfg.ollama.clone()));
    let fetcher = Arc::new(UrlFetcher::new(FetchLimits {
        max_chars: cfg.fetch_max_chars,
        max_bytes: cfg.fetch_max_bytes,
        max_redirects: cfg.fetch_max_redirects,
        timeout: cfg.fetch_timeout,
    })?);

    let transport = Arc::new(StdioChatPort::new(
        tokio::io::stdout(),
        &cfg.stdio_destinations,
    ));
    // Replies and moderation notices come in bursts; space them out.
    let port: Arc<dyn ChatPort> = Arc::new(ThrottledMessenger::new(
        transport.clone(),
        ThrottleConfig::default(),
    ));

    let dispatcher = Arc::new(
        Dispatcher::new(cfg.clone(), port, gateway, fetcher).with_audit(AuditLogger::new(
            cfg.audit_log_path.clone(),
            cfg.audit_log_json,
        )),
    );

    dispatcher.startup(&transport.groups()).await;

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();

    tracker.spawn(sweep_loop(
        dispatcher.clone(),
        cfg.sweep_interval,
        shutdown.clone(),
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
          _ = tokio::signal::ctrl_c() => {
            tracing::info!("ctrl-c received, shutting down");
            break;
          }
          line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(l)) => l,
            Ok(None) => {
                tracing::info!("stdin closed, shutting down");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_inbound(&line) {
            Ok(Inbound::Message(msg)) => {
                transport.observe(&msg);
                let dispatcher = dispatcher.clone();
                tracker.spawn(async move {
                    let id = msg.message_id.0;
                    match dispatcher.handle(msg).await {
                        Outcome::RateLimited { report, .. } => {
                            tracing::debug!(message_id = id, ?report, "event rate limited")
                        }
                        other => tracing::debug!(message_id = id, ?other, "event handled"),
                    }
                });
            }
            Ok(Inbound::GroupJoin { group }) => {
                let dispatcher = dispatcher.clone();
                tracker.spawn(async move { dispatcher.on_group_join(&group).await });
            }
            Err(e) => tracing::warn!(error = %e, "ignoring malformed inbound line"),
        }
    }

    // Stop the sweeper; inflight events run to completion.
    shutdown.cancel();
    tracker.close();
    tracker.wait().await;
    tracing::info!("odb stopped");
    Ok(())
}

async fn sweep_loop(
    dispatcher: Arc<Dispatcher>,
    every: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(every);
    // The first tick fires immediately; nothing to sweep yet.
    tick.tick().await;
    loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = tick.tick() => {
            let stats = dispatcher.sweep(std::time::Instant::now());
            tracing::debug!(
                windows_removed = stats.windows_removed,
                violations_removed = stats.violations_removed,
                windows_tracked = stats.windows_tracked,
                violations_tracked = stats.violations_tracked,
                "swept dormant moderation state"
            );
          }
        }
    }
}
