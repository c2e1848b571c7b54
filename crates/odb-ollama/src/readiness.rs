//! Liveness probe and detached bootstrap for `ollama serve`.

use std::{process::Stdio, time::Duration};

use odb_core::model::{
    client::{CliInvocation, OllamaPromptAdapter},
    types::Readiness,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    process::Command,
};

const PROBE_PATH: &str = "/api/version";
const PROBE_MAX_BYTES: usize = 4096;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One `GET /api/version` over a raw loopback socket. Never errors; anything other than a
/// response mentioning "version" within `timeout` counts as down.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, probe_once(host, port)).await {
        Ok(Ok(up)) => up,
        Ok(Err(e)) => {
            tracing::debug!(host, port, error = %e, "readiness probe failed");
            false
        }
        Err(_) => false,
    }
}

async fn probe_once(host: &str, port: u16) -> std::io::Result<bool> {
    let mut stream = TcpStream::connect((host, port)).await?;
    let req = format!("GET {PROBE_PATH} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await?;

    let mut buf = Vec::with_capacity(PROBE_MAX_BYTES);
    let mut chunk = [0u8; 1024];
    while buf.len() < PROBE_MAX_BYTES {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if contains_marker(&buf) {
            return Ok(true);
        }
    }
    Ok(contains_marker(&buf))
}

fn contains_marker(buf: &[u8]) -> bool {
    String::from_utf8_lossy(buf)
        .to_lowercase()
        .contains("version")
}

/// Probe; if down, start `ollama serve` in its own process group and poll once a second
/// until it answers or `budget` runs out. Failure is reported, not raised.
pub async fn ensure_ready(adapter: &OllamaPromptAdapter, budget: Duration) -> Readiness {
    let cfg = &adapter.cfg;
    if probe(&cfg.host, cfg.port, cfg.probe_timeout).await {
        return Readiness::AlreadyRunning;
    }

    tracing::info!("🚀 starting ollama serve…");
    if let Err(e) = spawn_detached(&adapter.build_serve_invocation()) {
        // Keep polling: another supervisor may still bring the service up.
        tracing::warn!(error = %e, "failed to start ollama serve");
    }

    let rounds = budget.as_secs().max(1);
    for i in 1..=rounds {
        tokio::time::sleep(POLL_INTERVAL).await;
        if probe(&cfg.host, cfg.port, cfg.probe_timeout).await {
            return Readiness::Started { after_secs: i };
        }
    }
    Readiness::Unresponsive
}

/// Fire-and-forget spawn. The child gets a fresh process group so a ctrl-c aimed at us does
/// not reach it, and null stdio so it never blocks on our pipes.
fn spawn_detached(inv: &CliInvocation) -> std::io::Result<()> {
    let mut cmd = Command::new(&inv.program);
    cmd.args(&inv.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for (k, v) in &inv.env {
        cmd.env(k, v);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn()?;
    tracing::info!(pid = child.id(), "ollama serve spawned");
    // Dropping the handle leaves the process running; tokio reaps it if it ever exits.
    drop(child);
    Ok(())
}
