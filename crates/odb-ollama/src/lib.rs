//! Ollama CLI adapter: admission-gated `ollama run <model>` with a hard timeout.
//!
//! One call at a time process-wide; callers queue FIFO on a single-permit semaphore.

pub mod readiness;

use std::{collections::VecDeque, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use odb_core::model::{
    client::{InferenceClient, OllamaPromptAdapter},
    types::{InferenceRequest, OllamaCliConfig, Readiness},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{Mutex, Semaphore},
};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;

const NOT_FOUND_MSG: &str = "❌ `ollama` was not found.";
const NO_OUTPUT: &str = "(no output)";

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[derive(Debug)]
pub struct OllamaGateway {
    adapter: OllamaPromptAdapter,
    gate: Semaphore,
}

impl OllamaGateway {
    pub fn new(cfg: OllamaCliConfig) -> Self {
        Self {
            adapter: OllamaPromptAdapter { cfg },
            gate: Semaphore::new(1),
        }
    }

    async fn run_once(&self, req: &InferenceRequest) -> String {
        let inv = self.adapter.build_run_invocation();

        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &inv.env {
            cmd.env(k, v);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(program = %inv.program.display(), "ollama executable not found");
                return NOT_FOUND_MSG.to_string();
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to spawn ollama");
                return format!("❌ Failed to start ollama: {e}");
            }
        };

        // Drain both pipes in the background so a chatty child never blocks on a full pipe.
        let mut stdout_task = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = out.read_to_end(&mut buf).await;
                buf
            })
        });
        let stderr_tail: Arc<Mutex<StderrTail>> = Arc::new(Mutex::new(StderrTail::default()));
        let mut stderr_task = child.stderr.take().map(|err| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(err).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tail.lock().await.push_line(line);
                }
            })
        });

        let mut stdin = child.stdin.take();
        let prompt = req.prompt.as_bytes();
        let work = async {
            if let Some(mut s) = stdin.take() {
                // A broken pipe means the child quit early; its exit status tells the story.
                if let Err(e) = s.write_all(prompt).await {
                    tracing::debug!(error = %e, "ollama stdin write failed");
                }
                drop(s);
            }
            let status = child.wait().await?;

            // Anything the child forked off may still hold the pipes open, so EOF on them is
            // part of the timed work too.
            let out = match stdout_task.as_mut() {
                Some(t) => t.await.unwrap_or_default(),
                None => Vec::new(),
            };
            if let Some(t) = stderr_task.as_mut() {
                let _ = t.await;
            }
            Ok::<_, std::io::Error>((status, out))
        };

        let finished = tokio::time::timeout(req.timeout, work).await;
        let (status, out) = match finished {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                abort_readers(&stdout_task, &stderr_task);
                let _ = kill_and_reap(&mut child).await;
                tracing::warn!(error = %e, "waiting for ollama failed");
                return format!("❌ Ollama error:\n```\n{e}\n```");
            }
            Err(_) => {
                abort_readers(&stdout_task, &stderr_task);
                if let Err(e) = kill_and_reap(&mut child).await {
                    tracing::error!(error = %e, "failed to kill timed out ollama process");
                }
                tracing::warn!(timeout = ?req.timeout, "ollama run timed out");
                return format!(
                    "⌛ Ollama run exceeded {} and timed out.",
                    human_duration(req.timeout)
                );
            }
        };

        let out = String::from_utf8_lossy(&out).trim().to_string();
        let err = stderr_tail.lock().await.snapshot().trim().to_string();

        if !status.success() {
            tracing::warn!(%status, "ollama exited with failure");
            let detail = if err.is_empty() { out } else { err };
            return format!("❌ Ollama error:\n```\n{detail}\n```");
        }

        if out.is_empty() {
            NO_OUTPUT.to_string()
        } else {
            out
        }
    }
}

#[async_trait]
impl InferenceClient for OllamaGateway {
    async fn ensure_ready(&self, timeout: Duration) -> Readiness {
        readiness::ensure_ready(&self.adapter, timeout).await
    }

    async fn invoke(&self, req: InferenceRequest) -> String {
        // The permit drops with this frame, so every return path below releases the slot.
        let _permit = match self.gate.acquire().await {
            Ok(p) => p,
            Err(_) => return "❌ Ollama gateway is shut down.".to_string(),
        };
        tracing::info!(
            model = %self.adapter.cfg.model,
            prompt_chars = req.prompt.chars().count(),
            "ollama run"
        );
        self.run_once(&req).await
    }
}

fn abort_readers(
    stdout: &Option<tokio::task::JoinHandle<Vec<u8>>>,
    stderr: &Option<tokio::task::JoinHandle<()>>,
) {
    if let Some(t) = stdout {
        t.abort();
    }
    if let Some(t) = stderr {
        t.abort();
    }
}

async fn kill_and_reap(child: &mut Child) -> std::io::Result<()> {
    // If it's already exited, `try_wait` reaps it.
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    match child.kill().await {
        Ok(()) => Ok(()),
        Err(e) => {
            // It may have exited between `try_wait` and `kill`.
            if child.try_wait()?.is_some() {
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}

fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        let mins = secs / 60;
        format!("{mins} minute{}", if mins == 1 { "" } else { "s" })
    } else if secs >= 1 {
        format!("{secs}s")
    } else {
        format!("{}ms", d.as_millis())
    }
}
