use std::{path::PathBuf, time::Duration};

/// Ollama CLI settings (one local model, one local service).
#[derive(Clone, Debug)]
pub struct OllamaCliConfig {
    pub ollama_path: PathBuf,
    pub model: String,
    /// Loopback host/port of `ollama serve` (readiness probe target).
    pub host: String,
    pub port: u16,
    /// Budget for a single readiness probe.
    pub probe_timeout: Duration,
}

/// Ephemeral request for a single gateway call.
#[derive(Clone, Debug)]
pub struct InferenceRequest {
    pub prompt: String,
    pub timeout: Duration,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            timeout,
        }
    }
}

/// Outcome of `ensure_ready`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// The service answered the first probe.
    AlreadyRunning,
    /// We started the service and it came up after this many poll rounds.
    Started { after_secs: u64 },
    /// Nothing answered within the budget (non-fatal).
    Unresponsive,
}
