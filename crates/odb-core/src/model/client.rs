use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;

use super::types::*;

/// A concrete CLI invocation (used by the `ollama` runner).
#[derive(Clone, Debug)]
pub struct CliInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Prompt adapter for the Ollama CLI.
///
/// The prompt never goes on the command line; it is written to the child's stdin so long
/// page dumps do not hit argv limits and do not show up in `ps`.
#[derive(Clone, Debug)]
pub struct OllamaPromptAdapter {
    pub cfg: OllamaCliConfig,
}

impl OllamaPromptAdapter {
    /// `ollama run <model>`
    pub fn build_run_invocation(&self) -> CliInvocation {
        CliInvocation {
            program: self.cfg.ollama_path.clone(),
            args: vec!["run".to_string(), self.cfg.model.clone()],
            env: Vec::new(),
        }
    }

    /// `ollama serve`
    pub fn build_serve_invocation(&self) -> CliInvocation {
        CliInvocation {
            program: self.cfg.ollama_path.clone(),
            args: vec!["serve".to_string()],
            env: vec![(
                "OLLAMA_HOST".to_string(),
                format!("{}:{}", self.cfg.host, self.cfg.port),
            )],
        }
    }
}

/// Inference gateway used by the dispatcher.
///
/// `invoke` never fails: missing executable, crashes and timeouts come back as user-facing
/// text, and the caller delivers that text the same way as a real answer.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Probe the backing service and try to bring it up if it is down.
    async fn ensure_ready(&self, timeout: Duration) -> Readiness;

    async fn invoke(&self, req: InferenceRequest) -> String;
}

/// Bounded URL-to-text fetcher.
///
/// Like `InferenceClient::invoke`, failures degrade to an explanatory string that is still
/// usable as prompt material.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> String;
}
