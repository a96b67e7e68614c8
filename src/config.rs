//! Process-wide configuration.
//!
//! Seeded from environment variables at startup (`LLM_PROVIDER`, `LLM_MODEL`,
//! `LLM_TEMPERATURE`, `AGENT_RECURSION_LIMIT`, `TOOL_TIMEOUT_SECONDS`) and
//! mutable afterward only through [`ConfigHandle::try_update`], which the
//! WebSocket bridge's `start_system` handler uses to apply an `llm_config`
//! override before the supervisor starts. Unlike [`CloudLLMConfig`] in the
//! upstream crate (a plain struct users construct by hand), this config is
//! shared process state guarded by a lock, because it is read by
//! [`crate::model::make_model`] at call time rather than once at startup.
//!
//! [`CloudLLMConfig`]: https://docs.rs/cloudllm (unrelated prior art; not a dependency of this crate)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// LLM provider selection. Mirrors the provider dispatch in [`crate::clients`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Claude,
    Gemini,
    Grok,
}

impl Provider {
    fn from_env_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "claude" | "anthropic" => Provider::Claude,
            "gemini" | "google" => Provider::Gemini,
            "grok" | "xai" => Provider::Grok,
            _ => Provider::OpenAi,
        }
    }
}

/// A point-in-time copy of [`Config`] read by `makeModel` at invocation time.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    pub provider: Provider,
    pub model: String,
    pub temperature: f32,
    pub agent_recursion_limit: usize,
    pub tool_timeout_seconds: u64,
}

impl Config {
    /// Build the initial config from environment variables, falling back to
    /// the defaults named in the component design.
    pub fn from_env() -> Self {
        let provider = std::env::var("LLM_PROVIDER")
            .map(|s| Provider::from_env_str(&s))
            .unwrap_or(Provider::OpenAi);
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4.1-mini".to_string());
        let temperature = std::env::var("LLM_TEMPERATURE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.2);
        let agent_recursion_limit = std::env::var("AGENT_RECURSION_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(500);
        let tool_timeout_seconds = std::env::var("TOOL_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);
        Config {
            provider,
            model,
            temperature,
            agent_recursion_limit,
            tool_timeout_seconds,
        }
    }
}

/// Incoming override payload, shaped like `start_system.data.config.llm_config`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlmConfigOverride {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

/// Shared handle to the process-wide config.
///
/// `running` gates [`try_update`](ConfigHandle::try_update): per the design
/// notes, config updates are rejected while a supervisor run is in progress
/// so a run always sees a single consistent snapshot from `execute()` entry
/// onward.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Config>>,
    running: Arc<AtomicBool>,
}

impl ConfigHandle {
    pub fn new(initial: Config) -> Self {
        ConfigHandle {
            inner: Arc::new(RwLock::new(initial)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Read the current config. Used by `make_model` at call time so that
    /// overrides applied before the call are observed.
    pub async fn snapshot(&self) -> Config {
        self.inner.read().await.clone()
    }

    /// Mark that a supervisor run has started; subsequent `try_update` calls
    /// are rejected until [`mark_stopped`](Self::mark_stopped) is called.
    pub fn mark_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Apply an `llm_config` override. Returns `false` (no-op) if a run is
    /// currently in progress.
    pub async fn try_update(&self, update: LlmConfigOverride) -> bool {
        if self.is_running() {
            return false;
        }
        let mut guard = self.inner.write().await;
        if let Some(p) = update.provider {
            guard.provider = Provider::from_env_str(&p);
        }
        if let Some(m) = update.model {
            guard.model = m;
        }
        if let Some(t) = update.temperature {
            guard.temperature = t;
        }
        true
    }
}
