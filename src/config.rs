//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};

use crate::actions::Pacing;
use crate::agent::LoopSettings;
use crate::brain::AiConfig;
use crate::supervisor::SupervisorConfig;

/// How browser sessions are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BrowserMode {
    /// Start and stop profiles through the AdsPower local API.
    Adspower,
    /// Attach to a Chrome already listening on a debug port.
    Attach,
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "agent",
    version,
    about = "Autonomous group-engagement browser agent"
)]
pub struct AgentConfig {
    /// Base URL of the task backend.
    #[arg(long, env = "AGENT_API_URL", default_value = "http://localhost:3333")]
    pub api_url: String,

    /// Bearer token for the task backend.
    #[arg(long, env = "AGENT_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    #[arg(long, env = "AGENT_BROWSER", value_enum, default_value_t = BrowserMode::Adspower)]
    pub browser: BrowserMode,

    #[arg(long, env = "ADSPOWER_URL", default_value = "http://localhost:50325")]
    pub adspower_url: String,

    #[arg(long, env = "CHROME_DEBUG_URL", default_value = "http://127.0.0.1:9222")]
    pub chrome_debug_url: String,

    /// Use this provider instead of fetching the AI configuration from the backend.
    #[arg(long, env = "AI_PROVIDER")]
    pub ai_provider: Option<String>,

    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
    pub ollama_url: String,

    #[arg(long, env = "OLLAMA_MODEL", default_value = "mistral:7b-instruct")]
    pub ollama_model: String,

    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    #[arg(long, env = "LLM_MODEL")]
    pub llm_model: Option<String>,

    #[arg(long, env = "LLM_BASE_URL")]
    pub llm_base_url: Option<String>,

    #[arg(long, env = "AGENT_MAX_STEPS", default_value_t = 15)]
    pub max_steps: usize,

    #[arg(long, env = "AGENT_HISTORY_LIMIT", default_value_t = 10)]
    pub history_limit: usize,

    #[arg(long, env = "AGENT_SCRAPE_COUNT", default_value_t = 5)]
    pub scrape_count: u64,

    #[arg(long, env = "AGENT_POLL_SECS", default_value_t = 10)]
    pub poll_secs: u64,

    #[arg(long, env = "AGENT_BACKOFF_SECS", default_value_t = 60)]
    pub backoff_secs: u64,

    #[arg(long, env = "AGENT_PACING_MIN_MS", default_value_t = 1000)]
    pub pacing_min_ms: u64,

    #[arg(long, env = "AGENT_PACING_MAX_MS", default_value_t = 3000)]
    pub pacing_max_ms: u64,

    /// Where failure screenshots and markup are kept.
    #[arg(long, env = "AGENT_ARTIFACTS_DIR")]
    pub artifacts_dir: Option<PathBuf>,

    /// Serve the live monitor on this address.
    #[arg(long, env = "AGENT_MONITOR_ADDR")]
    pub monitor_addr: Option<SocketAddr>,

    /// Run the task in this JSON file instead of polling the backend.
    #[arg(long)]
    pub task_file: Option<PathBuf>,

    /// Stop after the first task.
    #[arg(long)]
    pub once: bool,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            bail!("max steps must be at least 1");
        }
        if self.history_limit == 0 {
            bail!("history limit must be at least 1");
        }
        if self.scrape_count == 0 {
            bail!("scrape count must be at least 1");
        }
        if self.pacing_min_ms > self.pacing_max_ms {
            bail!(
                "pacing min ({} ms) exceeds pacing max ({} ms)",
                self.pacing_min_ms,
                self.pacing_max_ms
            );
        }
        Ok(())
    }

    /// AI configuration from flags/env, when a provider is named locally.
    pub fn local_ai_config(&self) -> Option<AiConfig> {
        let provider = self.ai_provider.as_deref()?.trim();
        if provider.is_empty() {
            return None;
        }
        Some(AiConfig {
            ai_provider: provider.to_string(),
            ollama_model: Some(self.ollama_model.clone()),
            ollama_url: Some(self.ollama_url.clone()),
            api_key: self.llm_api_key.clone(),
            model_name: self.llm_model.clone(),
            base_url: self.llm_base_url.clone(),
        })
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            max_steps: self.max_steps,
            history_limit: self.history_limit,
            scrape_count: self.scrape_count,
        }
    }

    pub fn pacing(&self) -> Pacing {
        Pacing::new(
            Duration::from_millis(self.pacing_min_ms),
            Duration::from_millis(self.pacing_max_ms),
        )
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_secs(self.poll_secs),
            backoff: Duration::from_secs(self.backoff_secs),
            once: self.once,
        }
    }

    /// Configured artifacts directory, else `<local data dir>/group-agent/failures`.
    pub fn artifacts_dir(&self) -> Option<PathBuf> {
        self.artifacts_dir.clone().or_else(|| {
            dirs::data_local_dir().map(|d| d.join("group-agent").join("failures"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> AgentConfig {
        let mut argv = vec!["agent"];
        argv.extend_from_slice(args);
        AgentConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = parse(&[
            "--api-url",
            "http://backend:9000",
            "--browser",
            "attach",
            "--max-steps",
            "3",
            "--once",
        ]);
        assert_eq!(cfg.api_url, "http://backend:9000");
        assert_eq!(cfg.browser, BrowserMode::Attach);
        assert_eq!(cfg.loop_settings().max_steps, 3);
        assert!(cfg.supervisor().once);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_inverted_pacing_and_zero_bounds() {
        let cfg = parse(&["--pacing-min-ms", "500", "--pacing-max-ms", "100"]);
        assert!(cfg.validate().is_err());
        let cfg = parse(&["--max-steps", "0"]);
        assert!(cfg.validate().is_err());
        let cfg = parse(&["--history-limit", "0"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn local_ai_config_only_when_provider_named() {
        let cfg = parse(&["--ai-provider", "qwen", "--llm-model", "qwen-plus"]);
        let ai = cfg.local_ai_config().unwrap();
        assert_eq!(ai.ai_provider, "qwen");
        assert_eq!(ai.model_name.as_deref(), Some("qwen-plus"));

        let cfg = parse(&["--ai-provider", "  "]);
        assert!(cfg.local_ai_config().is_none());
    }

    #[test]
    fn explicit_artifacts_dir_wins() {
        let cfg = parse(&["--artifacts-dir", "/tmp/failures"]);
        assert_eq!(cfg.artifacts_dir(), Some(PathBuf::from("/tmp/failures")));
    }
}
