//! Completion providers: the "brain" the loop asks for its next decision.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info};

const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
const OLLAMA_DEFAULT_MODEL: &str = "mistral:7b-instruct";
const QWEN_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_TIMEOUT: Duration = Duration::from_secs(60);
const CHAT_TIMEOUT: Duration = Duration::from_secs(30);
const TEMPERATURE: f64 = 0.1;

/// Turns a prompt into free text.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short label for logs, e.g. `ollama/mistral:7b-instruct`.
    fn describe(&self) -> String;

    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Provider selection as delivered by the backend or local configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfig {
    pub ai_provider: String,
    #[serde(default)]
    pub ollama_model: Option<String>,
    #[serde(default)]
    pub ollama_url: Option<String>,
    #[serde(default, alias = "qwenApiKey")]
    pub api_key: Option<String>,
    #[serde(default, alias = "qwenModelName")]
    pub model_name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Builds a provider from an `AiConfig`. A seam so tests can hand out scripted brains.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, config: &AiConfig) -> Result<Arc<dyn CompletionProvider>>;
}

/// Builds the real HTTP-backed providers.
pub struct HttpProviderFactory;

impl ProviderFactory for HttpProviderFactory {
    fn build(&self, config: &AiConfig) -> Result<Arc<dyn CompletionProvider>> {
        build_provider(config)
    }
}

pub fn build_provider(config: &AiConfig) -> Result<Arc<dyn CompletionProvider>> {
    let provider: Arc<dyn CompletionProvider> = match config.ai_provider.trim() {
        "ollama" => Arc::new(OllamaProvider::new(
            config.ollama_url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL),
            config
                .ollama_model
                .as_deref()
                .unwrap_or(OLLAMA_DEFAULT_MODEL),
        )?),
        kind @ ("qwen" | "openai") => {
            let model = config
                .model_name
                .as_deref()
                .filter(|m| !m.is_empty())
                .ok_or_else(|| anyhow!("AI provider \"{kind}\" configured without a model name"))?;
            let api_key = config
                .api_key
                .as_deref()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| anyhow!("AI provider \"{kind}\" configured without an API key"))?;
            let default_base = if kind == "qwen" {
                QWEN_BASE_URL
            } else {
                OPENAI_BASE_URL
            };
            Arc::new(ChatCompletionsProvider::new(
                config.base_url.as_deref().unwrap_or(default_base),
                api_key,
                model,
            )?)
        }
        "" => bail!("AI configuration has no provider"),
        other => bail!("invalid AI provider \"{other}\" (use ollama, qwen or openai)"),
    };
    info!(provider = %provider.describe(), "completion provider ready");
    Ok(provider)
}

/// Ollama-style `POST /api/generate`.
pub struct OllamaProvider {
    client: Client,
    endpoint: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f64,
    top_p: f64,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaProvider {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(OLLAMA_TIMEOUT)
            .build()
            .context("build ollama http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl CompletionProvider for OllamaProvider {
    fn describe(&self) -> String {
        format!("ollama/{}", self.model)
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: TEMPERATURE,
                top_p: 0.9,
            },
        };
        let res = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("ollama request failed")?
            .error_for_status()
            .context("ollama non-2xx response")?
            .json::<GenerateResponse>()
            .await
            .context("ollama response decode failed")?;
        debug!(chars = res.response.len(), "ollama replied");
        Ok(res.response)
    }
}

/// OpenAI-compatible `POST /chat/completions` (OpenAI, Qwen compatible mode).
pub struct ChatCompletionsProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl ChatCompletionsProvider {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(CHAT_TIMEOUT)
            .build()
            .context("build chat completions http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl CompletionProvider for ChatCompletionsProvider {
    fn describe(&self) -> String {
        format!("chat/{}", self.model)
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": TEMPERATURE,
            }))
            .send()
            .await
            .context("chat completions request failed")?;

        let status = response.status();
        let json_resp: serde_json::Value = response
            .json()
            .await
            .context("chat completions response decode failed")?;

        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            error!(%status, err_msg, "completion API error");
            bail!("completion API error ({status}): {err_msg}");
        }

        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("no content in completion response: {json_resp}"))?;
        debug!(chars = content.len(), "chat completion replied");
        Ok(content.to_string())
    }
}
