use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use autopoliza_core::config::{LlmConfig, LlmProvider};

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

const ANTHROPIC_VERSION: &str = "2023-06-01";

fn default_base_url(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "https://api.openai.com/v1",
        LlmProvider::Anthropic => "https://api.anthropic.com/v1",
        LlmProvider::Ollama | LlmProvider::Disabled => "http://localhost:11434",
    }
}

/// Single-prompt completions against OpenAI, Anthropic or Ollama.
pub struct HttpLlmClient {
    client: Client,
    provider: LlmProvider,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl HttpLlmClient {
    /// `None` when the provider is disabled.
    pub fn from_config(config: &LlmConfig) -> Result<Option<Self>> {
        if config.provider == LlmProvider::Disabled {
            return Ok(None);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build llm http client")?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(config.provider).to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Some(Self {
            client,
            provider: config.provider,
            base_url,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        }))
    }

    fn endpoint(&self) -> String {
        match self.provider {
            LlmProvider::OpenAi => format!("{}/chat/completions", self.base_url),
            LlmProvider::Anthropic => format!("{}/messages", self.base_url),
            LlmProvider::Ollama | LlmProvider::Disabled => format!("{}/api/generate", self.base_url),
        }
    }

    fn body(&self, prompt: &str) -> Value {
        match self.provider {
            LlmProvider::OpenAi => json!({
                "model": self.model,
                "temperature": 0,
                "messages": [{ "role": "user", "content": prompt }],
            }),
            LlmProvider::Anthropic => json!({
                "model": self.model,
                "max_tokens": 512,
                "messages": [{ "role": "user", "content": prompt }],
            }),
            LlmProvider::Ollama | LlmProvider::Disabled => json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
            }),
        }
    }
}

/// Completion text from a provider response body.
fn completion_text(provider: LlmProvider, body: &Value) -> Option<String> {
    let text = match provider {
        LlmProvider::OpenAi => body.pointer("/choices/0/message/content"),
        LlmProvider::Anthropic => body.pointer("/content/0/text"),
        LlmProvider::Ollama | LlmProvider::Disabled => body.get("response"),
    };
    text.and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut request = self.client.post(self.endpoint()).json(&self.body(prompt));
        if let Some(api_key) = &self.api_key {
            request = match self.provider {
                LlmProvider::Anthropic => request
                    .header("x-api-key", api_key.expose_secret())
                    .header("anthropic-version", ANTHROPIC_VERSION),
                _ => request.bearer_auth(api_key.expose_secret()),
            };
        }

        let response = request.send().await.context("llm request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("llm provider returned {status}");
        }
        let body: Value = response.json().await.context("llm response was not json")?;
        completion_text(self.provider, &body)
            .ok_or_else(|| anyhow!("llm response did not contain completion text"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use autopoliza_core::config::{AppConfig, LlmProvider};

    use super::{completion_text, HttpLlmClient};

    #[test]
    fn disabled_provider_builds_no_client() {
        let config = AppConfig::default();
        assert!(HttpLlmClient::from_config(&config.llm).expect("config").is_none());
    }

    #[test]
    fn ollama_client_targets_generate_endpoint() {
        let mut config = AppConfig::default().llm;
        config.provider = LlmProvider::Ollama;
        config.base_url = Some("http://127.0.0.1:11434/".to_string());

        let client = HttpLlmClient::from_config(&config).expect("config").expect("client");
        assert_eq!(client.endpoint(), "http://127.0.0.1:11434/api/generate");
        assert_eq!(client.body("hola")["stream"], json!(false));
    }

    #[test]
    fn completion_text_is_read_per_provider() {
        let openai = json!({ "choices": [{ "message": { "content": "{\"intent\":\"greeting\"}" } }] });
        let anthropic = json!({ "content": [{ "type": "text", "text": "ok" }] });
        let ollama = json!({ "response": "listo" });

        assert_eq!(
            completion_text(LlmProvider::OpenAi, &openai).as_deref(),
            Some("{\"intent\":\"greeting\"}")
        );
        assert_eq!(completion_text(LlmProvider::Anthropic, &anthropic).as_deref(), Some("ok"));
        assert_eq!(completion_text(LlmProvider::Ollama, &ollama).as_deref(), Some("listo"));
        assert!(completion_text(LlmProvider::OpenAi, &ollama).is_none());
    }
}
