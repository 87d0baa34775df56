use crate::config::LlmConfig;
use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// The utterance generator oracle. `Template` is the no-backend variant: it
/// always reports failure so the pipeline falls through to its template
/// table.
pub enum ChatGenerator {
    Ollama(OllamaChat),
    OpenAi(OpenAiChat),
    Template,
}

impl ChatGenerator {
    pub fn from_config(llm: &LlmConfig) -> Self {
        if !llm.enabled {
            return ChatGenerator::Template;
        }
        match llm.backend.as_str() {
            "ollama" => ChatGenerator::Ollama(OllamaChat::new(llm)),
            "openai" => ChatGenerator::OpenAi(OpenAiChat::new(llm)),
            _ => ChatGenerator::Template,
        }
    }

    pub async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        match self {
            ChatGenerator::Ollama(client) => client.chat(messages).await,
            ChatGenerator::OpenAi(client) => client.chat(messages).await,
            ChatGenerator::Template => anyhow::bail!("no generator backend configured"),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            ChatGenerator::Ollama(_) => "ollama",
            ChatGenerator::OpenAi(_) => "openai",
            ChatGenerator::Template => "template",
        }
    }
}

pub struct OllamaChat {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OllamaChat {
    fn new(llm: &LlmConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_millis(llm.timeout_ms))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: llm.url.trim_end_matches('/').to_string(),
            api_key: llm.api_key.clone(),
            model: llm.model.clone(),
        }
    }

    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let req = OllamaRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            stream: false,
        };
        let mut rb = self.http.post(url).json(&req);
        if let Some(key) = &self.api_key {
            rb = rb.header("Authorization", format!("Bearer {}", key));
        }
        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("ollama error ({}): {}", status, text);
        }
        let payload: OllamaResponse = resp.json().await?;
        Ok(payload.message.content)
    }
}

#[derive(Debug, Clone, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct OllamaResponse {
    message: ChatMessage,
}

pub struct OpenAiChat {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiChat {
    fn new(llm: &LlmConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_millis(llm.timeout_ms))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: llm.url.trim_end_matches('/').to_string(),
            api_key: llm.api_key.clone(),
            model: llm.model.clone(),
        }
    }

    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let req = OaiRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            stream: false,
        };
        let mut rb = self.http.post(url).json(&req);
        if let Some(key) = &self.api_key {
            rb = rb.header("Authorization", format!("Bearer {}", key));
        }
        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("openai error ({}): {}", status, text);
        }
        let payload: OaiResponse = resp.json().await?;
        Ok(payload
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Serialize)]
struct OaiRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct OaiResponse {
    choices: Vec<OaiChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct OaiChoice {
    message: ChatMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_llm_resolves_to_template_backend() {
        let llm = LlmConfig {
            enabled: false,
            backend: "ollama".to_string(),
            ..LlmConfig::default()
        };
        assert_eq!(ChatGenerator::from_config(&llm).backend_name(), "template");
    }

    #[test]
    fn backend_string_selects_client() {
        let llm = LlmConfig {
            enabled: true,
            backend: "openai".to_string(),
            ..LlmConfig::default()
        };
        assert_eq!(ChatGenerator::from_config(&llm).backend_name(), "openai");
        let llm = LlmConfig {
            enabled: true,
            backend: "unknown".to_string(),
            ..LlmConfig::default()
        };
        assert_eq!(ChatGenerator::from_config(&llm).backend_name(), "template");
    }

    #[tokio::test]
    async fn template_backend_reports_failure_for_fallback() {
        let generator = ChatGenerator::Template;
        assert!(generator.generate(&[ChatMessage::user("hi")]).await.is_err());
    }
}
