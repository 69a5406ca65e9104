//! Response collaborator: reply text for a transcribed request

mod context;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{ApiKeys, LlmConfig};
use crate::{Error, Result};

pub use context::{ConversationContext, Exchange};

/// Produces the reply to one transcribed request
#[async_trait]
pub trait Responder: Send + Sync {
    /// Reply to `text`, given the recent exchanges (oldest first)
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails or returns no reply
    async fn respond(&self, text: &str, history: &[Exchange]) -> Result<String>;
}

/// OpenAI-compatible chat completions responder
pub struct ChatResponder {
    client: Client,
    api_key: Option<String>,
    config: LlmConfig,
}

impl ChatResponder {
    /// Create a responder; servers without authentication need no key
    #[must_use]
    pub fn new(config: LlmConfig, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.filter(|k| !k.is_empty()),
            config,
        }
    }

    #[must_use]
    pub fn from_config(config: &LlmConfig, keys: &ApiKeys) -> Self {
        Self::new(config.clone(), keys.openai.clone())
    }

    fn messages<'a>(&'a self, text: &'a str, history: &'a [Exchange]) -> Vec<Message<'a>> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        messages.push(Message {
            role: "system",
            content: &self.config.system_prompt,
        });
        for exchange in history {
            messages.push(Message {
                role: "user",
                content: &exchange.user,
            });
            messages.push(Message {
                role: "assistant",
                content: &exchange.assistant,
            });
        }
        messages.push(Message {
            role: "user",
            content: text,
        });
        messages
    }
}

#[async_trait]
impl Responder for ChatResponder {
    async fn respond(&self, text: &str, history: &[Exchange]) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: self.messages(text, history),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        tracing::debug!(model = %self.config.model, history = history.len(), "requesting reply");
        let response = builder
            .send()
            .await
            .map_err(|e| Error::Responder(format!("chat request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Responder(format!("chat API error {status}: {body}")));
        }

        let result: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Responder(format!("failed to parse chat response: {e}")))?;

        let reply = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        tracing::info!(reply = %reply, "reply ready");
        Ok(reply)
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}
