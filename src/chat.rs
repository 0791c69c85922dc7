//! Chat-completion backends used for grounded answer generation.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::Settings,
    error::{Error, Result},
    openai::ApiClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A model that answers a list of messages with one reply.
pub trait ChatModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// Single blocking call; no retries and no streaming.
    fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// An OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug)]
pub struct OpenAiChat {
    client: ApiClient,
    model: String,
}

impl OpenAiChat {
    pub fn new(client: ApiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Chat client for the configured model. A missing key is `Error::Config`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let model = settings.chat_model.trim();
        if model.is_empty() {
            return Err(Error::Config("no chat model configured".to_string()));
        }
        Ok(Self::new(ApiClient::from_settings(settings)?, model))
    }
}

impl ChatModel for OpenAiChat {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        debug!(model = %self.model, messages = messages.len(), "requesting completion");
        let response: CompletionResponse = self.client.post_json(
            "chat/completions",
            &CompletionRequest {
                model: &self.model,
                messages,
            },
            Error::Chat,
        )?;
        first_content(response)
    }
}

fn first_content(response: CompletionResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| Error::Chat("response contained no message content".into()))
}
