//! # Generative service
//!
//! [`GenerativeService`] is the seam to a hosted chat model. The fallback stage
//! and the paraphrase stage both call it, with different templates.
//! [`OpenAiGenerator`] talks to any OpenAI-compatible endpoint through
//! `async-openai` (OpenAI, Groq, a local llama.cpp server).
//!
//! [`accept_completion`] decides whether a raw response counts as an answer.

use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use tracing::debug;

use crate::config::ResolverConfig;
use crate::error::GenerativeServiceError;

#[async_trait]
pub trait GenerativeService: Send + Sync {
    /// One completion. Implementations must give up after `timeout_ms`.
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        temperature: f32,
        timeout_ms: u64,
    ) -> Result<String, GenerativeServiceError>;
}

/// Creates a new OpenAI API client from configuration.
fn create_client(config: &ResolverConfig) -> Client<OpenAIConfig> {
    let openai_config = OpenAIConfig::new()
        .with_api_key(config.api_key.clone())
        .with_api_base(config.api_base.clone());
    debug!("Client created for {}", config.api_base);
    Client::with_config(openai_config)
}

/// Chat-completion client for an OpenAI-compatible API.
pub struct OpenAiGenerator {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            client: create_client(config),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl GenerativeService for OpenAiGenerator {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        temperature: f32,
        timeout_ms: u64,
    ) -> Result<String, GenerativeServiceError> {
        let messages = vec![
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                content: ChatCompletionRequestSystemMessageContent::Text(
                    system_prompt.to_string(),
                ),
                name: None,
            }),
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(user_prompt.to_string()),
                name: None,
            }),
        ];

        #[allow(deprecated)]
        let request = CreateChatCompletionRequestArgs::default()
            .max_tokens(max_tokens)
            .temperature(temperature)
            .model(self.model.clone())
            .messages(messages)
            .build()
            .map_err(|e| GenerativeServiceError::Transport(e.to_string()))?;

        debug!(model = %self.model, max_tokens, timeout_ms, "sending completion request");

        let response = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.client.chat().create(request),
        )
        .await
        .map_err(|_| GenerativeServiceError::Timeout { timeout_ms })?
        .map_err(|e| GenerativeServiceError::Transport(e.to_string()))?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(GenerativeServiceError::Empty)
    }
}

/// Validate a raw completion.
///
/// Leading whitespace and quote marks are ignored. A response that starts with
/// an abstention marker (case-insensitive) is [`GenerativeServiceError::Abstained`];
/// one of `min_chars` characters or fewer is [`GenerativeServiceError::TooShort`].
pub fn accept_completion(
    raw: &str,
    abstention_markers: &[String],
    min_chars: usize,
) -> Result<String, GenerativeServiceError> {
    let answer = raw.trim();
    if answer.is_empty() {
        return Err(GenerativeServiceError::Empty);
    }

    let head = answer
        .trim_start_matches(['"', '\'', '«', '“'])
        .trim_start()
        .to_lowercase();
    if abstention_markers
        .iter()
        .any(|marker| head.starts_with(&marker.trim().to_lowercase()))
    {
        return Err(GenerativeServiceError::Abstained);
    }

    let len = answer.chars().count();
    if len <= min_chars {
        return Err(GenerativeServiceError::TooShort {
            len,
            min: min_chars,
        });
    }

    Ok(answer.to_string())
}
