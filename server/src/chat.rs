//! Chat relay to an external completion service.
//!
//! A chat request is answered by sending a fixed three-part prompt to an
//! OpenAI-compatible `/v1/chat/completions` endpoint:
//!
//! 1. system instructions describing the assistant's job
//! 2. the user's message
//! 3. a system message carrying a JSON snapshot of the most recent events
//!
//! The first choice's text is returned. Failures are not retried and replies
//! are not streamed.
//!
//! # Example
//!
//! ```rust,ignore
//! use merathon_server::chat::{build_prompt, ChatClient};
//!
//! let client = ChatClient::new("https://api.openai.com", "sk-...")?;
//! let prompt = build_prompt("Which races are in Dhaka?", None, &events);
//! let reply = client.complete(&prompt).await?;
//! ```

use std::fmt;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::models::{Distance, Event};

/// Model used for every completion.
pub const CHAT_MODEL: &str = "gpt-4o-mini";

/// Sampling temperature for every completion.
pub const CHAT_TEMPERATURE: f64 = 0.7;

/// Number of recent events included as context.
pub const CONTEXT_EVENT_COUNT: u32 = 5;

/// Timeout for completion requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const SYSTEM_INSTRUCTIONS: &str = "You are the help desk of a marathon management site. \
Answer questions about upcoming marathons, registration windows and race details. \
Base event facts only on the event list you are given. If the list does not contain \
the answer, say so instead of guessing. Keep answers short and friendly.";

/// Errors from the completion service.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The service could not be reached.
    #[error("completion service unavailable: {0}")]
    Unavailable(String),

    /// The service answered with a non-success status.
    #[error("completion service returned {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The response body was not the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The response contained no reply text.
    #[error("completion service returned no reply")]
    EmptyReply,

    /// Client setup failed or no API key is configured.
    #[error("client configuration error: {0}")]
    Configuration(String),
}

/// Author of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Event fields shared with the completion service.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventSnapshot<'a> {
    title: &'a str,
    location: &'a str,
    distance: &'a Distance,
    marathon_start_date: &'a str,
    start_registration_date: &'a str,
    end_registration_date: &'a str,
    description: &'a str,
    registration_count: i64,
}

impl<'a> From<&'a Event> for EventSnapshot<'a> {
    fn from(event: &'a Event) -> Self {
        let details = &event.details;
        Self {
            title: &details.title,
            location: &details.location,
            distance: &details.distance,
            marathon_start_date: &details.marathon_start_date,
            start_registration_date: &details.start_registration_date,
            end_registration_date: &details.end_registration_date,
            description: &details.description,
            registration_count: details.registration_count,
        }
    }
}

/// Builds the three-part prompt for a user message.
pub fn build_prompt(message: &str, user_email: Option<&str>, events: &[Event]) -> Vec<ChatMessage> {
    let instructions = match user_email {
        Some(email) => format!("{SYSTEM_INSTRUCTIONS} The user is signed in as {email}."),
        None => SYSTEM_INSTRUCTIONS.to_string(),
    };

    let snapshot: Vec<EventSnapshot<'_>> = events.iter().map(EventSnapshot::from).collect();
    let snapshot = serde_json::to_string(&snapshot).unwrap_or_else(|_| "[]".to_string());

    vec![
        ChatMessage::system(instructions),
        ChatMessage::user(message),
        ChatMessage::system(format!("Current marathon events: {snapshot}")),
    ]
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'static str,
    temperature: f64,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for the completion service.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Clone)]
pub struct ChatClient {
    http_client: Client,
    base_url: String,
    api_key: String,
}

impl fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl ChatClient {
    /// Creates a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Configuration`] if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ChatError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChatError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url,
            api_key: api_key.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends the prompt and returns the first reply.
    ///
    /// # Errors
    ///
    /// - [`ChatError::Timeout`] - no answer within 30 seconds
    /// - [`ChatError::Unavailable`] - the service is unreachable
    /// - [`ChatError::Rejected`] - non-success status
    /// - [`ChatError::InvalidResponse`] - the body could not be parsed
    /// - [`ChatError::EmptyReply`] - no choice carried any text
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ChatError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        debug!(url = %url, messages = messages.len(), model = CHAT_MODEL, "Requesting completion");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&CompletionRequest {
                model: CHAT_MODEL,
                temperature: CHAT_TEMPERATURE,
                messages,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChatError::Timeout(REQUEST_TIMEOUT)
                } else if e.is_connect() {
                    ChatError::Unavailable(format!("connection failed: {e}"))
                } else {
                    ChatError::Unavailable(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Completion service rejected request");
            return Err(ChatError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let completion: CompletionResponse = response.json().await.map_err(|e| {
            ChatError::InvalidResponse(format!("failed to parse completion response: {e}"))
        })?;

        let reply = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(ChatError::EmptyReply)?;

        debug!(reply_len = reply.len(), "Completion received");

        Ok(reply)
    }
}
