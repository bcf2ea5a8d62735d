//! Anthropic Messages API agent
//!
//! Implements [`ConversationalAgent`] over `POST /v1/messages`, with SSE
//! streaming for `complete_streaming`.

use super::agent::{ChunkSink, ConversationalAgent};
use super::retry::{with_retry, RetryConfig};
use crate::config::AgentSettings;
use crate::session::{Message, Role};
use crate::{GtmError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct AnthropicAgent {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    retry: RetryConfig,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CreateMessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: Delta },
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

impl AnthropicAgent {
    pub fn new(api_key: impl Into<String>, settings: &AgentSettings) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: format!("{}/v1/messages", settings.base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: settings.model.clone(),
            max_tokens: settings.max_output_tokens,
            retry: settings.retry.clone(),
        })
    }

    /// Build from settings, reading the key from the configured environment variable
    pub fn from_settings(settings: &AgentSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env).map_err(|_| {
            GtmError::Config(format!(
                "{} is not set; the conversational agent needs an API key",
                settings.api_key_env
            ))
        })?;
        Self::new(api_key, settings)
    }

    fn request_body<'a>(
        &'a self,
        history: &[Message],
        directive: &'a str,
        stream: bool,
    ) -> Result<CreateMessageRequest<'a>> {
        let messages = to_api_messages(history);
        if messages.is_empty() {
            return Err(GtmError::Agent("cannot complete an empty history".to_string()));
        }
        Ok(CreateMessageRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: directive,
            messages,
            stream,
        })
    }

    async fn post(&self, body: &CreateMessageRequest<'_>) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(30);
            return Err(GtmError::RateLimited(retry_after));
        }
        if status.as_u16() == 529 {
            return Err(GtmError::Agent("API overloaded".to_string()));
        }
        Ok(response.error_for_status()?)
    }
}

/// API requires alternating roles starting with a user turn
fn to_api_messages(history: &[Message]) -> Vec<ApiMessage> {
    let mut out: Vec<ApiMessage> = Vec::with_capacity(history.len());
    for message in history {
        let role = match message.role {
            Role::User => "user",
            Role::Agent => "assistant",
        };
        match out.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&message.content);
            }
            None if role == "assistant" => {
                out.push(ApiMessage {
                    role: "user",
                    content: "(conversation start)".to_string(),
                });
                out.push(ApiMessage {
                    role,
                    content: message.content.clone(),
                });
            }
            _ => out.push(ApiMessage {
                role,
                content: message.content.clone(),
            }),
        }
    }
    out
}

/// Splits a byte stream into lines, decoding only whole lines
///
/// A multi-byte character split across network chunks stays intact.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let Some(last) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.pending.drain(..=last).collect();
        complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).trim_end().to_string())
            .collect()
    }

    /// Whatever followed the final newline
    fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).trim_end().to_string()
    }
}

/// Parse one SSE `data:` line into the text it carries
fn parse_sse_line(line: &str) -> Result<Option<String>> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let event: StreamEvent = match serde_json::from_str(data.trim()) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "Ignoring unparseable stream event");
            return Ok(None);
        }
    };
    match event {
        StreamEvent::ContentBlockDelta {
            delta: Delta::TextDelta { text },
        } => Ok(Some(text)),
        StreamEvent::Error { error } => Err(GtmError::Agent(format!(
            "{}: {}",
            error.kind, error.message
        ))),
        _ => Ok(None),
    }
}

#[async_trait]
impl ConversationalAgent for AnthropicAgent {
    async fn complete(&self, history: &[Message], directive: &str) -> Result<String> {
        let body = self.request_body(history, directive, false)?;
        let body = &body;

        let parsed: CreateMessageResponse =
            with_retry(&self.retry, "anthropic.complete", move || async move {
                Ok::<_, GtmError>(self.post(body).await?.json().await?)
            })
            .await?;

        let text: String = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect();
        if text.trim().is_empty() {
            return Err(GtmError::Agent("response contained no text".to_string()));
        }
        Ok(text)
    }

    async fn complete_streaming(
        &self,
        history: &[Message],
        directive: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<String> {
        let body = self.request_body(history, directive, true)?;
        let response = self.post(&body).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = LineBuffer::default();
        let mut full = String::new();

        while let Some(chunk) = stream.next().await {
            for line in buffer.push(&chunk?) {
                if let Some(text) = parse_sse_line(&line)? {
                    on_chunk(&text);
                    full.push_str(&text);
                }
            }
        }
        if let Some(text) = parse_sse_line(&buffer.finish())? {
            on_chunk(&text);
            full.push_str(&text);
        }

        if full.is_empty() {
            warn!(model = %self.model, "Stream ended without text");
            return Err(GtmError::Agent("stream ended without text".to_string()));
        }
        Ok(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_merging() {
        let history = vec![
            Message::agent("Welcome"),
            Message::user("a"),
            Message::user("b"),
            Message::agent("c"),
        ];
        let api = to_api_messages(&history);
        let roles: Vec<&str> = api.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["user", "assistant", "user", "assistant"]);
        assert_eq!(api[2].content, "a\n\nb");
    }

    #[test]
    fn test_sse_parsing() {
        let delta = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#;
        assert_eq!(parse_sse_line(delta).unwrap().as_deref(), Some("Hel"));

        assert_eq!(parse_sse_line("event: content_block_delta").unwrap(), None);
        assert_eq!(
            parse_sse_line(r#"data: {"type":"message_stop"}"#).unwrap(),
            None
        );

        let err = r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert!(parse_sse_line(err).is_err());
    }

    #[test]
    fn test_split_character_survives_chunking() {
        let event = "data: {\"type\":\"content_block_delta\",\"index\":0,\
            \"delta\":{\"type\":\"text_delta\",\"text\":\"café\"}}\n\n";
        let bytes = event.as_bytes();
        let split = event.find('é').unwrap() + 1;

        let mut buffer = LineBuffer::default();
        assert!(buffer.push(&bytes[..split]).is_empty());
        let lines = buffer.push(&bytes[split..]);
        assert_eq!(lines.len(), 1);
        assert_eq!(parse_sse_line(&lines[0]).unwrap().as_deref(), Some("café"));
        assert_eq!(buffer.finish(), "");
    }

    #[test]
    fn test_line_buffer_keeps_partial_tail() {
        let mut buffer = LineBuffer::default();
        let lines = buffer.push(b"event: ping\r\ndata: {\"type\":");
        assert_eq!(lines, vec!["event: ping"]);
        assert_eq!(buffer.finish(), "data: {\"type\":");
    }

    #[test]
    fn test_request_shape() {
        let agent = AnthropicAgent::new("key", &AgentSettings::default()).unwrap();
        let history = vec![Message::user("hi")];
        let body = agent.request_body(&history, "be brief", false).unwrap();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["system"], "be brief");
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("stream").is_none());
        assert!(agent.request_body(&[], "x", false).is_err());
    }
}
