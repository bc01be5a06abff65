//! Anthropic messages API transport.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::client::{
    Completion, CompletionChunk, CompletionRequest, CompletionStream, LlmClient, TokenUsage,
};

use super::{drain_sse_events, map_http_error};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT_SECS: u64 = 300;
/// The messages API requires an explicit completion budget.
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Client for the Anthropic messages API.
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    /// Creates a new client.
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client"),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    /// The base URL in use.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, body: &ApiRequest) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(map_http_error(status.as_u16(), body));
        }

        Ok(response)
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let api_request = ApiRequest::from_request(&request, false);
        let response = self.post(&api_request).await?;

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("invalid messages body: {}", e)))?;

        let text = api_response
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(Completion {
            text,
            usage: TokenUsage::new(
                api_response.usage.input_tokens,
                api_response.usage.output_tokens,
            ),
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, LlmError> {
        let api_request = ApiRequest::from_request(&request, true);
        let response = self.post(&api_request).await?;

        let mut body = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = String::new();
            let mut usage = TokenUsage::default();
            let mut finished = false;

            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(LlmError::RequestFailed(e.to_string()));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                for payload in drain_sse_events(&mut buffer) {
                    let event: StreamEvent = match serde_json::from_str(&payload) {
                        Ok(event) => event,
                        Err(e) => {
                            yield Err(LlmError::ParseError(format!(
                                "invalid stream event: {}", e
                            )));
                            return;
                        }
                    };

                    match event {
                        StreamEvent::MessageStart { message } => {
                            usage.prompt_tokens = message.usage.input_tokens;
                        }
                        StreamEvent::ContentBlockDelta { delta } => {
                            if let Some(text) = delta.text {
                                if !text.is_empty() {
                                    yield Ok(CompletionChunk::Text(text));
                                }
                            }
                        }
                        StreamEvent::MessageDelta { usage: delta_usage } => {
                            if let Some(u) = delta_usage {
                                usage.completion_tokens = u.output_tokens;
                            }
                        }
                        StreamEvent::MessageStop => {
                            finished = true;
                        }
                        StreamEvent::Other => {}
                    }
                }
            }

            if finished {
                yield Ok(CompletionChunk::Done(usage));
            } else {
                yield Err(LlmError::StreamTruncated);
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Wire request for the messages endpoint.
#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

impl ApiRequest {
    /// The messages API carries the system prompt out-of-band.
    fn from_request(request: &CompletionRequest, stream: bool) -> Self {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();

        for message in &request.messages {
            if message.role == "system" {
                system_parts.push(message.content.clone());
            } else {
                messages.push(ApiMessage {
                    role: message.role.clone(),
                    content: message.content.clone(),
                });
            }
        }

        Self {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
            temperature: request.temperature,
            stream,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Streaming events of the messages API.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockDelta {
        delta: StreamTextDelta,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<ApiUsage>,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct StreamTextDelta {
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::ChatMessage;

    #[test]
    fn test_system_prompt_lifted_out_of_messages() {
        let request = CompletionRequest::new(
            "claude-sonnet-4-5",
            vec![
                ChatMessage::system("rules"),
                ChatMessage::user("make a cube"),
            ],
        );

        let api = ApiRequest::from_request(&request, false);
        assert_eq!(api.system.as_deref(), Some("rules"));
        assert_eq!(api.messages.len(), 1);
        assert_eq!(api.messages[0].role, "user");
        assert_eq!(api.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_stream_event_parsing() {
        let payload = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"cq"}}"#;
        let event: StreamEvent = serde_json::from_str(payload).unwrap();
        assert!(matches!(
            event,
            StreamEvent::ContentBlockDelta { delta } if delta.text.as_deref() == Some("cq")
        ));

        let payload = r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":42}}"#;
        let event: StreamEvent = serde_json::from_str(payload).unwrap();
        assert!(matches!(
            event,
            StreamEvent::MessageDelta { usage: Some(u) } if u.output_tokens == 42
        ));

        let payload = r#"{"type":"ping"}"#;
        let event: StreamEvent = serde_json::from_str(payload).unwrap();
        assert!(matches!(event, StreamEvent::Other));
    }

    #[test]
    fn test_response_parsing() {
        let payload = r#"{
            "content": [{"type": "text", "text": "import cadquery as cq"}],
            "usage": {"input_tokens": 120, "output_tokens": 30}
        }"#;
        let response: ApiResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(response.usage.input_tokens, 120);
        assert_eq!(response.content.len(), 1);
    }
}
