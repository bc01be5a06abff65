//! OpenAI-compatible chat-completions transport.
//!
//! Serves every provider that speaks the `/chat/completions` dialect:
//! openai itself plus deepseek, qwen, kimi, ollama and runpod endpoints.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ProviderKind;
use crate::error::LlmError;
use crate::llm::client::{
    ChatMessage, Completion, CompletionChunk, CompletionRequest, CompletionStream, LlmClient,
    TokenUsage,
};

use super::{drain_sse_events, map_http_error};

/// Request timeout. Large code generations stream for a while.
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Default base URL per provider.
fn default_base_url(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "https://api.openai.com/v1",
        ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
        ProviderKind::Qwen => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        ProviderKind::Kimi => "https://api.moonshot.ai/v1",
        ProviderKind::Ollama => "http://localhost:11434/v1",
        ProviderKind::RunPod => "https://api.runpod.ai/v2",
        // Claude and Gemini have dedicated transports.
        ProviderKind::Claude | ProviderKind::Gemini => unreachable!("dedicated transport"),
    }
}

/// Client for OpenAI-compatible chat-completions APIs.
pub struct OpenAiCompatClient {
    client: Client,
    kind: ProviderKind,
    api_key: String,
    base_url: String,
}

impl OpenAiCompatClient {
    /// Creates a client for the given provider.
    pub fn new(kind: ProviderKind, api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client"),
            kind,
            api_key,
            base_url: base_url.unwrap_or_else(|| default_base_url(kind).to_string()),
        }
    }

    /// The provider this client is configured for.
    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// The base URL in use.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post(&self, body: &ApiRequest) -> Result<reqwest::Response, LlmError> {
        let mut request = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json");

        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = request
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
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let api_request = ApiRequest::from_request(&request, false);
        let response = self.post(&api_request).await?;

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("invalid completion body: {}", e)))?;

        let text = api_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::ParseError("no choices in response".to_string()))?;

        let usage = api_response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(Completion { text, usage })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, LlmError> {
        let api_request = ApiRequest::from_request(&request, true);
        let response = self.post(&api_request).await?;

        let mut body = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = String::new();
            let mut usage = TokenUsage::default();
            let mut done = false;

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
                    if payload == "[DONE]" {
                        done = true;
                        continue;
                    }
                    let event: StreamEvent = match serde_json::from_str(&payload) {
                        Ok(event) => event,
                        Err(e) => {
                            yield Err(LlmError::ParseError(format!(
                                "invalid stream event: {}", e
                            )));
                            return;
                        }
                    };
                    if let Some(u) = event.usage {
                        usage = TokenUsage::new(u.prompt_tokens, u.completion_tokens);
                    }
                    if let Some(choice) = event.choices.into_iter().next() {
                        if let Some(text) = choice.delta.content {
                            if !text.is_empty() {
                                yield Ok(CompletionChunk::Text(text));
                            }
                        }
                    }
                }
            }

            if done || usage != TokenUsage::default() {
                yield Ok(CompletionChunk::Done(usage));
            } else {
                yield Err(LlmError::StreamTruncated);
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Wire request for the chat-completions endpoint.
#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl ApiRequest {
    fn from_request(request: &CompletionRequest, stream: bool) -> Self {
        Self {
            model: request.model.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

/// Wire response for the non-streaming endpoint.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Wire event for the streaming endpoint.
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_base_urls() {
        assert!(default_base_url(ProviderKind::OpenAi).contains("openai.com"));
        assert!(default_base_url(ProviderKind::Ollama).contains("11434"));
        assert!(default_base_url(ProviderKind::DeepSeek).contains("deepseek"));
    }

    #[test]
    fn test_base_url_override() {
        let client = OpenAiCompatClient::new(
            ProviderKind::OpenAi,
            "key".into(),
            Some("http://localhost:8080/v1".into()),
        );
        assert_eq!(client.base_url(), "http://localhost:8080/v1");
        assert_eq!(client.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_api_request_serialization() {
        let request = CompletionRequest::new("gpt-4o", vec![ChatMessage::user("hi")])
            .with_temperature(0.3);

        let api = ApiRequest::from_request(&request, false);
        let json = serde_json::to_string(&api).unwrap();
        assert!(json.contains("\"model\":\"gpt-4o\""));
        assert!(json.contains("\"temperature\":0.3"));
        // Non-streaming requests omit stream flags entirely.
        assert!(!json.contains("stream"));

        let api = ApiRequest::from_request(&request, true);
        let json = serde_json::to_string(&api).unwrap();
        assert!(json.contains("\"stream\":true"));
        assert!(json.contains("include_usage"));
    }

    #[test]
    fn test_stream_event_parsing() {
        let payload = r#"{"choices":[{"delta":{"content":"hel"}}]}"#;
        let event: StreamEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.choices[0].delta.content.as_deref(), Some("hel"));

        let payload = r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":4}}"#;
        let event: StreamEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.usage.unwrap().completion_tokens, 4);
    }

    #[tokio::test]
    async fn test_connection_error_maps_to_request_failed() {
        let client = OpenAiCompatClient::new(
            ProviderKind::OpenAi,
            "key".into(),
            Some("http://localhost:65535/v1".into()),
        );
        let request = CompletionRequest::new("gpt-4o", vec![ChatMessage::user("hi")]);

        let result = client.complete(request).await;
        assert!(matches!(result, Err(LlmError::RequestFailed(_))));
    }
}
