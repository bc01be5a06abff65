//! Google generativelanguage API transport for Gemini models.

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

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Client for the Gemini generateContent API.
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
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

    async fn post(
        &self,
        model: &str,
        method: &str,
        sse: bool,
        body: &ApiRequest,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/models/{}:{}", self.base_url, model, method);

        let mut query = vec![("key", self.api_key.as_str())];
        if sse {
            query.push(("alt", "sse"));
        }

        let response = self
            .client
            .post(url)
            .query(&query)
            .header("Content-Type", "application/json")
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
impl LlmClient for GeminiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let api_request = ApiRequest::from_request(&request);
        let response = self
            .post(&request.model, "generateContent", false, &api_request)
            .await?;

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("invalid generateContent body: {}", e)))?;

        Ok(api_response.into_completion())
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, LlmError> {
        let api_request = ApiRequest::from_request(&request);
        let response = self
            .post(&request.model, "streamGenerateContent", true, &api_request)
            .await?;

        let mut body = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = String::new();
            let mut usage = TokenUsage::default();
            let mut saw_candidate = false;

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
                    let event: ApiResponse = match serde_json::from_str(&payload) {
                        Ok(event) => event,
                        Err(e) => {
                            yield Err(LlmError::ParseError(format!(
                                "invalid stream event: {}", e
                            )));
                            return;
                        }
                    };

                    if let Some(meta) = &event.usage_metadata {
                        usage = TokenUsage::new(
                            meta.prompt_token_count,
                            meta.candidates_token_count,
                        );
                    }

                    let text = event.candidate_text();
                    if !text.is_empty() {
                        saw_candidate = true;
                        yield Ok(CompletionChunk::Text(text));
                    }
                }
            }

            if saw_candidate || usage != TokenUsage::default() {
                yield Ok(CompletionChunk::Done(usage));
            } else {
                yield Err(LlmError::StreamTruncated);
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Wire request for generateContent.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiRequest {
    contents: Vec<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<ApiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

impl ApiRequest {
    fn from_request(request: &CompletionRequest) -> Self {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for message in &request.messages {
            match message.role.as_str() {
                "system" => system_parts.push(ApiPart {
                    text: message.content.clone(),
                }),
                role => contents.push(ApiContent {
                    // Gemini uses "model" for assistant turns.
                    role: Some(if role == "assistant" {
                        "model".to_string()
                    } else {
                        "user".to_string()
                    }),
                    parts: vec![ApiPart {
                        text: message.content.clone(),
                    }],
                }),
            }
        }

        let generation_config = if request.temperature.is_some() || request.max_tokens.is_some() {
            Some(GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            })
        } else {
            None
        };

        Self {
            contents,
            system_instruction: (!system_parts.is_empty()).then(|| ApiContent {
                role: None,
                parts: system_parts,
            }),
            generation_config,
        }
    }
}

/// Wire response for generateContent (streaming and non-streaming).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<ApiCandidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct ApiCandidate {
    #[serde(default)]
    content: Option<ApiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl ApiResponse {
    fn candidate_text(&self) -> String {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|content| content.parts.iter())
            .map(|part| part.text.as_str())
            .collect()
    }

    fn into_completion(self) -> Completion {
        let text = self.candidate_text();
        let usage = self
            .usage_metadata
            .map(|m| TokenUsage::new(m.prompt_token_count, m.candidates_token_count))
            .unwrap_or_default();
        Completion { text, usage }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::ChatMessage;

    #[test]
    fn test_request_mapping() {
        let request = CompletionRequest::new(
            "gemini-2.0-flash",
            vec![
                ChatMessage::system("rules"),
                ChatMessage::user("make a cube"),
                ChatMessage::assistant("here"),
            ],
        )
        .with_temperature(0.8);

        let api = ApiRequest::from_request(&request);
        assert!(api.system_instruction.is_some());
        assert_eq!(api.contents.len(), 2);
        assert_eq!(api.contents[1].role.as_deref(), Some("model"));
        assert_eq!(api.generation_config.as_ref().unwrap().temperature, Some(0.8));
    }

    #[test]
    fn test_response_parsing() {
        let payload = r#"{
            "candidates": [
                {"content": {"role": "model", "parts": [{"text": "import cadquery"}]}}
            ],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3}
        }"#;
        let response: ApiResponse = serde_json::from_str(payload).unwrap();
        let completion = response.into_completion();

        assert_eq!(completion.text, "import cadquery");
        assert_eq!(completion.usage.prompt_tokens, 7);
        assert_eq!(completion.usage.completion_tokens, 3);
    }
}
