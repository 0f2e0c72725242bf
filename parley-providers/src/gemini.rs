//! Gemini streaming HTTP client

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parley_core::session::Citation;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::base::{
    Content, Fragment, FragmentStream, GenerateRequest, GenerationProvider, Part, ProviderError,
    ProviderResult, Tool,
};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Finish reasons that mean the reply was withheld
const BLOCKED_FINISH_REASONS: [&str; 5] = [
    "SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "IMAGE_SAFETY",
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamRequestBody<'a> {
    contents: &'a [Content],
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfigBody>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfigBody {
    thinking_config: ThinkingConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
struct WebSource {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorWrapper {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// What one SSE payload contributed to the reply
#[derive(Debug, Default)]
struct ChunkOutcome {
    fragment: Option<Fragment>,
    blocked: Option<String>,
}

/// Gemini client speaking `streamGenerateContent` over SSE
pub struct GeminiClient {
    client: Client,
    api_base: String,
    api_key: String,
    default_model: String,
    extra_headers: HashMap<String, String>,
}

impl GeminiClient {
    /// Create a new Gemini client
    pub fn new(
        api_key: String,
        api_base: Option<String>,
        default_model: String,
        extra_headers: Option<HashMap<String, String>>,
    ) -> Self {
        let api_base = api_base
            .map(|base| base.trim().trim_end_matches('/').to_string())
            .filter(|base| !base.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        Self {
            client: Client::builder()
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_base,
            api_key,
            default_model,
            extra_headers: extra_headers.unwrap_or_default(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn stream_url(&self, model: &str) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.api_base, model
        )
    }

    fn build_body(request: &GenerateRequest) -> StreamRequestBody<'_> {
        let config = &request.config;
        StreamRequestBody {
            contents: &request.contents,
            system_instruction: config
                .system_instruction
                .as_ref()
                .filter(|s| !s.trim().is_empty())
                .map(|text| SystemInstruction {
                    parts: vec![Part::Text(text.clone())],
                }),
            tools: config
                .tools
                .iter()
                .map(|tool| match tool {
                    Tool::GoogleSearch => serde_json::json!({ "google_search": {} }),
                })
                .collect(),
            generation_config: config.thinking_budget.map(|budget| GenerationConfigBody {
                thinking_config: ThinkingConfig {
                    thinking_budget: budget,
                },
            }),
        }
    }

    fn apply_headers(&self, mut req_builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req_builder = req_builder.header("x-goog-api-key", &self.api_key);
        for (key, value) in &self.extra_headers {
            req_builder = req_builder.header(key, value);
        }
        req_builder
    }

    fn parse_chunk(chunk: StreamChunk) -> ChunkOutcome {
        let mut outcome = ChunkOutcome::default();

        if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
            outcome.blocked = Some(reason);
            return outcome;
        }

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return outcome;
        };

        let text: String = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter(|part| !part.thought)
                    .filter_map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default();

        let citations: Vec<Citation> = candidate
            .grounding_metadata
            .map(|meta| {
                meta.grounding_chunks
                    .into_iter()
                    .filter_map(|chunk| chunk.web)
                    .filter_map(|web| {
                        let uri = web.uri.filter(|u| !u.is_empty())?;
                        let title = web
                            .title
                            .filter(|t| !t.trim().is_empty())
                            .unwrap_or_else(|| uri.clone());
                        Some(Citation::new(title, uri))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let fragment = Fragment {
            text_delta: text,
            citations,
        };
        if !fragment.is_empty() {
            outcome.fragment = Some(fragment);
        }

        if let Some(reason) = candidate.finish_reason {
            if BLOCKED_FINISH_REASONS.contains(&reason.as_str()) {
                outcome.blocked = Some(reason);
            }
        }
        outcome
    }
}

impl ErrorBody {
    fn into_provider_error(self, status: u16, raw: &str) -> ProviderError {
        let status_text = self.status.unwrap_or_default();
        let msg = self.message.unwrap_or_else(|| raw.to_string());
        let message = if status_text.is_empty() {
            msg
        } else {
            format!("{status_text}: {msg}")
        };
        ProviderError::Api { status, message }
    }
}

/// Build an API error from a non-success response body
fn map_http_error(status: u16, body: &str) -> ProviderError {
    match serde_json::from_str::<ErrorWrapper>(body) {
        Ok(wrapper) => wrapper.error.into_provider_error(status, body),
        Err(_) => ProviderError::Api {
            status,
            message: body.to_string(),
        },
    }
}

#[async_trait]
impl GenerationProvider for GeminiClient {
    async fn stream_generate(&self, request: GenerateRequest) -> ProviderResult<FragmentStream> {
        if self.api_key.trim().is_empty() {
            return Err(ProviderError::Config("API key is not configured".to_string()));
        }

        let model = if request.model.is_empty() {
            self.default_model.clone()
        } else {
            request.model.clone()
        };
        let url = self.stream_url(&model);
        let body = Self::build_body(&request);

        debug!(
            "Sending streaming request to {} with model {} ({} contents)",
            self.api_base,
            model,
            request.contents.len()
        );

        let req_builder = self.apply_headers(self.client.post(&url).json(&body));
        let response = req_builder.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_http_error(status, &error_text));
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut events = response.bytes_stream().eventsource();

            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        warn!("Reply stream interrupted: {}", err);
                        let _ = tx.send(Err(ProviderError::StreamInterrupted(err.to_string())));
                        return;
                    }
                };
                if event.data.trim().is_empty() {
                    continue;
                }

                let parsed = match serde_json::from_str::<StreamChunk>(&event.data) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx.send(Err(ProviderError::Json(err)));
                        return;
                    }
                };

                // The service may report a failure inside a 200 stream
                if let Some(error) = parsed.error {
                    let status = error.code.unwrap_or(500);
                    warn!("Error event in reply stream (HTTP {})", status);
                    let _ = tx.send(Err(error.into_provider_error(status, &event.data)));
                    return;
                }

                let outcome = Self::parse_chunk(parsed);
                if let Some(fragment) = outcome.fragment {
                    if tx.send(Ok(fragment)).is_err() {
                        debug!("Reply consumer went away; closing stream");
                        return;
                    }
                }
                if let Some(reason) = outcome.blocked {
                    let _ = tx.send(Err(ProviderError::Blocked(reason)));
                    return;
                }
            }
        });

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    fn default_model(&self) -> String {
        self.default_model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{GenerationConfig, InlineData};
    use std::io::Write;

    fn chunk(json: &str) -> StreamChunk {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_chunk_skips_thoughts() {
        let outcome = GeminiClient::parse_chunk(chunk(
            r#"{"candidates":[{"content":{"parts":[
                {"text":"thinking...","thought":true},
                {"text":"Hello"},
                {"text":", world"}
            ]}}]}"#,
        ));
        assert_eq!(outcome.fragment.unwrap().text_delta, "Hello, world");
        assert!(outcome.blocked.is_none());
    }

    #[test]
    fn test_parse_chunk_grounding() {
        let outcome = GeminiClient::parse_chunk(chunk(
            r#"{"candidates":[{"groundingMetadata":{"groundingChunks":[
                {"web":{"uri":"https://a.example","title":"A"}},
                {"web":{"uri":"https://b.example"}},
                {"web":{"title":"no uri"}}
            ]}}]}"#,
        ));
        let fragment = outcome.fragment.unwrap();
        assert!(fragment.text_delta.is_empty());
        assert_eq!(
            fragment.citations,
            vec![
                Citation::new("A", "https://a.example"),
                Citation::new("https://b.example", "https://b.example"),
            ]
        );
    }

    #[test]
    fn test_parse_chunk_safety_keeps_text() {
        let outcome = GeminiClient::parse_chunk(chunk(
            r#"{"candidates":[{"content":{"parts":[{"text":"Partial"}]},"finishReason":"SAFETY"}]}"#,
        ));
        assert_eq!(outcome.fragment.unwrap().text_delta, "Partial");
        assert_eq!(outcome.blocked.as_deref(), Some("SAFETY"));

        let outcome = GeminiClient::parse_chunk(chunk(
            r#"{"promptFeedback":{"blockReason":"PROHIBITED_CONTENT"}}"#,
        ));
        assert!(outcome.fragment.is_none());
        assert_eq!(outcome.blocked.as_deref(), Some("PROHIBITED_CONTENT"));
    }

    #[test]
    fn test_parse_chunk_stop_is_not_blocked() {
        let outcome = GeminiClient::parse_chunk(chunk(
            r#"{"candidates":[{"content":{"parts":[{"text":"done"}]},"finishReason":"STOP"}]}"#,
        ));
        assert!(outcome.blocked.is_none());
    }

    #[test]
    fn test_map_http_error_uses_json_body() {
        let err = map_http_error(
            429,
            r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#,
        );
        assert_eq!(err.to_string(), "API error (HTTP 429): RESOURCE_EXHAUSTED: Quota exceeded");
        assert!(err.is_transient());

        let err = map_http_error(502, "<html>bad gateway</html>");
        assert!(matches!(err, ProviderError::Api { status: 502, ref message } if message.contains("bad gateway")));
    }

    #[test]
    fn test_build_body() {
        let request = GenerateRequest {
            model: "gemini-test".into(),
            contents: vec![Content::user(vec![
                Part::Text("Describe".into()),
                Part::InlineData(InlineData {
                    mime_type: "image/png".into(),
                    data: "AAAA".into(),
                }),
            ])],
            config: GenerationConfig {
                system_instruction: Some("Be brief".into()),
                tools: vec![Tool::GoogleSearch],
                thinking_budget: Some(0),
            },
        };
        let body = serde_json::to_value(GeminiClient::build_body(&request)).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be brief");
        assert_eq!(body["tools"][0], serde_json::json!({"google_search": {}}));
        assert_eq!(body["generationConfig"]["thinkingConfig"]["thinkingBudget"], 0);
        assert_eq!(body["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/png");

        let plain = GenerateRequest {
            config: GenerationConfig::default(),
            ..request
        };
        let body = serde_json::to_value(GeminiClient::build_body(&plain)).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("systemInstruction").is_none());
        assert!(body.get("generationConfig").is_none());
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            model: "gemini-test".into(),
            contents: vec![Content::user(vec![Part::Text("Hi".into())])],
            config: GenerationConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_stream_generate_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}]}\r\n\r\n",
        );
        let mock = server
            .mock(
                "POST",
                mockito::Matcher::Regex(r"^/models/gemini-test:streamGenerateContent".into()),
            )
            .match_header("x-goog-api-key", "test-key")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = GeminiClient::new("test-key".into(), Some(server.url()), "unused".into(), None);
        let stream = client.stream_generate(request()).await.unwrap();
        let items: Vec<_> = stream.collect().await;

        mock.assert_async().await;
        let text: String = items
            .into_iter()
            .map(|item| item.unwrap().text_delta)
            .collect();
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn test_stream_generate_maps_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock(
                "POST",
                mockito::Matcher::Regex(r"^/models/gemini-test:streamGenerateContent".into()),
            )
            .with_status(503)
            .with_body(r#"{"error":{"message":"The model is overloaded.","status":"UNAVAILABLE"}}"#)
            .create_async()
            .await;

        let client = GeminiClient::new("test-key".into(), Some(server.url()), "unused".into(), None);
        let err = match client.stream_generate(request()).await {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert_eq!(err.status(), Some(503));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_stream_keeps_characters_split_across_chunks() {
        let mut server = mockito::Server::new_async().await;
        let event = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"caf\u{e9} \u{1f600}\"}]}}]}\n\n";
        let bytes = event.as_bytes().to_vec();
        // Cut inside the two-byte encoding of the accented letter
        let split = event.find('\u{e9}').unwrap() + 1;
        let _mock = server
            .mock(
                "POST",
                mockito::Matcher::Regex(r"^/models/gemini-test:streamGenerateContent".into()),
            )
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_chunked_body(move |w| {
                w.write_all(&bytes[..split])?;
                w.flush()?;
                std::thread::sleep(std::time::Duration::from_millis(50));
                w.write_all(&bytes[split..])
            })
            .create_async()
            .await;

        let client = GeminiClient::new("test-key".into(), Some(server.url()), "unused".into(), None);
        let stream = client.stream_generate(request()).await.unwrap();
        let text: String = stream
            .map(|item| item.unwrap().text_delta)
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(text, "caf\u{e9} \u{1f600}");
    }

    #[tokio::test]
    async fn test_error_event_in_stream_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Part\"}]}}]}\n\n",
            "data: {\"error\":{\"code\":503,\"message\":\"The model is overloaded.\",\"status\":\"UNAVAILABLE\"}}\n\n",
        );
        let _mock = server
            .mock(
                "POST",
                mockito::Matcher::Regex(r"^/models/gemini-test:streamGenerateContent".into()),
            )
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = GeminiClient::new("test-key".into(), Some(server.url()), "unused".into(), None);
        let items: Vec<_> = client.stream_generate(request()).await.unwrap().collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().text_delta, "Part");
        let err = items[1].as_ref().unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(err.is_transient());
        assert!(err.to_string().contains("overloaded"));
    }

    #[tokio::test]
    async fn test_missing_api_key_is_config_error() {
        let client = GeminiClient::new(String::new(), None, "gemini-test".into(), None);
        let result = client.stream_generate(request()).await;
        assert!(matches!(result, Err(ProviderError::Config(_))));
    }
}
