//! Base trait and wire types for generation providers

use async_trait::async_trait;
use futures::stream::Stream;
use parley_core::session::Citation;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;

/// Error type for provider operations
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// The service refused to answer for content-safety reasons
    #[error("Response blocked: {0}")]
    Blocked(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl ProviderError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Api { status, .. } => Some(*status),
            ProviderError::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether the failure is a rate limit, quota exhaustion or temporary
    /// unavailability that is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self.status() {
            Some(429) | Some(503) => true,
            Some(403) => self.mentions_quota(),
            _ => false,
        }
    }

    fn mentions_quota(&self) -> bool {
        let text = self.to_string().to_ascii_lowercase();
        text.contains("quota") || text.contains("resource_exhausted")
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Incremental piece of a model reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub text_delta: String,
    pub citations: Vec<Citation>,
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text_delta: text.into(),
            citations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text_delta.is_empty() && self.citations.is_empty()
    }
}

/// Ordered, finite stream of fragments; an `Err` item ends the reply
pub type FragmentStream = Pin<Box<dyn Stream<Item = ProviderResult<Fragment>> + Send>>;

/// One side of the conversation as sent on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: "user".to_string(),
            parts,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![Part::Text(text.into())],
        }
    }
}

/// A single part of a content block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    Text(String),
    InlineData(InlineData),
}

/// Binary payload, base64 encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

/// Server-side tools the model may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    GoogleSearch,
}

/// Per-turn generation settings derived from the session mode
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationConfig {
    pub system_instruction: Option<String>,
    pub tools: Vec<Tool>,
    pub thinking_budget: Option<i32>,
}

/// Full request for one reply
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub contents: Vec<Content>,
    pub config: GenerationConfig,
}

/// Trait for streaming generation services
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Open a reply stream for `request`.
    ///
    /// Failing to open the stream returns `Err`; failures after that are
    /// delivered as stream items.
    async fn stream_generate(&self, request: GenerateRequest) -> ProviderResult<FragmentStream>;

    /// Model used when the caller does not name one
    fn default_model(&self) -> String;
}
