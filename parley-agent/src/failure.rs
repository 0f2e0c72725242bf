//! Turning provider failures into readable explanations

use parley_providers::ProviderError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse failure kind shown to the user.
///
/// Used only to pick the explanation text; retry decisions are made by
/// [`ProviderError::is_transient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    SafetyBlock,
    Authentication,
    RateLimited,
    ServiceUnavailable,
    Network,
    Unexpected,
}

impl FailureCategory {
    /// Match a provider failure against the known categories
    pub fn classify(err: &ProviderError) -> Self {
        match err {
            ProviderError::Blocked(_) => return FailureCategory::SafetyBlock,
            ProviderError::Config(_) => return FailureCategory::Authentication,
            ProviderError::StreamInterrupted(_) => return FailureCategory::Network,
            ProviderError::Http(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                return FailureCategory::Network
            }
            _ => {}
        }

        let message = err.to_string().to_ascii_lowercase();
        match err.status() {
            Some(429) => FailureCategory::RateLimited,
            Some(403) if message.contains("quota") || message.contains("resource_exhausted") => {
                FailureCategory::RateLimited
            }
            Some(401) | Some(403) => FailureCategory::Authentication,
            Some(400) if message.contains("api key") || message.contains("api_key") => {
                FailureCategory::Authentication
            }
            Some(500) | Some(502) | Some(503) | Some(504) => FailureCategory::ServiceUnavailable,
            _ if message.contains("safety") => FailureCategory::SafetyBlock,
            _ => FailureCategory::Unexpected,
        }
    }

    /// Human-readable explanation appended to the failed message
    pub fn explanation(&self) -> &'static str {
        match self {
            FailureCategory::SafetyBlock => {
                "The response was blocked by the content safety filter. Try rephrasing your request."
            }
            FailureCategory::Authentication => {
                "Authentication with the generation service failed. Check that your API key is valid."
            }
            FailureCategory::RateLimited => {
                "The service is receiving too many requests or your quota is exhausted. Please wait a moment and try again."
            }
            FailureCategory::ServiceUnavailable => {
                "The generation service is temporarily unavailable. Please try again later."
            }
            FailureCategory::Network => {
                "The connection to the generation service was lost. Check your network and try again."
            }
            FailureCategory::Unexpected => "An unexpected error occurred while generating the response.",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCategory::SafetyBlock => "safety_block",
            FailureCategory::Authentication => "authentication",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::ServiceUnavailable => "service_unavailable",
            FailureCategory::Network => "network",
            FailureCategory::Unexpected => "unexpected",
        };
        f.write_str(name)
    }
}
