//! Generation provider integrations for parley
//!
//! This crate provides the provider abstraction, the Gemini streaming client
//! and the retrying executor the conversation controller drives.

pub mod base;
pub mod gemini;
pub mod retry;

pub use base::{
    Content, Fragment, FragmentStream, GenerateRequest, GenerationConfig, GenerationProvider,
    InlineData, Part, ProviderError, ProviderResult, Tool,
};
pub use gemini::GeminiClient;
pub use retry::{RetryPolicy, StreamingExecutor};
