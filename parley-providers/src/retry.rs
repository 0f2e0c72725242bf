//! Streaming request execution with exponential backoff

use futures::stream::{self, StreamExt};
use parley_core::config::RetryConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::base::{
    Content, FragmentStream, GenerateRequest, GenerationConfig, GenerationProvider, ProviderError,
};

/// Backoff schedule for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            factor: 2,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            factor: config.factor.max(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(retry);
        self.base_delay.saturating_mul(multiplier)
    }

    /// Upper bound on attempts for one request
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Issues generation requests and retries transient failures that happen
/// before the first fragment arrives.
///
/// Once a fragment has been delivered, every later error is handed to the
/// consumer unchanged.
#[derive(Clone)]
pub struct StreamingExecutor {
    provider: Arc<dyn GenerationProvider>,
    policy: RetryPolicy,
    model: String,
}

impl StreamingExecutor {
    pub fn new(provider: Arc<dyn GenerationProvider>, policy: RetryPolicy) -> Self {
        let model = provider.default_model();
        Self {
            provider,
            policy,
            model,
        }
    }

    /// Use a specific model instead of the provider default
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send `history` followed by `new_turn` and stream the reply.
    ///
    /// The returned stream always terminates; a terminal failure is its last
    /// item.
    pub async fn execute(
        &self,
        history: Vec<Content>,
        new_turn: Content,
        config: GenerationConfig,
    ) -> FragmentStream {
        let mut contents = history;
        contents.push(new_turn);
        let request = GenerateRequest {
            model: self.model.clone(),
            contents,
            config,
        };
        self.execute_request(request).await
    }

    /// Like [`execute`](Self::execute) for a fully built request
    pub async fn execute_request(&self, request: GenerateRequest) -> FragmentStream {
        let mut retry = 0;
        loop {
            let attempt = retry + 1;
            let err = match self.provider.stream_generate(request.clone()).await {
                Ok(mut stream) => match stream.next().await {
                    Some(Ok(first)) => {
                        debug!("First fragment received on attempt {}", attempt);
                        return Box::pin(stream::once(async move { Ok(first) }).chain(stream));
                    }
                    Some(Err(err)) => err,
                    None => return Box::pin(stream::empty()),
                },
                Err(err) => err,
            };

            if !err.is_transient() || retry >= self.policy.max_retries {
                if err.is_transient() {
                    warn!(
                        "Request failed after {} attempts: {}",
                        attempt, err
                    );
                }
                return failed(err);
            }

            let delay = self.policy.delay_for(retry);
            warn!(
                "Request failed (attempt {}/{}): {}. Retrying after {:?}...",
                attempt,
                self.policy.max_attempts(),
                err,
                delay
            );
            sleep(delay).await;
            retry += 1;
        }
    }
}

fn failed(err: ProviderError) -> FragmentStream {
    Box::pin(stream::once(async move { Err(err) }))
}
