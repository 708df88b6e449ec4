//! Provider gateway for OpenAI-compatible chat completions.
//!
//! A [`ProviderGateway`] owns one transport, one retry policy and, for the
//! rate-restricted endpoint only, a quota limiter. Each model client in the
//! benchmark is an explicitly constructed gateway value.

pub mod error;
pub mod openai_compat;
pub mod rate_limit;
pub mod retry;
pub mod types;
pub mod usage;

use std::sync::Arc;

use openai_compat::ChatProvider;
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use openai_compat::{EndpointConfig, OpenAiCompatAdapter};
pub use rate_limit::{Clock, ManualClock, QuotaConfig, QuotaLimiter, SystemClock};
pub use retry::{RetryOn, RetryPolicy};
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    /// Resilient call: retried according to the gateway's policy.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Exactly one attempt, used for targeted repairs.
    async fn chat_once(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

pub struct ProviderGateway {
    provider: Arc<dyn ChatProvider>,
    usage_sink: Arc<dyn UsageSinkTrait>,
    retry: RetryPolicy,
    limiter: Option<Arc<QuotaLimiter>>,
}

#[async_trait::async_trait]
impl ChatGateway for ProviderGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }

    async fn chat_once(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat_once(self, req).await
    }
}

impl ProviderGateway {
    pub fn new(provider: Arc<dyn ChatProvider>, usage_sink: Arc<dyn UsageSinkTrait>) -> Self {
        Self {
            provider,
            usage_sink,
            retry: RetryPolicy::default(),
            limiter: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Throttle every attempt through `limiter`.
    pub fn with_limiter(mut self, limiter: Arc<QuotaLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let label = req.attribution.caller;
        self.retry
            .run(label, |attempt| self.attempt(&req, attempt))
            .await
    }

    pub async fn chat_once(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.attempt(&req, 0).await
    }

    async fn attempt(&self, req: &ChatRequest, attempt: u32) -> Result<ChatResponse, ProviderError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let record = ProviderCallRecord::new(
            req.model.provider(),
            req.model.model_id(),
            req.attribution.caller,
        )
        .item(req.attribution.item_index)
        .attempt(attempt + 1);

        match self.provider.chat(req).await {
            Ok(resp) => {
                if let Some(limiter) = &self.limiter {
                    limiter.record_success().await;
                }
                let record = record
                    .tokens(resp.input_tokens, resp.output_tokens)
                    .latency(resp.latency.as_millis() as u64);
                self.usage_sink.record(record).await;
                Ok(resp)
            }
            Err(err) => {
                self.usage_sink.record(record.error(err.code())).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait::async_trait]
    impl ChatProvider for Flaky {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(ProviderError::provider("openai_compat", "HTTP 502", true))
            } else {
                Ok(ChatResponse::text("essay"))
            }
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new(
            ChatModel::openrouter("deepseek/deepseek-r1-distill-llama-70b:free"),
            vec![Message::user("write")],
            Attribution::new("test"),
        )
    }

    #[tokio::test]
    async fn only_successful_calls_count_against_quota() {
        let provider = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let clock = Arc::new(ManualClock::starting_at(Duration::from_secs(86_400)));
        let limiter = Arc::new(QuotaLimiter::with_clock(QuotaConfig::new(15, 45), clock));
        let gateway = ProviderGateway::new(provider.clone(), Arc::new(NoopUsageSink))
            .with_retry(RetryPolicy::immediate(5))
            .with_limiter(limiter.clone());

        let resp = gateway.chat(request()).await.unwrap();
        assert_eq!(resp.content, "essay");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.usage().await.day_count, 1);
    }

    #[tokio::test]
    async fn chat_once_does_not_retry() {
        let provider = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 1,
        });
        let gateway = ProviderGateway::new(provider.clone(), Arc::new(NoopUsageSink))
            .with_retry(RetryPolicy::immediate(5));

        assert!(gateway.chat_once(request()).await.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
