#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use essay_bench::gateway::{ChatGateway, ChatRequest, ChatResponse, ProviderError, Role};
use essay_bench::ledger::{Ledger, ResponseRecord};
use essay_bench::supplier::Prompt;

type Reply = dyn Fn(&ChatRequest) -> Result<String, ProviderError> + Send + Sync;

/// In-process gateway answering from a closure and recording every call.
pub struct StubGateway {
    reply: Box<Reply>,
    calls: AtomicUsize,
    once_calls: AtomicUsize,
    items: Mutex<Vec<Option<i64>>>,
}

impl StubGateway {
    pub fn new(
        reply: impl Fn(&ChatRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            reply: Box::new(reply),
            calls: AtomicUsize::new(0),
            once_calls: AtomicUsize::new(0),
            items: Mutex::new(Vec::new()),
        })
    }

    /// Always answers `text`.
    pub fn constant(text: &'static str) -> Arc<Self> {
        Self::new(move |_| Ok(text.to_string()))
    }

    /// Always fails.
    pub fn failing() -> Arc<Self> {
        Self::new(|_| Err(ProviderError::provider("stub", "unavailable", true)))
    }

    /// Total calls, resilient and single-shot.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn once_calls(&self) -> usize {
        self.once_calls.load(Ordering::SeqCst)
    }

    /// Item indices in call order.
    pub fn items(&self) -> Vec<i64> {
        self.items.lock().unwrap().iter().flatten().copied().collect()
    }

    fn answer(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.items.lock().unwrap().push(req.attribution.item_index);
        (self.reply)(req).map(ChatResponse::text)
    }
}

#[async_trait::async_trait]
impl ChatGateway for StubGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.answer(&req)
    }

    async fn chat_once(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.once_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(&req)
    }
}

/// Content of the last user turn.
pub fn user_text(req: &ChatRequest) -> &str {
    req.messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}

pub fn prompts(n: i64) -> Vec<Prompt> {
    (0..n).map(|i| Prompt::new(i, format!("题目{i}"))).collect()
}

pub fn answered(index: i64, text: &str) -> ResponseRecord {
    ResponseRecord {
        index,
        prompt: format!("题目{index}"),
        response: Some(text.to_string()),
    }
}

pub fn unanswered(index: i64) -> ResponseRecord {
    ResponseRecord {
        index,
        prompt: format!("题目{index}"),
        response: None,
    }
}

pub fn write_responses(ledger: &Ledger<ResponseRecord>, rows: &[ResponseRecord]) {
    ledger.commit(rows).unwrap();
}
