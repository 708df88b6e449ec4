//! Response collection: one essay per prompt for one model.
//!
//! Collection is resumable. Prompts whose index already has a response in the
//! model's ledger are skipped, new responses are committed in one batch at the
//! end of the run, and the re-read table is returned.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::ledger::{upsert, Ledger, LedgerError, LedgerRow, ResponseRecord, TableState};
use crate::prompts;
use crate::supplier::Prompt;

pub const ESSAY_TEMPERATURE: f32 = 0.7;
pub const ESSAY_MAX_TOKENS: u32 = 1000;

/// Progress cadence for unthrottled models.
const PROGRESS_EVERY: usize = 5;
/// Assumed wall time per request on a rate-limited endpoint, for ETAs.
const THROTTLED_SECS_PER_REQUEST: u64 = 10;

/// Collects one model's responses into its response ledger.
pub struct ResponseCollector {
    label: String,
    model: ChatModel,
    gateway: Arc<dyn ChatGateway>,
    ledger: Ledger<ResponseRecord>,
    throttled: bool,
}

impl ResponseCollector {
    /// `label` is the short model id used in file names, e.g. `"7B"`.
    pub fn new(
        label: impl Into<String>,
        model: ChatModel,
        gateway: Arc<dyn ChatGateway>,
        ledger: Ledger<ResponseRecord>,
    ) -> Self {
        Self {
            label: label.into(),
            model,
            gateway,
            ledger,
            throttled: false,
        }
    }

    /// Log every item with an ETA, for endpoints behind a quota limiter.
    pub fn throttled(mut self, throttled: bool) -> Self {
        self.throttled = throttled;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ledger(&self) -> &Ledger<ResponseRecord> {
        &self.ledger
    }

    /// Produce a response table covering `prompts`.
    ///
    /// With `force` a complete table is not returned as-is; its rows are
    /// still loaded so that only unanswered prompts are generated. An
    /// unreadable table is an error and is left on disk untouched.
    pub async fn process(
        &self,
        prompts: &[Prompt],
        force: bool,
    ) -> Result<Vec<ResponseRecord>, LedgerError> {
        let model = self.label.as_str();
        let mut rows = match self.ledger.load()? {
            TableState::Loaded(rows) if !force && rows.len() == prompts.len() => {
                info!(model, rows = rows.len(), "responses complete; using cached table");
                return Ok(rows);
            }
            TableState::Stale {
                missing_columns, ..
            } => {
                warn!(model, missing = ?missing_columns, "response table lacks required columns; regenerating");
                Vec::new()
            }
            state => state.into_rows(),
        };

        let done: HashSet<i64> = rows
            .iter()
            .filter(|r| r.is_done())
            .map(|r| r.index)
            .collect();
        let pending: Vec<&Prompt> = prompts.iter().filter(|p| !done.contains(&p.index)).collect();
        if pending.is_empty() {
            info!(model, "all prompts already answered");
            return Ok(rows);
        }
        info!(model, pending = pending.len(), "collecting responses");

        let total = pending.len();
        let mut fresh = Vec::new();
        for (i, prompt) in pending.into_iter().enumerate() {
            let n = i + 1;
            match self.respond(prompt.index, &prompt.text).await {
                Ok(response) => fresh.push(ResponseRecord {
                    index: prompt.index,
                    prompt: prompt.text.clone(),
                    response: Some(response),
                }),
                Err(err) => {
                    warn!(model, index = prompt.index, error = %err, "response failed; skipping");
                    continue;
                }
            }
            self.log_progress(n, total);
        }

        if fresh.is_empty() {
            warn!(model, "no new responses this run");
            return Ok(rows);
        }
        let added = fresh.len();
        for row in fresh {
            upsert(&mut rows, row);
        }
        let committed = self.ledger.commit(&rows)?;
        info!(model, added, rows = committed.rows.len(), "responses saved");
        Ok(committed.rows)
    }

    /// One unretried generation call, for targeted repair. `None` on failure.
    pub async fn generate_single(&self, index: i64, prompt: &str) -> Option<String> {
        let req = self.request(index, prompt, "collector::repair");
        match self.gateway.chat_once(req).await {
            Ok(resp) if !resp.content.trim().is_empty() => Some(resp.content),
            Ok(_) => {
                warn!(model = %self.label, index, "single generation returned empty text");
                None
            }
            Err(err) => {
                warn!(model = %self.label, index, error = %err, "single generation failed");
                None
            }
        }
    }

    async fn respond(&self, index: i64, prompt: &str) -> Result<String, ProviderError> {
        let req = self.request(index, prompt, "collector::respond");
        let resp = self.gateway.chat(req).await?;
        if resp.content.trim().is_empty() {
            return Err(ProviderError::provider(
                self.model.provider(),
                "empty completion",
                true,
            ));
        }
        Ok(resp.content)
    }

    fn request(&self, index: i64, prompt: &str, caller: &'static str) -> ChatRequest {
        ChatRequest::new(
            self.model.clone(),
            prompts::essay(prompt).to_messages(),
            Attribution::new(caller).with_item(index),
        )
        .temperature(ESSAY_TEMPERATURE)
        .max_tokens(ESSAY_MAX_TOKENS)
    }

    fn log_progress(&self, done: usize, total: usize) {
        if self.throttled {
            let remaining = Duration::from_secs((total - done) as u64 * THROTTLED_SECS_PER_REQUEST);
            info!(
                model = %self.label,
                done,
                total,
                eta_minutes = remaining.as_secs() / 60,
                "collection progress"
            );
        } else if done % PROGRESS_EVERY == 0 || done == total {
            info!(model = %self.label, done, total, "collection progress");
        }
    }
}
