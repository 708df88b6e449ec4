//! Prompt supply: loading the benchmark's prompt table and generating
//! fresh essay topics with a generator model.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest};
use crate::ledger::{parse_index, Ledger, LedgerError, LedgerRow, RawTable, RowFields, TableState};
use crate::prompts::{self, PromptInstance};

pub const FIRST_PASS_TEMPERATURE: f32 = 0.8;
pub const TOP_UP_TEMPERATURE: f32 = 0.9;

/// Strict top-up rounds before one relaxed round.
const MAX_TOP_UPS: usize = 5;
const MIN_TOPIC_CHARS: usize = 5;
const TOKENS_PER_TOPIC: u32 = 50;
const FIRST_PASS_MAX_TOKENS: u32 = 4000;
const TOP_UP_MAX_TOKENS: u32 = 2000;
const KEYWORD_SOURCE_PROMPTS: usize = 20;
const KEYWORDS_PER_PROMPT: usize = 5;
const MAX_KEYWORDS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum SupplierError {
    #[error("prompt table {0} is missing or empty")]
    Missing(PathBuf),
    #[error("prompt table {0} has no `prompt` column")]
    NoPromptColumn(PathBuf),
    #[error("prompt table {path} row {row}: invalid index {value:?}")]
    BadIndex {
        path: PathBuf,
        row: usize,
        value: String,
    },
    #[error("generator produced no usable prompts")]
    NothingGenerated,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

// =============================================================================
// Prompt table
// =============================================================================

/// One essay topic with its stable index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub index: i64,
    pub text: String,
}

impl Prompt {
    pub fn new(index: i64, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }
}

impl LedgerRow for Prompt {
    type Schema = ();

    fn columns(_: &()) -> Vec<String> {
        vec!["index".into(), "prompt".into()]
    }

    fn index(&self) -> i64 {
        self.index
    }

    fn is_done(&self) -> bool {
        true
    }

    fn to_fields(&self, _: &()) -> Vec<String> {
        vec![self.index.to_string(), self.text.clone()]
    }

    fn from_fields(_: &(), index: i64, f: &RowFields<'_>) -> Self {
        Self::new(index, f.get("prompt").unwrap_or_default())
    }
}

/// Load the benchmark prompt table.
///
/// The table must exist, be non-empty and have a `prompt` column. When it
/// has no `index` column, indices are assigned by row position.
pub fn load_prompt_table(path: &Path) -> Result<Vec<Prompt>, SupplierError> {
    let raw = match RawTable::read(path)? {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Err(SupplierError::Missing(path.to_path_buf())),
    };
    let Some(texts) = raw.column("prompt") else {
        return Err(SupplierError::NoPromptColumn(path.to_path_buf()));
    };

    let prompts = match raw.column("index") {
        Some(indices) => indices
            .iter()
            .zip(texts)
            .enumerate()
            .map(|(row, (index, text))| {
                let index = index.and_then(parse_index).ok_or_else(|| SupplierError::BadIndex {
                    path: path.to_path_buf(),
                    row: row + 1,
                    value: index.unwrap_or_default().to_string(),
                })?;
                Ok::<_, SupplierError>(Prompt::new(index, text.unwrap_or_default()))
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| Prompt::new(i as i64, text.unwrap_or_default()))
            .collect(),
    };

    info!(path = %path.display(), prompts = prompts.len(), "loaded prompt table");
    Ok(prompts)
}

// =============================================================================
// Generator
// =============================================================================

/// Generates essay topics and persists them as an `index, prompt` table.
pub struct EssayPromptGenerator {
    gateway: Arc<dyn ChatGateway>,
    model: ChatModel,
    ledger: Ledger<Prompt>,
}

impl EssayPromptGenerator {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: ChatModel, output: impl Into<PathBuf>) -> Self {
        Self {
            gateway,
            model,
            ledger: Ledger::new(output, ()),
        }
    }

    pub fn output_path(&self) -> &Path {
        self.ledger.path()
    }

    /// Reuse a valid generated table, otherwise generate `count` new prompts.
    pub async fn load(&self, count: usize) -> Result<Vec<Prompt>, SupplierError> {
        match self.ledger.load() {
            Ok(TableState::Loaded(rows)) if !rows.is_empty() => {
                info!(prompts = rows.len(), "reusing generated prompts");
                return Ok(rows);
            }
            Ok(_) => info!("no usable generated prompts; generating"),
            Err(err) => warn!(error = %err, "generated prompt table unreadable; regenerating"),
        }
        self.generate(count).await
    }

    /// Generate exactly `count` prompts, topping up and deduplicating as needed.
    pub async fn generate(&self, count: usize) -> Result<Vec<Prompt>, SupplierError> {
        let first_pass = count * 6 / 5;
        let mut topics = self
            .batch(
                prompts::generate_topics(first_pass),
                FIRST_PASS_TEMPERATURE,
                FIRST_PASS_MAX_TOKENS.min((first_pass as u32).saturating_mul(TOKENS_PER_TOPIC)),
            )
            .await;
        dedupe(&mut topics);

        let mut round = 0;
        while topics.len() < count && round < MAX_TOP_UPS {
            let need = count - topics.len();
            info!(need, round = round + 1, max_rounds = MAX_TOP_UPS, "topping up prompts");
            let more = self.top_up(need, &topics, true).await;
            topics.extend(more);
            dedupe(&mut topics);
            round += 1;
        }

        if topics.len() < count {
            info!(need = count - topics.len(), "strict top-ups fell short; relaxing");
            let more = self.top_up(count - topics.len(), &topics, false).await;
            topics.extend(more);
            dedupe(&mut topics);
        }
        topics.truncate(count);

        if topics.is_empty() && count > 0 {
            return Err(SupplierError::NothingGenerated);
        }
        if topics.len() < count {
            let unique = topics.len();
            let mut i = 0;
            while topics.len() < count {
                topics.push(topics[i % unique].clone());
                i += 1;
            }
            warn!(unique, total = count, "padded prompts with repeats");
        }

        let rows: Vec<Prompt> = topics
            .into_iter()
            .enumerate()
            .map(|(i, text)| Prompt::new(i as i64, text))
            .collect();
        let committed = self.ledger.commit(&rows)?;
        info!(
            prompts = committed.rows.len(),
            path = %self.ledger.path().display(),
            "saved generated prompts"
        );
        Ok(committed.rows)
    }

    async fn top_up(&self, need: usize, existing: &[String], strict: bool) -> Vec<String> {
        let keywords = recent_keywords(existing);
        self.batch(
            prompts::top_up_topics(need, &keywords, strict),
            TOP_UP_TEMPERATURE,
            TOP_UP_MAX_TOKENS.min((need as u32).saturating_mul(TOKENS_PER_TOPIC)),
        )
        .await
    }

    /// One generation call; a failed call yields an empty batch.
    async fn batch(&self, instance: PromptInstance, temperature: f32, max_tokens: u32) -> Vec<String> {
        let req = ChatRequest::new(
            self.model.clone(),
            instance.to_messages(),
            Attribution::new("supplier::generate"),
        )
        .temperature(temperature)
        .max_tokens(max_tokens.max(1));

        match self.gateway.chat(req).await {
            Ok(resp) => parse_topics(&resp.content),
            Err(err) => {
                warn!(error = %err, template = instance.template_slug, "prompt generation call failed");
                Vec::new()
            }
        }
    }
}

/// One topic per non-blank line of at least five characters.
fn parse_topics(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.chars().count() >= MIN_TOPIC_CHARS)
        .map(str::to_string)
        .collect()
}

/// Leading words of the most recent prompts, deduplicated.
fn recent_keywords(existing: &[String]) -> Vec<String> {
    let start = existing.len().saturating_sub(KEYWORD_SOURCE_PROMPTS);
    let mut seen = HashSet::new();
    existing[start..]
        .iter()
        .flat_map(|p| p.split_whitespace().take(KEYWORDS_PER_PROMPT))
        .filter(|w| seen.insert(*w))
        .take(MAX_KEYWORDS)
        .map(str::to_string)
        .collect()
}

/// Drop repeated entries, keeping first occurrences in order.
fn dedupe(items: &mut Vec<String>) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}
