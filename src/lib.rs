#![forbid(unsafe_code)]

//! # essay-bench
//!
//! Benchmark essay writing across three model sizes with an automated judge.
//!
//! Every model answers every prompt, a judge scores each answer on a 1-10
//! scale and compares the models pairwise, and the results are summarised as
//! win rates and preference distributions. All intermediate results live in
//! CSV ledgers keyed by prompt index, so interrupted runs resume where they
//! stopped and invalid rows can be repaired in place.

pub mod collector;
pub mod config;
pub mod gateway;
pub mod judge;
pub mod ledger;
pub mod pipeline;
pub mod prompts;
pub mod reconcile;
pub mod repair;
pub mod report;
pub mod stats;
pub mod supplier;

pub use collector::ResponseCollector;
pub use config::{ConfigError, DataLayout, ModelRoster, Settings};
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use judge::{Extractor, Judge, MarkerExtractor, Verdict};
pub use ledger::{
    Committed, ComparisonRecord, Ledger, LedgerError, LedgerRow, PairSchema, ResponseRecord,
    ScoreRecord,
};
pub use pipeline::{run_benchmark, Benchmark, BenchmarkSummary, PipelineError};
pub use reconcile::{evaluate_pairwise, evaluate_single_model, Outcome, Reconciled};
pub use repair::{RepairLoop, RepairReport};
pub use report::{MarkdownReportSink, ReportSink};
pub use stats::{ComparisonStats, StatsError};
pub use supplier::{load_prompt_table, EssayPromptGenerator, Prompt, SupplierError};
