//! End-to-end benchmark: collect → score → repair → compare → report.
//!
//! ```bash
//! essay-bench run --data-dir data
//! ```
//!
//! Every stage reads and writes the ledgers under one [`DataLayout`], so any
//! stage can be rerun on its own and resumes from what is already on disk.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::collector::ResponseCollector;
use crate::config::{ConfigError, DataLayout, Settings};
use crate::gateway::UsageSink;
use crate::judge::Judge;
use crate::ledger::{ComparisonRecord, LedgerError, LedgerRow, PairSchema, ResponseRecord, ScoreRecord};
use crate::reconcile::{evaluate_pairwise, evaluate_single_model, Reconciled};
use crate::repair::{RepairLoop, RepairReport, DEFAULT_MAX_ROUNDS, DEFAULT_THROTTLE};
use crate::report::{MarkdownReportSink, ReportError, ReportSink};
use crate::stats::{comparison_stats, ComparisonStats, StatsError};
use crate::supplier::{load_prompt_table, Prompt, SupplierError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Supplier(#[from] SupplierError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("no collector for model {0:?}")]
    UnknownModel(String),
}

/// Final state of one model after scoring and repair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSummary {
    pub model: String,
    pub responses: usize,
    pub missing_responses: usize,
    pub valid_scores: usize,
    pub total_scores: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkSummary {
    pub prompts: usize,
    pub models: Vec<ModelSummary>,
    pub pairs: Vec<ComparisonStats>,
}

pub struct Benchmark {
    layout: DataLayout,
    judge: Judge,
    collectors: Vec<ResponseCollector>,
    sink: Box<dyn ReportSink>,
    repair_rounds: u32,
    repair_throttle: Duration,
}

impl Benchmark {
    /// `collectors` are in roster order; pairs follow that order.
    pub fn new(
        layout: DataLayout,
        judge: Judge,
        collectors: Vec<ResponseCollector>,
        sink: Box<dyn ReportSink>,
    ) -> Self {
        Self {
            layout,
            judge,
            collectors,
            sink,
            repair_rounds: DEFAULT_MAX_ROUNDS,
            repair_throttle: DEFAULT_THROTTLE,
        }
    }

    /// Wire real endpoints for every roster model and the judge.
    pub fn from_settings(settings: &Settings, usage: Arc<dyn UsageSink>) -> Result<Self, PipelineError> {
        let judge = Judge::new(
            Arc::new(settings.judge_gateway(usage.clone())?),
            settings.roster.judge.clone(),
        );
        let collectors = settings
            .roster
            .models
            .iter()
            .map(|spec| {
                let gateway = settings.model_gateway(spec, usage.clone())?;
                Ok::<_, ConfigError>(ResponseCollector::new(
                    spec.label,
                    spec.model.clone(),
                    Arc::new(gateway),
                    settings.layout.responses(spec.label),
                )
                .throttled(spec.quota.is_some()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let sink = Box::new(MarkdownReportSink::new(settings.layout.figures_dir()));
        Ok(Self::new(settings.layout.clone(), judge, collectors, sink))
    }

    pub fn with_repair(mut self, rounds: u32, throttle: Duration) -> Self {
        self.repair_rounds = rounds;
        self.repair_throttle = throttle;
        self
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn labels(&self) -> Vec<&str> {
        self.collectors.iter().map(|c| c.label()).collect()
    }

    /// Every `(earlier, later)` pair of collectors.
    pub fn pairs(&self) -> Vec<PairSchema> {
        PairSchema::all_pairs(&self.labels())
    }

    pub fn collector(&self, label: &str) -> Result<&ResponseCollector, PipelineError> {
        self.collectors
            .iter()
            .find(|c| c.label().eq_ignore_ascii_case(label))
            .ok_or_else(|| PipelineError::UnknownModel(label.to_string()))
    }

    pub fn load_prompts(&self) -> Result<Vec<Prompt>, PipelineError> {
        Ok(load_prompt_table(&self.layout.prompts_path())?)
    }

    pub async fn collect(
        &self,
        label: &str,
        prompts: &[Prompt],
        force: bool,
    ) -> Result<Vec<ResponseRecord>, PipelineError> {
        let collector = self.collector(label)?;
        let rows = collector.process(prompts, force).await?;
        let missing = prompts.len().saturating_sub(rows.iter().filter(|r| r.is_done()).count());
        if missing > 0 {
            warn!(model = collector.label(), missing, "responses missing; repair will retry them");
        }
        Ok(rows)
    }

    pub async fn score(&self, label: &str, force: bool) -> Result<Reconciled<ScoreRecord>, PipelineError> {
        let collector = self.collector(label)?;
        let responses = collector.ledger().load_rows()?;
        let scores = self.layout.scores(collector.label());
        Ok(evaluate_single_model(&self.judge, &scores, collector.label(), &responses, force).await?)
    }

    pub async fn repair(&self, label: &str, prompts: &[Prompt]) -> Result<RepairReport, PipelineError> {
        let collector = self.collector(label)?;
        let scores = self.layout.scores(collector.label());
        let report = RepairLoop::new(collector, &self.judge, &scores)
            .max_rounds(self.repair_rounds)
            .throttle(self.repair_throttle)
            .run(prompts)
            .await?;
        Ok(report)
    }

    pub async fn compare(
        &self,
        pair: &PairSchema,
        force: bool,
    ) -> Result<Reconciled<ComparisonRecord>, PipelineError> {
        let a = self.collector(&pair.a)?.ledger().load_rows()?;
        let b = self.collector(&pair.b)?.ledger().load_rows()?;
        let ledger = self.layout.comparison(pair);
        Ok(evaluate_pairwise(&self.judge, &ledger, &a, &b, force).await?)
    }

    pub fn stats(&self, pair: &PairSchema) -> Result<ComparisonStats, PipelineError> {
        pair_stats(&self.layout, pair)
    }

    pub fn report(&self) -> Result<Vec<ComparisonStats>, PipelineError> {
        render_reports(&self.layout, &self.pairs(), self.sink.as_ref())
    }

    /// Run the whole benchmark over the prompt table.
    pub async fn run(&self, force: bool) -> Result<BenchmarkSummary, PipelineError> {
        let prompts = self.load_prompts()?;
        info!(prompts = prompts.len(), "benchmark starting");

        for label in self.labels() {
            self.collect(label, &prompts, force).await?;
        }

        let mut models = Vec::new();
        for label in self.labels() {
            self.score(label, force).await?;
            self.repair(label, &prompts).await?;

            let responses = self.collector(label)?.ledger().load_rows()?;
            let scores = self.layout.scores(label).load_rows()?;
            let summary = ModelSummary {
                model: label.to_string(),
                responses: responses.iter().filter(|r| r.is_done()).count(),
                missing_responses: prompts
                    .len()
                    .saturating_sub(responses.iter().filter(|r| r.is_done()).count()),
                valid_scores: scores.iter().filter(|r| r.is_done()).count(),
                total_scores: scores.len(),
            };
            info!(
                model = label,
                valid = summary.valid_scores,
                total = summary.total_scores,
                "final valid scores"
            );
            models.push(summary);
        }

        let mut pairs = Vec::new();
        for pair in self.pairs() {
            let compared = self.compare(&pair, force).await?;
            let stats = self.stats(&pair)?;
            info!(
                a = %pair.a,
                b = %pair.b,
                valid = stats.valid_count,
                rows = compared.rows.len(),
                wins_a = stats.wins_a,
                win_rate_a = stats.win_rate_a,
                wins_b = stats.wins_b,
                win_rate_b = stats.win_rate_b,
                ties = stats.ties,
                mean_score_diff = stats.mean_score_diff,
                prefer_a = stats.mean_preference_a,
                "pair compared"
            );
            pairs.push(stats);
        }

        self.report()?;
        info!(root = %self.layout.root().display(), "benchmark finished");
        Ok(BenchmarkSummary {
            prompts: prompts.len(),
            models,
            pairs,
        })
    }
}

/// Statistics for one compared pair. Reads ledgers only; needs no clients.
pub fn pair_stats(layout: &DataLayout, pair: &PairSchema) -> Result<ComparisonStats, PipelineError> {
    Ok(comparison_stats(
        pair,
        &layout.comparison_path(pair),
        &layout.scores_path(&pair.a),
        &layout.scores_path(&pair.b),
    )?)
}

/// Render every pair's distribution and the cross-pair summary.
pub fn render_reports(
    layout: &DataLayout,
    pairs: &[PairSchema],
    sink: &dyn ReportSink,
) -> Result<Vec<ComparisonStats>, PipelineError> {
    let mut all = Vec::new();
    let mut summary = Vec::new();
    for pair in pairs {
        let stats = pair_stats(layout, pair)?;
        let table = layout.comparison(pair).load_rows()?;
        let path = sink.render(&table, pair)?;
        info!(pair = %format!("{}_vs_{}", pair.a, pair.b), path = %path.display(), "distribution rendered");
        summary.push((pair.clone(), stats.mean_preference_a));
        all.push(stats);
    }
    let path = sink.render_summary(&summary)?;
    info!(path = %path.display(), "summary rendered");
    Ok(all)
}

/// Build every client from `settings` and run the full benchmark.
pub async fn run_benchmark(
    settings: &Settings,
    usage: Arc<dyn UsageSink>,
) -> Result<BenchmarkSummary, PipelineError> {
    Benchmark::from_settings(settings, usage)?.run(false).await
}
