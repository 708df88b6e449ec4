//! Targeted repair of null scores.
//!
//! Each round reloads the score table, and for every row without a score
//! regenerates the response if it is missing, then re-scores it with a single
//! judge call. Both tables are committed after every row so a crash loses at
//! most one item. Rounds stop early once no invalid rows remain.

use std::time::Duration;

use tracing::{info, warn};

use crate::collector::ResponseCollector;
use crate::judge::Judge;
use crate::ledger::{upsert, Ledger, LedgerError, ResponseRecord, ScoreRecord};
use crate::supplier::Prompt;

pub const DEFAULT_MAX_ROUNDS: u32 = 3;
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("no prompt with index {0}")]
    UnknownPrompt(i64),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Summary of one repair run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub rounds: u32,
    /// Invalid rows found at the start of each round that ran.
    pub invalid_per_round: Vec<usize>,
    /// Rows that gained a score.
    pub repaired: usize,
    /// Invalid rows left in the re-read table.
    pub remaining_invalid: usize,
    pub total: usize,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.remaining_invalid == 0
    }
}

pub struct RepairLoop<'a> {
    collector: &'a ResponseCollector,
    judge: &'a Judge,
    scores: &'a Ledger<ScoreRecord>,
    max_rounds: u32,
    throttle: Duration,
}

impl<'a> RepairLoop<'a> {
    pub fn new(
        collector: &'a ResponseCollector,
        judge: &'a Judge,
        scores: &'a Ledger<ScoreRecord>,
    ) -> Self {
        Self {
            collector,
            judge,
            scores,
            max_rounds: DEFAULT_MAX_ROUNDS,
            throttle: DEFAULT_THROTTLE,
        }
    }

    pub fn max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    /// Pause between rounds.
    pub fn throttle(mut self, pause: Duration) -> Self {
        self.throttle = pause;
        self
    }

    pub async fn run(&self, prompts: &[Prompt]) -> Result<RepairReport, LedgerError> {
        let model = self.collector.label();
        let mut report = RepairReport {
            rounds: 0,
            invalid_per_round: Vec::new(),
            repaired: 0,
            remaining_invalid: 0,
            total: 0,
        };

        while report.rounds < self.max_rounds {
            let mut scores = self.scores.load_rows()?;
            let invalid: Vec<i64> = scores
                .iter()
                .filter(|r| r.final_score.is_none())
                .map(|r| r.index)
                .collect();
            if invalid.is_empty() {
                info!(model, "all scores valid; nothing to repair");
                break;
            }

            let round = report.rounds + 1;
            info!(model, round, invalid = invalid.len(), "repair round");
            report.invalid_per_round.push(invalid.len());

            let mut responses = self.collector.ledger().load_rows()?;
            let mut fixed = 0;
            for &index in &invalid {
                match self
                    .repair_one(index, prompts, &mut responses, &mut scores)
                    .await
                {
                    Ok(true) => fixed += 1,
                    Ok(false) => {}
                    Err(err) => warn!(model, index, error = %err, "repair failed; skipping"),
                }
            }
            info!(model, round, fixed, invalid = invalid.len(), "repair round done");
            report.repaired += fixed;
            report.rounds = round;

            if report.rounds < self.max_rounds && !self.throttle.is_zero() {
                tokio::time::sleep(self.throttle).await;
            }
        }

        let final_scores = self.scores.load_rows()?;
        report.total = final_scores.len();
        report.remaining_invalid = final_scores
            .iter()
            .filter(|r| r.final_score.is_none())
            .count();
        info!(
            model,
            remaining_invalid = report.remaining_invalid,
            total = report.total,
            "repair finished"
        );
        Ok(report)
    }

    /// Repair one index. Returns whether it now has a score.
    async fn repair_one(
        &self,
        index: i64,
        prompts: &[Prompt],
        responses: &mut Vec<ResponseRecord>,
        scores: &mut Vec<ScoreRecord>,
    ) -> Result<bool, RepairError> {
        let model = self.collector.label();
        let prompt = prompts
            .iter()
            .find(|p| p.index == index)
            .ok_or(RepairError::UnknownPrompt(index))?;

        let has_response = responses
            .iter()
            .any(|r| r.index == index && r.response.is_some());
        if !has_response {
            info!(model, index, "regenerating missing response");
            if let Some(text) = self.collector.generate_single(index, &prompt.text).await {
                upsert(
                    responses,
                    ResponseRecord {
                        index,
                        prompt: prompt.text.clone(),
                        response: Some(text),
                    },
                );
                *responses = self.collector.ledger().commit(responses)?.rows;
            }
        }

        let Some(current) = responses
            .iter()
            .find(|r| r.index == index)
            .and_then(|r| r.response.clone())
        else {
            info!(model, index, "response still missing; skipping score");
            return Ok(false);
        };

        let (score, reason) = self
            .judge
            .score_single_response(index, &prompt.text, Some(&current))
            .await;
        upsert(
            scores,
            ScoreRecord {
                index,
                prompt: prompt.text.clone(),
                response: Some(current),
                final_score: score,
                all_reasons: reason,
            },
        );
        *scores = self.scores.commit(scores)?.rows;
        Ok(score.is_some())
    }
}
