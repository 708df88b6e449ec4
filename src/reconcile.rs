//! Batch reconciliation: drive the judge over every unprocessed row of a
//! source table and merge the results into a persisted result table.
//!
//! Single-model scoring and pairwise comparison share one engine,
//! [`reconcile`]. It returns a complete cached table untouched, otherwise
//! evaluates only indices missing from the result table and commits them in
//! one batch.

use std::collections::HashSet;
use std::future::Future;

use tracing::{info, warn};

use crate::judge::Judge;
use crate::ledger::{
    ComparisonRecord, Ledger, LedgerError, LedgerRow, ResponseRecord, ScoreRecord, TableState,
};

const PROGRESS_EVERY: usize = 10;

/// A source row with a stable index.
pub trait Keyed {
    fn key(&self) -> i64;
}

impl Keyed for ResponseRecord {
    fn key(&self) -> i64 {
        self.index
    }
}

/// Both models' responses to one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PairSource {
    pub index: i64,
    pub prompt: String,
    pub response_a: Option<String>,
    pub response_b: Option<String>,
}

impl Keyed for PairSource {
    fn key(&self) -> i64 {
        self.index
    }
}

/// Inner join of two response tables on `index`, in `a`'s row order.
pub fn join_responses(a: &[ResponseRecord], b: &[ResponseRecord]) -> Vec<PairSource> {
    a.iter()
        .filter_map(|ra| {
            let rb = b.iter().find(|rb| rb.index == ra.index)?;
            Some(PairSource {
                index: ra.index,
                prompt: ra.prompt.clone(),
                response_a: ra.response.clone(),
                response_b: rb.response.clone(),
            })
        })
        .collect()
}

/// How a reconciliation pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The persisted table was already complete; nothing was evaluated.
    Cached,
    /// Every source index already had a row; nothing was written.
    UpToDate,
    /// `added` rows were evaluated and committed.
    Committed { added: usize },
}

#[derive(Debug, Clone)]
pub struct Reconciled<R> {
    pub rows: Vec<R>,
    pub outcome: Outcome,
}

impl<R: LedgerRow> Reconciled<R> {
    /// Rows whose key output is present.
    pub fn valid_count(&self) -> usize {
        self.rows.iter().filter(|r| r.is_done()).count()
    }
}

/// Shared reconciliation engine.
///
/// `evaluate` is invoked once per source row whose index has no row in the
/// result table, in source order. `force` only bypasses the cached-table
/// shortcut. A table that fails to parse is returned as an error.
pub async fn reconcile<S, R, F, Fut>(
    ledger: &Ledger<R>,
    label: &str,
    sources: Vec<S>,
    force: bool,
    mut evaluate: F,
) -> Result<Reconciled<R>, LedgerError>
where
    S: Keyed,
    R: LedgerRow,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = R>,
{
    let mut rows = match ledger.load()? {
        TableState::Loaded(rows) if !force && !rows.is_empty() && rows.len() == sources.len() => {
            info!(table = label, rows = rows.len(), "result table complete; using cached copy");
            return Ok(Reconciled {
                rows,
                outcome: Outcome::Cached,
            });
        }
        TableState::Stale {
            row_count,
            missing_columns,
        } => {
            warn!(
                table = label,
                row_count,
                missing = ?missing_columns,
                "result table lacks required columns; regenerating"
            );
            Vec::new()
        }
        state => state.into_rows(),
    };

    let processed: HashSet<i64> = rows.iter().map(|r| r.index()).collect();
    let pending: Vec<S> = sources
        .into_iter()
        .filter(|s| !processed.contains(&s.key()))
        .collect();
    if pending.is_empty() {
        info!(table = label, "every row already evaluated");
        return Ok(Reconciled {
            rows,
            outcome: Outcome::UpToDate,
        });
    }

    let total = pending.len();
    info!(table = label, pending = total, "evaluating");
    let mut fresh = Vec::with_capacity(total);
    for (i, source) in pending.into_iter().enumerate() {
        fresh.push(evaluate(source).await);
        let done = i + 1;
        if done % PROGRESS_EVERY == 0 || done == total {
            info!(table = label, done, total, "evaluation progress");
        }
    }

    let added = fresh.len();
    rows.extend(fresh);
    let committed = ledger.commit(&rows)?;
    let reconciled = Reconciled {
        rows: committed.rows,
        outcome: Outcome::Committed { added },
    };
    info!(
        table = label,
        valid = reconciled.valid_count(),
        rows = reconciled.rows.len(),
        "evaluation saved"
    );
    Ok(reconciled)
}

/// Score every response of one model.
pub async fn evaluate_single_model(
    judge: &Judge,
    ledger: &Ledger<ScoreRecord>,
    model: &str,
    responses: &[ResponseRecord],
    force: bool,
) -> Result<Reconciled<ScoreRecord>, LedgerError> {
    reconcile(ledger, model, responses.to_vec(), force, move |src| async move {
        let verdict = judge
            .score(src.index, &src.prompt, src.response.as_deref())
            .await;
        ScoreRecord {
            index: src.index,
            prompt: src.prompt,
            all_reasons: verdict.joined_reasons(),
            final_score: verdict.value,
            response: src.response,
        }
    })
    .await
}

/// Compare two models' responses prompt by prompt.
///
/// The ledger's schema names the pair; `responses_a` and `responses_b` are
/// joined on `index`.
pub async fn evaluate_pairwise(
    judge: &Judge,
    ledger: &Ledger<ComparisonRecord>,
    responses_a: &[ResponseRecord],
    responses_b: &[ResponseRecord],
    force: bool,
) -> Result<Reconciled<ComparisonRecord>, LedgerError> {
    let pair = ledger.schema();
    let label = format!("{}_vs_{}", pair.a, pair.b);
    let sources = join_responses(responses_a, responses_b);
    reconcile(ledger, &label, sources, force, move |src| async move {
        let verdict = judge
            .compare(
                src.index,
                &src.prompt,
                src.response_a.as_deref(),
                src.response_b.as_deref(),
            )
            .await;
        ComparisonRecord {
            index: src.index,
            prompt: src.prompt,
            all_reasons: verdict.joined_reasons(),
            prefer_a_prob: verdict.value,
            response_a: src.response_a,
            response_b: src.response_b,
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(index: i64, text: Option<&str>) -> ResponseRecord {
        ResponseRecord {
            index,
            prompt: format!("p{index}"),
            response: text.map(str::to_string),
        }
    }

    #[test]
    fn join_keeps_a_order_and_drops_unmatched() {
        let a = vec![resp(2, Some("a2")), resp(0, Some("a0")), resp(5, None)];
        let b = vec![resp(0, Some("b0")), resp(5, Some("b5")), resp(2, None)];
        let joined = join_responses(&a, &b);
        assert_eq!(
            joined.iter().map(|p| p.index).collect::<Vec<_>>(),
            vec![2, 0, 5]
        );
        assert_eq!(joined[0].response_b, None);
        assert_eq!(joined[2].response_a, None);

        let joined = join_responses(&a, &b[..1]);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].index, 0);
    }
}
