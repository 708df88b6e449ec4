//! Win/loss/tie statistics for one model pair.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use crate::ledger::{parse_index, LedgerError, PairSchema, RawTable};

/// Preference value that counts as a tie.
pub const NEUTRAL: f64 = 50.0;

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("comparison table {0} not found; run the comparison first")]
    MissingTable(PathBuf),
    #[error("comparison table {path} lacks column `{column}`; delete the file and rerun")]
    MissingColumn { path: PathBuf, column: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonStats {
    pub model_a: String,
    pub model_b: String,
    /// Rows with a preference value.
    pub valid_count: usize,
    pub wins_a: usize,
    pub wins_b: usize,
    pub ties: usize,
    /// Percentages of `valid_count`.
    pub win_rate_a: f64,
    pub win_rate_b: f64,
    pub tie_rate: f64,
    /// Mean score of A minus mean score of B over indices both scored, 2 dp.
    pub mean_score_diff: f64,
    /// Mean probability (0-100) of preferring A.
    pub mean_preference_a: f64,
    /// Sample standard deviation of the preference values.
    pub preference_std_dev: f64,
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Sample standard deviation; 0 for fewer than two values.
pub fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Compute pair statistics.
///
/// `preferences` are the non-null preference values; `scores_a` and
/// `scores_b` are `(index, score)` pairs with non-null scores.
pub fn compute(
    pair: &PairSchema,
    preferences: &[f64],
    scores_a: &[(i64, f64)],
    scores_b: &[(i64, f64)],
) -> ComparisonStats {
    let valid_count = preferences.len();
    let wins_a = preferences.iter().filter(|p| **p > NEUTRAL).count();
    let wins_b = preferences.iter().filter(|p| **p < NEUTRAL).count();
    let ties = preferences.iter().filter(|p| **p == NEUTRAL).count();

    let (joined_a, joined_b): (Vec<f64>, Vec<f64>) = scores_a
        .iter()
        .filter_map(|(index, a)| {
            scores_b
                .iter()
                .find(|(ib, _)| ib == index)
                .map(|(_, b)| (*a, *b))
        })
        .unzip();
    let diff = if joined_a.is_empty() {
        0.0
    } else {
        mean(&joined_a) - mean(&joined_b)
    };

    ComparisonStats {
        model_a: pair.a.clone(),
        model_b: pair.b.clone(),
        valid_count,
        wins_a,
        wins_b,
        ties,
        win_rate_a: percent(wins_a, valid_count),
        win_rate_b: percent(wins_b, valid_count),
        tie_rate: percent(ties, valid_count),
        mean_score_diff: (diff * 100.0).round() / 100.0,
        mean_preference_a: mean(preferences),
        preference_std_dev: sample_std_dev(preferences),
    }
}

/// Non-null preference values of a comparison table.
///
/// Fails when the preference column is absent, whatever the row count.
pub fn load_preferences(path: &Path, pair: &PairSchema) -> Result<Vec<f64>, StatsError> {
    let raw = RawTable::read(path)?.ok_or_else(|| StatsError::MissingTable(path.to_path_buf()))?;
    let column = pair.preference_column();
    let values = raw.column(&column).ok_or_else(|| StatsError::MissingColumn {
        path: path.to_path_buf(),
        column: column.clone(),
    })?;
    Ok(values
        .into_iter()
        .flatten()
        .filter_map(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .collect())
}

/// `(index, final_score)` pairs with a score; empty when the table is absent.
pub fn load_scores(path: &Path) -> Result<Vec<(i64, f64)>, StatsError> {
    let Some(raw) = RawTable::read(path)? else {
        warn!(path = %path.display(), "score table missing; score difference will be 0");
        return Ok(Vec::new());
    };
    let (Some(indices), Some(scores)) = (raw.column("index"), raw.column("final_score")) else {
        warn!(path = %path.display(), "score table lacks index or final_score");
        return Ok(Vec::new());
    };
    Ok(indices
        .into_iter()
        .zip(scores)
        .filter_map(|(index, score)| {
            let index = parse_index(index?)?;
            let score = score?.parse::<f64>().ok().filter(|s| s.is_finite())?;
            Some((index, score))
        })
        .collect())
}

/// Read the comparison table and both score tables, then compute.
pub fn comparison_stats(
    pair: &PairSchema,
    comparison: &Path,
    scores_a: &Path,
    scores_b: &Path,
) -> Result<ComparisonStats, StatsError> {
    let preferences = load_preferences(comparison, pair)?;
    let a = load_scores(scores_a)?;
    let b = load_scores(scores_b)?;
    Ok(compute(pair, &preferences, &a, &b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pair() -> PairSchema {
        PairSchema::new("7B", "14B")
    }

    #[test]
    fn counts_wins_losses_and_ties() {
        let stats = compute(&pair(), &[70.0, 30.0, 50.0, 90.0], &[], &[]);
        assert_eq!(stats.valid_count, 4);
        assert_eq!(stats.wins_a, 2);
        assert_eq!(stats.wins_b, 1);
        assert_eq!(stats.ties, 1);
        assert_eq!(stats.win_rate_a, 50.0);
        assert_eq!(stats.win_rate_b, 25.0);
        assert_eq!(stats.tie_rate, 25.0);
        assert_eq!(stats.mean_preference_a, 60.0);
        assert_eq!(stats.mean_score_diff, 0.0);
    }

    #[test]
    fn empty_preferences_give_zero_rates() {
        let stats = compute(&pair(), &[], &[], &[]);
        assert_eq!(stats.valid_count, 0);
        assert_eq!(stats.win_rate_a, 0.0);
        assert_eq!(stats.mean_preference_a, 0.0);
        assert_eq!(stats.preference_std_dev, 0.0);
    }

    #[test]
    fn score_diff_uses_inner_join_and_rounds() {
        let a = [(0, 8.0), (1, 7.0), (2, 9.0)];
        let b = [(1, 6.0), (2, 5.333), (9, 1.0)];
        let stats = compute(&pair(), &[60.0], &a, &b);
        // (7 + 9) / 2 - (6 + 5.333) / 2
        assert_eq!(stats.mean_score_diff, 2.33);
    }

    #[test]
    fn std_dev_is_sample() {
        let sd = sample_std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((sd - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
        assert_eq!(sample_std_dev(&[5.0]), 0.0);
    }

    #[test]
    fn missing_preference_column_is_fatal_even_when_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("7B_vs_14B_comparison.csv");
        std::fs::write(&path, "index,prompt,response_7B,response_14B,all_reasons\n").unwrap();
        let err = load_preferences(&path, &pair()).unwrap_err();
        assert!(matches!(err, StatsError::MissingColumn { ref column, .. } if column == "prefer_7B_prob"));
    }

    #[test]
    fn reads_tables_from_disk() {
        let dir = tempdir().unwrap();
        let cmp = dir.path().join("cmp.csv");
        let sa = dir.path().join("a.csv");
        let sb = dir.path().join("b.csv");
        std::fs::write(&cmp, "\u{feff}index,prefer_7B_prob\n0,70\n1,\n2,30\n").unwrap();
        std::fs::write(&sa, "index,final_score\n0,8\n1,\n2,6\n").unwrap();
        std::fs::write(&sb, "index,final_score\n0,7\n2,6\n").unwrap();

        let stats = comparison_stats(&pair(), &cmp, &sa, &sb).unwrap();
        assert_eq!(stats.valid_count, 2);
        assert_eq!(stats.mean_preference_a, 50.0);
        assert_eq!(stats.mean_score_diff, 0.5);
    }
}
