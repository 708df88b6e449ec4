//! Report rendering for finished comparison tables.
//!
//! Renders text charts as markdown: a preference histogram per model pair
//! and one summary of mean preferences across pairs.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::ledger::{ComparisonRecord, PairSchema};
use crate::stats::{mean, sample_std_dev, NEUTRAL};

pub const HISTOGRAM_BINS: usize = 20;
const BAR_WIDTH: usize = 40;
const SUMMARY_STEM: &str = "model_preference_summary";

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Consumes finished tables and writes report artifacts.
pub trait ReportSink: Send + Sync {
    /// Render one pair's preference distribution. Returns the artifact path.
    fn render(&self, table: &[ComparisonRecord], pair: &PairSchema) -> Result<PathBuf, ReportError>;

    /// Render mean preference for A across pairs. Returns the artifact path.
    fn render_summary(&self, summary: &[(PairSchema, f64)]) -> Result<PathBuf, ReportError>;
}

/// Distribution statistics for one pair's preference values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionSummary {
    pub count: usize,
    pub mean: f64,
    /// Percent of values above, below, and at 50.
    pub share_prefer_a: f64,
    pub share_prefer_b: f64,
    pub share_neutral: f64,
    pub std_dev: f64,
}

impl DistributionSummary {
    pub fn from_values(values: &[f64]) -> Self {
        let share = |pred: fn(f64) -> bool| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().filter(|v| pred(**v)).count() as f64 / values.len() as f64 * 100.0
            }
        };
        Self {
            count: values.len(),
            mean: mean(values),
            share_prefer_a: share(|v| v > NEUTRAL),
            share_prefer_b: share(|v| v < NEUTRAL),
            share_neutral: share(|v| v == NEUTRAL),
            std_dev: sample_std_dev(values),
        }
    }
}

/// Counts per 5-point bin over `[0, 100]`; 100 falls in the last bin.
pub fn histogram(values: &[f64]) -> [usize; HISTOGRAM_BINS] {
    let mut bins = [0; HISTOGRAM_BINS];
    let width = 100.0 / HISTOGRAM_BINS as f64;
    for v in values {
        let bin = ((v.clamp(0.0, 100.0) / width) as usize).min(HISTOGRAM_BINS - 1);
        bins[bin] += 1;
    }
    bins
}

fn bar(count: usize, max: usize) -> String {
    if max == 0 || count == 0 {
        return String::new();
    }
    let len = (count * BAR_WIDTH).div_ceil(max);
    "█".repeat(len)
}

pub fn render_distribution_markdown(table: &[ComparisonRecord], pair: &PairSchema) -> String {
    let values: Vec<f64> = table.iter().filter_map(|r| r.prefer_a_prob).collect();
    let bins = histogram(&values);
    let max = bins.iter().copied().max().unwrap_or(0);
    let width = 100 / HISTOGRAM_BINS;
    let neutral_bin = (NEUTRAL as usize / width).min(HISTOGRAM_BINS - 1);
    let summary = DistributionSummary::from_values(&values);

    let mut out = String::new();
    out.push_str(&format!("# {} vs {} preference distribution\n\n", pair.a, pair.b));
    out.push_str(&format!("Probability of preferring {} (%), per prompt.\n\n", pair.a));
    out.push_str("```text\n");
    for (i, count) in bins.iter().enumerate() {
        let lo = i * width;
        let marker = if i == neutral_bin { "  <- neutral (50%)" } else { "" };
        out.push_str(&format!(
            "{:>3}-{:<3} | {:<w$} {}{}\n",
            lo,
            lo + width,
            bar(*count, max),
            count,
            marker,
            w = BAR_WIDTH
        ));
    }
    out.push_str("```\n\n");

    out.push_str("## Summary\n\n");
    out.push_str(&format!("- Valid comparisons: {}\n", summary.count));
    out.push_str(&format!("- Mean preference for {}: {:.2}%\n", pair.a, summary.mean));
    out.push_str(&format!("- Prefer {} (>50%): {:.2}%\n", pair.a, summary.share_prefer_a));
    out.push_str(&format!("- Prefer {} (<50%): {:.2}%\n", pair.b, summary.share_prefer_b));
    out.push_str(&format!("- Neutral (=50%): {:.2}%\n", summary.share_neutral));
    out.push_str(&format!("- Standard deviation: {:.2}\n", summary.std_dev));
    out
}

pub fn render_summary_markdown(summary: &[(PairSchema, f64)]) -> String {
    let mut out = String::new();
    out.push_str("# Mean preference for the first model\n\n");
    out.push_str("Neutral point is 50%.\n\n");
    out.push_str("```text\n");
    for (pair, mean) in summary {
        let len = ((mean.clamp(0.0, 100.0) / 100.0) * BAR_WIDTH as f64).round() as usize;
        out.push_str(&format!(
            "{:<12} | {:<w$} {:.1}%\n",
            format!("{} vs {}", pair.a, pair.b),
            "█".repeat(len),
            mean,
            w = BAR_WIDTH
        ));
    }
    out.push_str("```\n");
    out
}

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    model_a: &'a str,
    model_b: &'a str,
    mean_preference_a: String,
}

/// Writes markdown charts under a figures directory.
#[derive(Debug, Clone)]
pub struct MarkdownReportSink {
    figures_dir: PathBuf,
}

impl MarkdownReportSink {
    pub fn new(figures_dir: impl Into<PathBuf>) -> Self {
        Self {
            figures_dir: figures_dir.into(),
        }
    }

    pub fn distribution_path(&self, pair: &PairSchema) -> PathBuf {
        self.figures_dir
            .join(format!("{}_vs_{}_distribution.md", pair.a, pair.b))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.figures_dir.join(format!("{SUMMARY_STEM}.md"))
    }

    pub fn summary_csv_path(&self) -> PathBuf {
        self.figures_dir.join(format!("{SUMMARY_STEM}.csv"))
    }

    fn write(&self, path: &Path, content: &str) -> Result<(), ReportError> {
        fs::create_dir_all(&self.figures_dir).map_err(|source| ReportError::Io {
            path: self.figures_dir.clone(),
            source,
        })?;
        fs::write(path, content).map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ReportSink for MarkdownReportSink {
    fn render(&self, table: &[ComparisonRecord], pair: &PairSchema) -> Result<PathBuf, ReportError> {
        let path = self.distribution_path(pair);
        self.write(&path, &render_distribution_markdown(table, pair))?;
        Ok(path)
    }

    fn render_summary(&self, summary: &[(PairSchema, f64)]) -> Result<PathBuf, ReportError> {
        let path = self.summary_path();
        self.write(&path, &render_summary_markdown(summary))?;

        let csv_path = self.summary_csv_path();
        let mut writer = csv::Writer::from_path(&csv_path)?;
        for (pair, mean) in summary {
            writer.serialize(SummaryRow {
                model_a: &pair.a,
                model_b: &pair.b,
                mean_preference_a: format!("{mean:.1}"),
            })?;
        }
        writer.flush().map_err(|source| ReportError::Io {
            path: csv_path,
            source,
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(index: i64, prob: Option<f64>) -> ComparisonRecord {
        ComparisonRecord {
            index,
            prompt: "p".into(),
            response_a: Some("a".into()),
            response_b: Some("b".into()),
            prefer_a_prob: prob,
            all_reasons: String::new(),
        }
    }

    #[test]
    fn histogram_bins_edges() {
        let bins = histogram(&[0.0, 4.9, 5.0, 50.0, 99.0, 100.0]);
        assert_eq!(bins[0], 2);
        assert_eq!(bins[1], 1);
        assert_eq!(bins[10], 1);
        assert_eq!(bins[19], 2);
        assert_eq!(bins.iter().sum::<usize>(), 6);
    }

    #[test]
    fn distribution_summary_shares() {
        let s = DistributionSummary::from_values(&[70.0, 30.0, 50.0, 90.0]);
        assert_eq!(s.count, 4);
        assert_eq!(s.mean, 60.0);
        assert_eq!(s.share_prefer_a, 50.0);
        assert_eq!(s.share_prefer_b, 25.0);
        assert_eq!(s.share_neutral, 25.0);
    }

    #[test]
    fn render_writes_distribution_and_summary() {
        let dir = tempdir().unwrap();
        let sink = MarkdownReportSink::new(dir.path().join("figures"));
        let pair = PairSchema::new("7B", "14B");
        let table = vec![record(0, Some(70.0)), record(1, None), record(2, Some(30.0))];

        let path = sink.render(&table, &pair).unwrap();
        assert!(path.ends_with("7B_vs_14B_distribution.md"));
        let md = std::fs::read_to_string(&path).unwrap();
        assert!(md.contains("# 7B vs 14B preference distribution"));
        assert!(md.contains("- Valid comparisons: 2"));
        assert!(md.contains("<- neutral (50%)"));

        let summary = vec![(pair.clone(), 62.54), (PairSchema::new("7B", "70B"), 40.0)];
        let path = sink.render_summary(&summary).unwrap();
        let md = std::fs::read_to_string(path).unwrap();
        assert!(md.contains("62.5%"));
        let csv = std::fs::read_to_string(sink.summary_csv_path()).unwrap();
        assert_eq!(
            csv,
            "model_a,model_b,mean_preference_a\n7B,14B,62.5\n7B,70B,40.0\n"
        );
    }
}
