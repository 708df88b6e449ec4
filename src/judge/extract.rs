//! Pull a number out of a judge's free-text verdict.

/// Marker preceding the 1-10 score in a single-response verdict.
pub const SCORE_MARKER: &str = "分数：";
/// Marker preceding the 0-100 preference for response A.
pub const PREFERENCE_MARKER: &str = "偏好A的概率：";

/// Strategy for turning judge output into a number.
pub trait Extractor: Send + Sync {
    fn extract(&self, text: &str) -> Option<f64>;
}

/// Reads the value after the last occurrence of a fixed marker.
///
/// The value runs up to the first line break or percent sign and must parse
/// as a finite float; anything else yields `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerExtractor {
    marker: &'static str,
}

impl MarkerExtractor {
    pub const fn new(marker: &'static str) -> Self {
        Self { marker }
    }

    pub const fn score() -> Self {
        Self::new(SCORE_MARKER)
    }

    pub const fn preference() -> Self {
        Self::new(PREFERENCE_MARKER)
    }

    pub fn marker(&self) -> &'static str {
        self.marker
    }
}

impl Extractor for MarkerExtractor {
    fn extract(&self, text: &str) -> Option<f64> {
        let (_, tail) = text.rsplit_once(self.marker)?;
        let tail = tail.trim_start();
        let end = tail
            .find(|c| matches!(c, '\n' | '\r' | '%' | '％'))
            .unwrap_or(tail.len());
        tail[..end]
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
    }
}
