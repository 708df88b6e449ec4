//! Automated judge: single-response scoring and pairwise preference.
//!
//! Two retry layers compose here. The gateway's [`RetryPolicy`] retries
//! failed calls; the judge retries *unacceptable* answers (no extractable
//! number) up to `attempts` times per item.
//!
//! [`RetryPolicy`]: crate::gateway::RetryPolicy

pub mod extract;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest};
use crate::prompts::{self, PromptInstance};

pub use extract::{Extractor, MarkerExtractor, PREFERENCE_MARKER, SCORE_MARKER};

/// Judge sampling temperature.
pub const JUDGE_TEMPERATURE: f32 = 0.1;
/// Extraction attempts per item in batch evaluation.
pub const DEFAULT_ACCEPT_ATTEMPTS: u32 = 3;

const REASON_PREVIEW_CHARS: usize = 100;
const SUCCESS_PREVIEW_CHARS: usize = 50;

pub const EMPTY_RESPONSE_REASON: &str = "response is empty; cannot score";
pub const EMPTY_PAIR_REASON: &str = "at least one response is empty; cannot compare";

fn preview(text: &str, chars: usize) -> String {
    text.chars().take(chars).collect()
}

/// Outcome of judging one item: the value, if any, and the attempt log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Verdict {
    pub value: Option<f64>,
    pub reasons: Vec<String>,
}

impl Verdict {
    fn skipped(reason: &str) -> Self {
        Self {
            value: None,
            reasons: vec![reason.to_string()],
        }
    }

    /// Attempt log as stored in the `all_reasons` column.
    pub fn joined_reasons(&self) -> String {
        self.reasons.join(" | ")
    }

    pub fn is_accepted(&self) -> bool {
        self.value.is_some()
    }
}

/// Which judging task a call performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Score,
    Compare,
}

impl Task {
    fn caller(self) -> &'static str {
        match self {
            Task::Score => "judge::score",
            Task::Compare => "judge::compare",
        }
    }
}

pub struct Judge {
    gateway: Arc<dyn ChatGateway>,
    model: ChatModel,
    score_extractor: Arc<dyn Extractor>,
    preference_extractor: Arc<dyn Extractor>,
    attempts: u32,
}

impl Judge {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: ChatModel) -> Self {
        Self {
            gateway,
            model,
            score_extractor: Arc::new(MarkerExtractor::score()),
            preference_extractor: Arc::new(MarkerExtractor::preference()),
            attempts: DEFAULT_ACCEPT_ATTEMPTS,
        }
    }

    pub fn with_score_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.score_extractor = extractor;
        self
    }

    pub fn with_preference_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.preference_extractor = extractor;
        self
    }

    /// Extraction attempts per item; at least one.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn model(&self) -> &ChatModel {
        &self.model
    }

    /// Score one response, retrying until a score can be extracted.
    pub async fn score(&self, index: i64, prompt: &str, response: Option<&str>) -> Verdict {
        let Some(response) = response else {
            return Verdict::skipped(EMPTY_RESPONSE_REASON);
        };
        let instance = prompts::single_score(prompt, response);
        self.judge_until_accepted(Task::Score, index, &instance).await
    }

    /// Probability (0-100) that `response_a` is the better essay.
    pub async fn compare(
        &self,
        index: i64,
        prompt: &str,
        response_a: Option<&str>,
        response_b: Option<&str>,
    ) -> Verdict {
        let (Some(a), Some(b)) = (response_a, response_b) else {
            return Verdict::skipped(EMPTY_PAIR_REASON);
        };
        let instance = prompts::pairwise(prompt, a, b);
        self.judge_until_accepted(Task::Compare, index, &instance).await
    }

    /// Single-shot scoring for targeted repair: one call, one extraction.
    ///
    /// Always returns an explanatory reason alongside the score.
    pub async fn score_single_response(
        &self,
        index: i64,
        prompt: &str,
        response: Option<&str>,
    ) -> (Option<f64>, String) {
        let Some(response) = response else {
            return (None, EMPTY_RESPONSE_REASON.to_string());
        };
        let instance = prompts::single_score(prompt, response);
        match self.call(Task::Score, index, &instance).await {
            Ok(judgment) => match self.score_extractor.extract(&judgment) {
                Some(score) => (
                    Some(score),
                    format!("scored: {}", preview(&judgment, SUCCESS_PREVIEW_CHARS)),
                ),
                None => (
                    None,
                    format!(
                        "no score in judgment: {}",
                        preview(&judgment, REASON_PREVIEW_CHARS)
                    ),
                ),
            },
            Err(err) => (None, format!("judge call failed: {err}")),
        }
    }

    async fn judge_until_accepted(
        &self,
        task: Task,
        index: i64,
        instance: &PromptInstance,
    ) -> Verdict {
        let extractor = match task {
            Task::Score => &self.score_extractor,
            Task::Compare => &self.preference_extractor,
        };

        let mut verdict = Verdict::default();
        for attempt in 1..=self.attempts {
            match self.call(task, index, instance).await {
                Ok(judgment) => {
                    verdict.reasons.push(format!(
                        "attempt {attempt}: {}",
                        preview(&judgment, REASON_PREVIEW_CHARS)
                    ));
                    verdict.value = extractor.extract(&judgment);
                    if verdict.value.is_some() {
                        break;
                    }
                    debug!(index, attempt, "judge answer had no extractable value");
                }
                Err(err) => {
                    warn!(index, attempt, error = %err, "judge call failed");
                    verdict.reasons.push(format!("attempt {attempt} failed: {err}"));
                }
            }
        }
        verdict
    }

    async fn call(
        &self,
        task: Task,
        index: i64,
        instance: &PromptInstance,
    ) -> Result<String, crate::gateway::ProviderError> {
        let req = ChatRequest::new(
            self.model.clone(),
            instance.to_messages(),
            Attribution::new(task.caller()).with_item(index),
        )
        .temperature(JUDGE_TEMPERATURE);
        Ok(self.gateway.chat(req).await?.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ChatResponse, ProviderError};
    use std::sync::Mutex;

    /// Replays canned answers in order; `None` entries fail the call.
    struct Scripted {
        answers: Mutex<Vec<Option<&'static str>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(answers: Vec<Option<&'static str>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl ChatGateway for Scripted {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            let next = {
                let mut answers = self.answers.lock().unwrap();
                if answers.is_empty() {
                    None
                } else {
                    answers.remove(0)
                }
            };
            next.map(ChatResponse::text)
                .ok_or_else(|| ProviderError::provider("stub", "boom", true))
        }

        async fn chat_once(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.chat(req).await
        }
    }

    fn judge(gateway: Arc<Scripted>) -> Judge {
        Judge::new(gateway, ChatModel::deepseek("deepseek-chat"))
    }

    #[tokio::test]
    async fn score_retries_until_extractable() {
        let gw = Scripted::new(vec![Some("评价：还行"), None, Some("评价：不错\n分数：8.5")]);
        let v = judge(gw.clone()).score(4, "题", Some("文")).await;
        assert_eq!(v.value, Some(8.5));
        assert_eq!(gw.calls(), 3);
        assert_eq!(v.reasons.len(), 3);
        assert!(v.reasons[0].starts_with("attempt 1: "));
        assert!(v.reasons[1].starts_with("attempt 2 failed: "));
        assert!(v.joined_reasons().contains(" | attempt 3: "));
    }

    #[tokio::test]
    async fn score_gives_up_after_three_attempts() {
        let gw = Scripted::new(vec![Some("无分数"); 5]);
        let v = judge(gw.clone()).score(0, "题", Some("文")).await;
        assert_eq!(v.value, None);
        assert_eq!(gw.calls(), 3);
    }

    #[tokio::test]
    async fn empty_response_makes_no_call() {
        let gw = Scripted::new(vec![]);
        let j = judge(gw.clone());
        assert_eq!(j.score(0, "题", None).await.reasons, vec![EMPTY_RESPONSE_REASON]);
        assert_eq!(
            j.compare(0, "题", Some("甲"), None).await.reasons,
            vec![EMPTY_PAIR_REASON]
        );
        let (score, reason) = j.score_single_response(0, "题", None).await;
        assert_eq!(score, None);
        assert_eq!(reason, EMPTY_RESPONSE_REASON);
        assert_eq!(gw.calls(), 0);
    }

    #[tokio::test]
    async fn compare_extracts_preference() {
        let gw = Scripted::new(vec![Some("评价：A更好\n偏好A的概率：70%")]);
        let v = judge(gw).compare(1, "题", Some("甲"), Some("乙")).await;
        assert_eq!(v.value, Some(70.0));
    }

    /// Reads a JSON verdict such as `{"score": 7}` under the given key.
    struct JsonField(&'static str);

    impl Extractor for JsonField {
        fn extract(&self, text: &str) -> Option<f64> {
            serde_json::from_str::<serde_json::Value>(text)
                .ok()?
                .get(self.0)?
                .as_f64()
        }
    }

    #[tokio::test]
    async fn custom_extractors_replace_marker_parsing() {
        let gw = Scripted::new(vec![
            Some("分数：9"),
            Some(r#"{"score": 7}"#),
            Some(r#"{"prefer_a": 35}"#),
            Some(r#"{"score": 6.5}"#),
        ]);
        let j = judge(gw.clone())
            .with_score_extractor(Arc::new(JsonField("score")))
            .with_preference_extractor(Arc::new(JsonField("prefer_a")));

        // The marker line no longer counts; the second attempt is accepted.
        let v = j.score(0, "题", Some("文")).await;
        assert_eq!(v.value, Some(7.0));
        assert_eq!(gw.calls(), 2);

        let v = j.compare(1, "题", Some("甲"), Some("乙")).await;
        assert_eq!(v.value, Some(35.0));

        let (score, reason) = j.score_single_response(2, "题", Some("文")).await;
        assert_eq!(score, Some(6.5));
        assert!(reason.starts_with("scored: "));
    }

    #[tokio::test]
    async fn single_shot_makes_one_call() {
        let gw = Scripted::new(vec![Some("无分数"), Some("分数：9")]);
        let (score, reason) = judge(gw.clone())
            .score_single_response(2, "题", Some("文"))
            .await;
        assert_eq!(score, None);
        assert!(reason.starts_with("no score in judgment: "));
        assert_eq!(gw.calls(), 1);
    }
}
