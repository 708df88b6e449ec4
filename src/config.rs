//! Run configuration: credentials, endpoints, the model roster and the
//! on-disk data layout.
//!
//! Secrets come from the environment (optionally a `.env` file). Every client
//! is built explicitly from a [`Settings`] value; nothing is global.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::gateway::{
    ChatModel, EndpointConfig, OpenAiCompatAdapter, ProviderError, ProviderGateway, QuotaConfig,
    QuotaLimiter, RetryPolicy, UsageSink,
};
use crate::ledger::{ComparisonRecord, Ledger, PairSchema, ResponseRecord, ScoreRecord};

pub const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_HF_ROUTER_BASE_URL: &str = "https://router.huggingface.co/v1";
pub const DEFAULT_DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const JUDGE_MODEL: &str = "deepseek-chat";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    MissingKey(&'static str),
    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("unknown model {0:?}; expected one of 7B, 14B, 70B")]
    UnknownModel(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Load `.env` into the process environment if present.
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// =============================================================================
// Credentials
// =============================================================================

#[derive(Clone)]
pub struct Credentials {
    pub deepseek_api_key: String,
    pub hf_token_7b: String,
    pub hf_token_14b: String,
    pub openrouter_api_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let require = |name: &'static str| non_blank(lookup(name)).ok_or(ConfigError::MissingKey(name));
        Ok(Self {
            deepseek_api_key: require("DEEPSEEK_API_KEY")?,
            hf_token_7b: require("HF_TOKEN_7B")?,
            hf_token_14b: require("HF_TOKEN_14B")?,
            openrouter_api_key: require("OPENROUTER_API_KEY")?,
        })
    }
}

// =============================================================================
// Endpoints
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    pub openrouter_base_url: String,
    pub openrouter_referer: Option<String>,
    pub openrouter_title: Option<String>,
    pub hf_router_base_url: String,
    pub deepseek_base_url: String,
    pub timeout: Duration,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            openrouter_base_url: DEFAULT_OPENROUTER_BASE_URL.into(),
            openrouter_referer: None,
            openrouter_title: None,
            hf_router_base_url: DEFAULT_HF_ROUTER_BASE_URL.into(),
            deepseek_base_url: DEFAULT_DEEPSEEK_BASE_URL.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Endpoints {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let timeout = match non_blank(lookup("ESSAY_BENCH_TIMEOUT_SECONDS")) {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .ok_or(ConfigError::Invalid {
                    var: "ESSAY_BENCH_TIMEOUT_SECONDS",
                    value: raw,
                })?,
            None => defaults.timeout,
        };
        Ok(Self {
            openrouter_base_url: non_blank(lookup("OPENROUTER_BASE_URL"))
                .unwrap_or(defaults.openrouter_base_url),
            openrouter_referer: non_blank(lookup("OPENROUTER_HTTP_REFERER")),
            openrouter_title: non_blank(lookup("OPENROUTER_X_TITLE")),
            hf_router_base_url: non_blank(lookup("HF_ROUTER_BASE_URL"))
                .unwrap_or(defaults.hf_router_base_url),
            deepseek_base_url: non_blank(lookup("DEEPSEEK_BASE_URL"))
                .unwrap_or(defaults.deepseek_base_url),
            timeout,
        })
    }
}

// =============================================================================
// Model roster
// =============================================================================

/// One benchmarked model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    /// Short id used in file and column names.
    pub label: &'static str,
    pub model: ChatModel,
    /// Present only for the rate-restricted endpoint.
    pub quota: Option<QuotaConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRoster {
    pub models: Vec<ModelSpec>,
    pub judge: ChatModel,
}

impl Default for ModelRoster {
    fn default() -> Self {
        Self {
            models: vec![
                ModelSpec {
                    label: "7B",
                    model: ChatModel::huggingface("deepseek-ai/DeepSeek-R1-Distill-Qwen-7B:nscale"),
                    quota: None,
                },
                ModelSpec {
                    label: "14B",
                    model: ChatModel::huggingface("deepseek-ai/DeepSeek-R1-Distill-Qwen-14B:novita"),
                    quota: None,
                },
                ModelSpec {
                    label: "70B",
                    model: ChatModel::openrouter("deepseek/deepseek-r1-distill-llama-70b:free"),
                    quota: Some(QuotaConfig::new(15, 45)),
                },
            ],
            judge: ChatModel::deepseek(JUDGE_MODEL),
        }
    }
}

impl ModelRoster {
    pub fn get(&self, label: &str) -> Result<&ModelSpec, ConfigError> {
        self.models
            .iter()
            .find(|m| m.label.eq_ignore_ascii_case(label))
            .ok_or_else(|| ConfigError::UnknownModel(label.to_string()))
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.models.iter().map(|m| m.label).collect()
    }
}

// =============================================================================
// Data layout
// =============================================================================

/// File locations under one data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl Default for DataLayout {
    fn default() -> Self {
        Self::new("data")
    }
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prompts_path(&self) -> PathBuf {
        self.root.join("prompts.csv")
    }

    pub fn generated_prompts_path(&self) -> PathBuf {
        self.root.join("essay_prompts.csv")
    }

    pub fn responses_dir(&self) -> PathBuf {
        self.root.join("model_responses")
    }

    pub fn evaluations_dir(&self) -> PathBuf {
        self.root.join("evaluations")
    }

    pub fn figures_dir(&self) -> PathBuf {
        self.root.join("figures")
    }

    pub fn responses_path(&self, model: &str) -> PathBuf {
        self.responses_dir().join(format!("{model}_responses.csv"))
    }

    pub fn scores_path(&self, model: &str) -> PathBuf {
        self.evaluations_dir().join(format!("{model}_single_scores.csv"))
    }

    pub fn comparison_path(&self, pair: &PairSchema) -> PathBuf {
        self.evaluations_dir()
            .join(format!("{}_vs_{}_comparison.csv", pair.a, pair.b))
    }

    pub fn responses(&self, model: &str) -> Ledger<ResponseRecord> {
        Ledger::new(self.responses_path(model), ())
    }

    pub fn scores(&self, model: &str) -> Ledger<ScoreRecord> {
        Ledger::new(self.scores_path(model), ())
    }

    pub fn comparison(&self, pair: &PairSchema) -> Ledger<ComparisonRecord> {
        Ledger::new(self.comparison_path(pair), pair.clone())
    }
}

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct Settings {
    pub credentials: Credentials,
    pub endpoints: Endpoints,
    pub roster: ModelRoster,
    pub layout: DataLayout,
}

impl Settings {
    pub fn from_env(data_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Ok(Self {
            credentials: Credentials::from_env()?,
            endpoints: Endpoints::from_env()?,
            roster: ModelRoster::default(),
            layout: DataLayout::new(data_dir),
        })
    }

    fn endpoint_for(&self, spec: &ModelSpec) -> EndpointConfig {
        let e = &self.endpoints;
        let config = match (&spec.model, spec.label) {
            (ChatModel::OpenRouter(_), _) => {
                let mut c = EndpointConfig::new(&self.credentials.openrouter_api_key, &e.openrouter_base_url);
                if let Some(referer) = &e.openrouter_referer {
                    c = c.header("HTTP-Referer", referer);
                }
                if let Some(title) = &e.openrouter_title {
                    c = c.header("X-Title", title);
                }
                c
            }
            (ChatModel::DeepSeek(_), _) => {
                EndpointConfig::new(&self.credentials.deepseek_api_key, &e.deepseek_base_url)
            }
            (ChatModel::HuggingFace(_), "14B") => {
                EndpointConfig::new(&self.credentials.hf_token_14b, &e.hf_router_base_url)
            }
            (ChatModel::HuggingFace(_), _) => {
                EndpointConfig::new(&self.credentials.hf_token_7b, &e.hf_router_base_url)
            }
        };
        config.timeout(e.timeout)
    }

    /// Gateway for one benchmarked model, quota-limited when the roster says so.
    pub fn model_gateway(
        &self,
        spec: &ModelSpec,
        usage: Arc<dyn UsageSink>,
    ) -> Result<ProviderGateway, ConfigError> {
        let adapter = OpenAiCompatAdapter::new(self.endpoint_for(spec))?;
        let mut gateway =
            ProviderGateway::new(Arc::new(adapter), usage).with_retry(RetryPolicy::model_call());
        if let Some(quota) = spec.quota {
            gateway = gateway.with_limiter(Arc::new(QuotaLimiter::new(quota)));
        }
        Ok(gateway)
    }

    /// Gateway for the judge (also used for prompt generation).
    pub fn judge_gateway(&self, usage: Arc<dyn UsageSink>) -> Result<ProviderGateway, ConfigError> {
        let spec = ModelSpec {
            label: "judge",
            model: self.roster.judge.clone(),
            quota: None,
        };
        let adapter = OpenAiCompatAdapter::new(self.endpoint_for(&spec))?;
        Ok(ProviderGateway::new(Arc::new(adapter), usage).with_retry(RetryPolicy::judge_call()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn credentials_require_every_key() {
        let err = Credentials::from_lookup(lookup(&[
            ("DEEPSEEK_API_KEY", "ds"),
            ("HF_TOKEN_7B", "h7"),
            ("HF_TOKEN_14B", "  "),
            ("OPENROUTER_API_KEY", "or"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("HF_TOKEN_14B")));

        let creds = Credentials::from_lookup(lookup(&[
            ("DEEPSEEK_API_KEY", "ds"),
            ("HF_TOKEN_7B", "h7"),
            ("HF_TOKEN_14B", "h14"),
            ("OPENROUTER_API_KEY", "or"),
        ]))
        .unwrap();
        assert_eq!(creds.hf_token_14b, "h14");
        assert!(!format!("{creds:?}").contains("h14"));
    }

    #[test]
    fn endpoints_defaults_and_overrides() {
        let e = Endpoints::from_lookup(lookup(&[])).unwrap();
        assert_eq!(e, Endpoints::default());

        let e = Endpoints::from_lookup(lookup(&[
            ("OPENROUTER_BASE_URL", "http://localhost:9000"),
            ("OPENROUTER_X_TITLE", "essay-bench"),
            ("ESSAY_BENCH_TIMEOUT_SECONDS", "30"),
        ]))
        .unwrap();
        assert_eq!(e.openrouter_base_url, "http://localhost:9000");
        assert_eq!(e.openrouter_title.as_deref(), Some("essay-bench"));
        assert_eq!(e.timeout, Duration::from_secs(30));

        assert!(Endpoints::from_lookup(lookup(&[("ESSAY_BENCH_TIMEOUT_SECONDS", "soon")])).is_err());
    }

    #[test]
    fn roster_pairs_follow_roster_order() {
        let roster = ModelRoster::default();
        let pairs: Vec<(String, String)> = PairSchema::all_pairs(&roster.labels())
            .into_iter()
            .map(|p| (p.a, p.b))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("7B".to_string(), "14B".to_string()),
                ("7B".to_string(), "70B".to_string()),
                ("14B".to_string(), "70B".to_string()),
            ]
        );
        assert!(roster.get("70b").unwrap().quota.is_some());
        assert!(roster.get("7B").unwrap().quota.is_none());
        assert!(roster.get("3B").is_err());
    }

    #[test]
    fn layout_paths() {
        let layout = DataLayout::new("/tmp/d");
        let pair = PairSchema::new("7B", "70B");
        assert_eq!(
            layout.responses_path("14B"),
            PathBuf::from("/tmp/d/model_responses/14B_responses.csv")
        );
        assert_eq!(
            layout.scores_path("7B"),
            PathBuf::from("/tmp/d/evaluations/7B_single_scores.csv")
        );
        assert_eq!(
            layout.comparison_path(&pair),
            PathBuf::from("/tmp/d/evaluations/7B_vs_70B_comparison.csv")
        );
    }
}
