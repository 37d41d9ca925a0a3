use std::{env, path::PathBuf, time::Duration};

use config::{Config, Environment, File};
use lib_utils::RetryPolicy;
use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmartSkip {
    /// Always escalate to OCR unless the native accept threshold is met.
    #[default]
    Disabled,
    /// Skip OCR when native extraction produced more than a few characters.
    SkipIfAnyText,
    /// Skip OCR unless native extraction produced nothing at all.
    #[serde(rename = "skip_if_nonempty", alias = "skip_if_non_empty")]
    SkipIfNonEmpty,
}

impl SmartSkip {
    pub fn should_skip_ocr(&self, native_chars: usize, few_chars: usize) -> bool {
        match self {
            SmartSkip::Disabled => false,
            SmartSkip::SkipIfAnyText => native_chars > few_chars,
            SmartSkip::SkipIfNonEmpty => native_chars > 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub char_cap: usize,
    /// `None` never accepts native text early, every document escalates to OCR.
    pub native_accept_threshold: Option<usize>,
    pub smart_skip: SmartSkip,
    pub smart_skip_min_chars: usize,
    pub cloud_ocr_enabled: bool,
    /// Local OCR replaces the cloud tier.
    pub prefer_local_ocr: bool,
    /// Local OCR runs after a failed cloud call.
    pub local_fallback_on_cloud_error: bool,
    pub max_attachment_bytes: usize,
    pub render_dpi: u32,
    pub tesseract_lang: String,
    pub tesseract_psm: u8,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            char_cap: 20_000,
            native_accept_threshold: None,
            smart_skip: SmartSkip::Disabled,
            smart_skip_min_chars: 20,
            cloud_ocr_enabled: true,
            prefer_local_ocr: false,
            local_fallback_on_cloud_error: false,
            max_attachment_bytes: 20 * 1024 * 1024,
            render_dpi: 144,
            tesseract_lang: "eng".to_string(),
            tesseract_psm: 6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub cloud_ocr: usize,
    /// Defaults to twice the available cores, capped at 12.
    pub local_ocr: Option<usize>,
    pub classification: usize,
    pub extraction_threads: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            cloud_ocr: 10,
            local_ocr: None,
            classification: 5,
            extraction_threads: 16,
        }
    }
}

impl ConcurrencyConfig {
    pub fn local_ocr_workers(&self) -> usize {
        self.local_ocr.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            (cores * 2).min(12)
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub small_max_tokens: usize,
    pub medium_max_tokens: usize,
    pub small_batch_items: usize,
    pub medium_batch_items: usize,
    pub large_batch_items: usize,
    pub small_batch_tokens: usize,
    pub medium_batch_tokens: usize,
    pub large_batch_tokens: Option<usize>,
    pub max_thread_chars: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            small_max_tokens: 5_000,
            medium_max_tokens: 15_000,
            small_batch_items: 10,
            medium_batch_items: 3,
            large_batch_items: 1,
            small_batch_tokens: 10_000,
            medium_batch_tokens: 40_000,
            large_batch_tokens: None,
            max_thread_chars: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelevanceConfig {
    pub enabled: bool,
    pub prefix_chars: usize,
    pub group_size: usize,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix_chars: 1_000,
            group_size: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub pipeline_id: String,
    pub budget_ms: u64,
    pub retry_ceiling: u32,
    pub classification_timeout_ms: u64,
    pub ocr_timeout_ms: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            pipeline_id: "default".to_string(),
            budget_ms: 13 * 60 * 1000,
            retry_ceiling: 5,
            classification_timeout_ms: 120_000,
            ocr_timeout_ms: 90_000,
        }
    }
}

impl OrchestrationConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }

    pub fn classification_timeout(&self) -> Duration {
        Duration::from_millis(self.classification_timeout_ms)
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_millis(self.ocr_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BucketLimits {
    pub max: usize,
    pub refill_interval_ms: usize,
    pub refill_amount: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(skip)]
    pub key: String,
    pub chat_model: String,
    pub relevance_model: String,
    pub ocr_model: String,
    pub temperature: f64,
    pub prompt_limits: BucketLimits,
    pub token_limits: BucketLimits,
    pub ocr_page_limits: BucketLimits,
}

impl Default for BucketLimits {
    fn default() -> Self {
        Self {
            max: 5,
            refill_interval_ms: 1_000,
            refill_amount: 1,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.mistral.ai".to_string(),
            key: String::new(),
            chat_model: "mistral-small-latest".to_string(),
            relevance_model: "mistral-small-latest".to_string(),
            ocr_model: "mistral-ocr-latest".to_string(),
            temperature: 0.0,
            prompt_limits: BucketLimits::default(),
            token_limits: BucketLimits {
                max: 500_000,
                refill_interval_ms: 1_000,
                refill_amount: 8_000,
            },
            ocr_page_limits: BucketLimits {
                max: 10,
                refill_interval_ms: 1_000,
                refill_amount: 2,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            prefix: "pipelines/default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Pub/Sub topic for re-invocation. Unset means the signal is only logged.
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub extraction: ExtractionConfig,
    pub concurrency: ConcurrencyConfig,
    pub batching: BatchingConfig,
    pub relevance: RelevanceConfig,
    pub orchestration: OrchestrationConfig,
    pub retry: RetryConfig,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub signal: SignalConfig,
}

impl PipelineConfig {
    /// `APP_DIR/config/config.toml` (optional), then `DOCSIFT__SECTION__KEY` env overrides.
    pub fn load() -> PipelineResult<Self> {
        let root = env::var("APP_DIR").unwrap_or_else(|_| ".".to_string());
        let path = format!("{root}/config/config");

        let mut cfg: PipelineConfig = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("DOCSIFT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        cfg.api.key = env::var("MISTRAL_API_KEY").unwrap_or_default();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let b = &self.batching;
        let mut problems = vec![];

        if b.small_max_tokens > b.small_batch_tokens {
            problems.push("small tier threshold exceeds its batch token budget");
        }
        if b.medium_max_tokens > b.medium_batch_tokens {
            problems.push("medium tier threshold exceeds its batch token budget");
        }
        if b.small_max_tokens > b.medium_max_tokens {
            problems.push("small tier threshold exceeds medium tier threshold");
        }
        if b.small_batch_items == 0 || b.medium_batch_items == 0 || b.large_batch_items == 0 {
            problems.push("tier item caps must be at least 1");
        }
        if let Some(large) = b.large_batch_tokens {
            if large < b.medium_max_tokens {
                problems.push("large tier budget is smaller than the large tier threshold");
            }
        }
        if self.concurrency.cloud_ocr == 0
            || self.concurrency.classification == 0
            || self.concurrency.extraction_threads == 0
            || self.concurrency.local_ocr == Some(0)
        {
            problems.push("concurrency limits must be at least 1");
        }
        if self.orchestration.retry_ceiling == 0 {
            problems.push("retry ceiling must be at least 1");
        }
        if self.extraction.char_cap == 0 || b.max_thread_chars == 0 {
            problems.push("character caps must be at least 1");
        }
        if self.relevance.enabled && self.relevance.group_size == 0 {
            problems.push("relevance group size must be at least 1");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(problems.join("; ")))
        }
    }
}

impl std::fmt::Display for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pipeline Config:\nPipeline: {} (budget {}ms, retry ceiling {})\n\nExtraction: {:?}\n\nConcurrency: {:?} (local ocr workers: {})\n\nBatching: {:?}\n\nRelevance: {:?}\n\nRetry: {:?}\n\nStorage: {:?}\n\nSignal: {:?}",
            self.orchestration.pipeline_id,
            self.orchestration.budget_ms,
            self.orchestration.retry_ceiling,
            self.extraction,
            self.concurrency,
            self.concurrency.local_ocr_workers(),
            self.batching,
            self.relevance,
            self.retry,
            self.storage,
            self.signal,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = PipelineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.extraction.native_accept_threshold, None);
        assert_eq!(cfg.orchestration.retry_ceiling, 5);
        assert_eq!(cfg.concurrency.classification, 5);
        assert!(cfg.concurrency.local_ocr_workers() <= 12);
        assert!(cfg.concurrency.local_ocr_workers() >= 2);
    }

    #[test]
    fn test_validate_rejects_threshold_above_budget() {
        let mut cfg = PipelineConfig::default();
        cfg.batching.small_max_tokens = 20_000;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("small tier"));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut cfg = PipelineConfig::default();
        cfg.concurrency.classification = 0;
        cfg.orchestration.retry_ceiling = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("concurrency"));
        assert!(err.contains("retry ceiling"));
    }

    #[test]
    fn test_smart_skip_modes() {
        assert!(!SmartSkip::Disabled.should_skip_ocr(10_000, 20));
        assert!(SmartSkip::SkipIfAnyText.should_skip_ocr(21, 20));
        assert!(!SmartSkip::SkipIfAnyText.should_skip_ocr(5, 20));
        assert!(SmartSkip::SkipIfNonEmpty.should_skip_ocr(1, 20));
        assert!(!SmartSkip::SkipIfNonEmpty.should_skip_ocr(0, 20));
    }

    #[test]
    fn test_smart_skip_names() {
        let parse = |name: &str| -> SmartSkip {
            let toml = format!("[extraction]\nsmart_skip = \"{}\"", name);
            let cfg: PipelineConfig = Config::builder()
                .add_source(config::File::from_str(&toml, config::FileFormat::Toml))
                .build()
                .unwrap()
                .try_deserialize()
                .unwrap();
            cfg.extraction.smart_skip
        };
        assert_eq!(parse("disabled"), SmartSkip::Disabled);
        assert_eq!(parse("skip_if_any_text"), SmartSkip::SkipIfAnyText);
        assert_eq!(parse("skip_if_nonempty"), SmartSkip::SkipIfNonEmpty);
        assert_eq!(parse("skip_if_non_empty"), SmartSkip::SkipIfNonEmpty);
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let cfg: PipelineConfig = Config::builder()
            .add_source(config::File::from_str(
                r#"
                [extraction]
                smart_skip = "skip_if_nonempty"
                native_accept_threshold = 500

                [orchestration]
                retry_ceiling = 3
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.extraction.smart_skip, SmartSkip::SkipIfNonEmpty);
        assert_eq!(cfg.extraction.native_accept_threshold, Some(500));
        assert_eq!(cfg.orchestration.retry_ceiling, 3);
        assert_eq!(cfg.extraction.char_cap, 20_000);
    }
}
