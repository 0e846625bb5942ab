//! TOML configuration parsing and validation.
//!
//! Every section carries defaults so a minimal file (or no file at all, via
//! [`Config::minimal`]) is enough for commands that only read evidence.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub selectors: SelectorConfig,
    #[serde(default)]
    pub revelation: RevelationConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

impl Config {
    /// Defaults for every section; used when no config file is needed.
    pub fn minimal() -> Self {
        Self::default()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_fixtures")]
    pub fixtures: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            fixtures: default_fixtures(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_fixtures() -> PathBuf {
    PathBuf::from("./fixtures")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./evidence")
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    #[serde(default = "default_platform_name")]
    pub name: String,
    #[serde(default = "default_platform_version")]
    pub version: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            name: default_platform_name(),
            version: default_platform_version(),
        }
    }
}

fn default_platform_name() -> String {
    "gemini".to_string()
}
fn default_platform_version() -> String {
    "unknown".to_string()
}

/// Query strings handed to the [`ContentSource`](crate::traits::ContentSource).
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SelectorConfig {
    pub exchange: String,
    pub user_query: String,
    pub model_response: String,
    pub thinking_block: String,
    pub reveal_button: String,
    pub thinking_content: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            exchange: "conversation-container".to_string(),
            user_query: "user-query".to_string(),
            model_response: "model-response".to_string(),
            thinking_block: "model-thoughts".to_string(),
            reveal_button: "thoughts-header-button".to_string(),
            thinking_content: "thoughts-content".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RevelationConfig {
    #[serde(default = "default_strategies")]
    pub strategies: Vec<String>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for RevelationConfig {
    fn default() -> Self {
        Self {
            strategies: default_strategies(),
            threshold: default_threshold(),
        }
    }
}

fn default_strategies() -> Vec<String> {
    vec![
        "button".to_string(),
        "always_visible".to_string(),
        "none".to_string(),
    ]
}
fn default_threshold() -> f64 {
    0.95
}

/// How to treat a revealed block whose stage boundaries are only partly present.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartialStagePolicy {
    /// Keep the parsed stages; orphan leading text becomes a sentinel stage.
    #[default]
    Accept,
    /// Poll again (up to `partial_retry_limit`) hoping the block finishes rendering.
    Retry,
    /// Discard the partial structure and keep the full text as one sentinel stage.
    Fallback,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractionConfig {
    pub identity_prefix_chars: usize,
    pub min_content_chars: usize,
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    pub settle_ms: u64,
    pub small_step: u64,
    pub large_step: u64,
    pub max_iterations: u32,
    pub idle_sweeps: u32,
    pub partial_stage_policy: PartialStagePolicy,
    pub partial_retry_limit: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            identity_prefix_chars: 160,
            min_content_chars: 20,
            poll_attempts: 20,
            poll_interval_ms: 100,
            settle_ms: 50,
            small_step: 200,
            large_step: 800,
            max_iterations: 2000,
            idle_sweeps: 3,
            partial_stage_policy: PartialStagePolicy::Accept,
            partial_retry_limit: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BatchConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub identity_prefixes: Vec<String>,
    /// 0 means unlimited.
    pub limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1500,
            max_delay_ms: 4000,
            identity_prefixes: vec!["c_".to_string()],
            limit: 0,
        }
    }
}

pub const STRATEGY_NAMES: [&str; 3] = ["button", "always_visible", "none"];

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let threshold = config.revelation.threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        anyhow::bail!("revelation.threshold must be in (0.0, 1.0]");
    }

    let strategies = &config.revelation.strategies;
    if strategies.is_empty() {
        anyhow::bail!("revelation.strategies must name at least one strategy");
    }
    for (i, name) in strategies.iter().enumerate() {
        if !STRATEGY_NAMES.contains(&name.as_str()) {
            anyhow::bail!(
                "Unknown revelation strategy: '{}'. Must be button, always_visible, or none.",
                name
            );
        }
        if name == "none" && i + 1 != strategies.len() {
            anyhow::bail!("revelation strategy 'none' must be last");
        }
    }

    let ex = &config.extraction;
    if ex.poll_attempts == 0 {
        anyhow::bail!("extraction.poll_attempts must be >= 1");
    }
    if ex.small_step == 0 {
        anyhow::bail!("extraction.small_step must be >= 1");
    }
    if ex.large_step < ex.small_step {
        anyhow::bail!("extraction.large_step must be >= extraction.small_step");
    }
    if ex.max_iterations == 0 {
        anyhow::bail!("extraction.max_iterations must be >= 1");
    }
    if ex.identity_prefix_chars < 8 {
        anyhow::bail!("extraction.identity_prefix_chars must be >= 8");
    }

    if config.batch.min_delay_ms > config.batch.max_delay_ms {
        anyhow::bail!("batch.min_delay_ms must be <= batch.max_delay_ms");
    }

    Ok(())
}
