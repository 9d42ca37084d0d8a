//! Core type definitions for the verification pipeline.
//!
//! Defines providers, model references, chains, per-stage results, the
//! verification summary, and the finished-run record handed to history.

use crate::classifier::LengthConfig;
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Smallest number of stages a chain may contain.
pub const MIN_CHAIN_LEN: usize = 2;
/// Largest number of stages a chain may contain.
pub const MAX_CHAIN_LEN: usize = 4;

/// An LLM vendor with its own wire format and credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Gemini,
    Xai,
}

impl Provider {
    /// Every supported provider, in catalog order.
    pub const ALL: [Provider; 4] = [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Gemini,
        Provider::Xai,
    ];

    /// Stable lowercase identifier used in requests and credential stores.
    pub fn id(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::Xai => "xai",
        }
    }

    /// Human-readable vendor name.
    pub fn display_name(self) -> &'static str {
        match self {
            Provider::OpenAi => "OpenAI",
            Provider::Anthropic => "Anthropic",
            Provider::Gemini => "Gemini",
            Provider::Xai => "xAI",
        }
    }

    /// Environment variable conventionally holding this provider's API key.
    pub fn default_api_key_env(self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Gemini => "GEMINI_API_KEY",
            Provider::Xai => "XAI_API_KEY",
        }
    }

    /// Public API base URL.
    pub fn default_base_url(self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com/v1",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            Provider::Xai => "https://api.x.ai/v1",
        }
    }

    /// Models offered for selection in chains.
    pub fn catalog_models(self) -> &'static [&'static str] {
        match self {
            Provider::OpenAi => &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo"],
            Provider::Anthropic => &["claude-sonnet-4-5", "claude-haiku-4-5", "claude-opus-4-5"],
            Provider::Gemini => &["gemini-2.5-flash", "gemini-2.5-pro"],
            Provider::Xai => &["grok-3", "grok-3-fast"],
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Provider {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "gemini" | "google" => Ok(Provider::Gemini),
            "xai" | "grok" => Ok(Provider::Xai),
            other => Err(PipelineError::InvalidRequest {
                message: format!("unknown provider '{other}'"),
            }),
        }
    }
}

/// One callable endpoint configuration: a provider plus a model name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: Provider,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Label used when quoting a stage inside a prompt, e.g. `Anthropic / claude-haiku-4-5`.
    pub fn label(&self) -> String {
        format!("{} / {}", self.provider.display_name(), self.model)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider.id(), self.model)
    }
}

impl FromStr for ModelRef {
    type Err = PipelineError;

    /// Parse `provider:model`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, model) = s.split_once(':').ok_or_else(|| PipelineError::InvalidRequest {
            message: format!("expected 'provider:model', got '{s}'"),
        })?;
        let model = model.trim();
        if model.is_empty() {
            return Err(PipelineError::InvalidRequest {
                message: format!("missing model name in '{s}'"),
            });
        }
        Ok(ModelRef::new(provider.parse()?, model))
    }
}

/// The ordered list of models for one run, one per stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ModelRef>", into = "Vec<ModelRef>")]
pub struct Chain(Vec<ModelRef>);

impl Chain {
    /// Build a chain, rejecting lengths outside 2..=4.
    pub fn new(models: Vec<ModelRef>) -> Result<Self, PipelineError> {
        if !(MIN_CHAIN_LEN..=MAX_CHAIN_LEN).contains(&models.len()) {
            return Err(PipelineError::InvalidRequest {
                message: format!(
                    "chain must contain between {MIN_CHAIN_LEN} and {MAX_CHAIN_LEN} models, got {}",
                    models.len()
                ),
            });
        }
        Ok(Self(models))
    }

    /// Default three-stage chain.
    pub fn default_three() -> Self {
        Self(vec![
            ModelRef::new(Provider::Anthropic, "claude-sonnet-4-5"),
            ModelRef::new(Provider::Gemini, "gemini-2.5-pro"),
            ModelRef::new(Provider::Xai, "grok-3"),
        ])
    }

    /// Default two-stage chain.
    pub fn default_two() -> Self {
        Self(vec![
            ModelRef::new(Provider::Anthropic, "claude-sonnet-4-5"),
            ModelRef::new(Provider::Gemini, "gemini-2.5-pro"),
        ])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn models(&self) -> &[ModelRef] {
        &self.0
    }

    /// Model for a 1-based stage index.
    pub fn stage_model(&self, stage: usize) -> Option<&ModelRef> {
        stage.checked_sub(1).and_then(|i| self.0.get(i))
    }
}

impl TryFrom<Vec<ModelRef>> for Chain {
    type Error = PipelineError;

    fn try_from(models: Vec<ModelRef>) -> Result<Self, Self::Error> {
        Chain::new(models)
    }
}

impl From<Chain> for Vec<ModelRef> {
    fn from(chain: Chain) -> Self {
        chain.0
    }
}

/// Lifecycle state of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Streaming,
    Retrying,
    Complete,
    Error,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Complete | StageStatus::Error | StageStatus::Skipped
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageStatus::Streaming => "streaming",
            StageStatus::Retrying => "retrying",
            StageStatus::Complete => "complete",
            StageStatus::Error => "error",
            StageStatus::Skipped => "skipped",
        })
    }
}

/// Output of one stage, updated in place as tokens arrive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// 1-based position in the chain.
    pub stage: usize,
    /// The model that produced `content` (a fallback model if one was used).
    pub model: ModelRef,
    pub content: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageResult {
    pub fn streaming(stage: usize, model: ModelRef) -> Self {
        Self {
            stage,
            model,
            content: String::new(),
            status: StageStatus::Streaming,
            error: None,
        }
    }

    pub fn completed(stage: usize, model: ModelRef, content: impl Into<String>) -> Self {
        Self {
            stage,
            model,
            content: content.into(),
            status: StageStatus::Complete,
            error: None,
        }
    }
}

/// A disagreement between two stages found by the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contradiction {
    pub topic: String,
    pub stage_a: usize,
    pub stage_b: usize,
    pub description: String,
}

/// Terminal judgment of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSummary {
    pub consistency: String,
    pub hallucinations: String,
    pub confidence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub contradictions: Vec<Contradiction>,
    /// `false` when the summary came from the heuristic fallback.
    #[serde(default)]
    pub is_analyzed: bool,
}

/// Accumulated state of one run, owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub query: String,
    pub chain: Chain,
    pub completed_stages: Vec<StageResult>,
    pub length_config: LengthConfig,
    pub adversarial_mode: bool,
}

impl PipelineRun {
    pub fn new(query: String, chain: Chain, length_config: LengthConfig, adversarial_mode: bool) -> Self {
        Self {
            query,
            chain,
            completed_stages: Vec::new(),
            length_config,
            adversarial_mode,
        }
    }

    pub fn total_stages(&self) -> usize {
        self.chain.len()
    }

    pub fn skipped_stages(&self) -> usize {
        self.total_stages()
            .saturating_sub(self.completed_stages.len())
    }
}

/// A finished run, handed to the history collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: Uuid,
    pub query: String,
    pub chain: Chain,
    pub stages: Vec<StageResult>,
    pub summary: Option<VerificationSummary>,
    pub adversarial_mode: bool,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(
        query: impl Into<String>,
        chain: Chain,
        stages: Vec<StageResult>,
        summary: Option<VerificationSummary>,
        adversarial_mode: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            query: query.into(),
            chain,
            stages,
            summary,
            adversarial_mode,
            created_at: Utc::now(),
        }
    }

    /// `model → model → model`, for listings.
    pub fn chain_summary(&self) -> String {
        self.chain
            .models()
            .iter()
            .map(|m| m.model.as_str())
            .collect::<Vec<_>>()
            .join(" → ")
    }
}

/// Every catalog model across providers.
pub fn catalog() -> Vec<ModelRef> {
    Provider::ALL
        .iter()
        .flat_map(|p| p.catalog_models().iter().map(|m| ModelRef::new(*p, *m)))
        .collect()
}
