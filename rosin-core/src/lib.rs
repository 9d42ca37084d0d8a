//! # Rosin Core
//!
//! Core library for Rosin, a multi-model verification pipeline.
//! A query runs through a chain of 2-4 models; each later stage reviews the
//! earlier answers, and a final consensus pass scores how well they agree.
//! Provides the provider adapters, stage resilience, orchestration, consensus
//! analysis, configuration, and the SSE gateway.

pub mod analyzer;
pub mod classifier;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod gateway;
pub mod history;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod resilience;
pub mod sse;
pub mod types;

// Re-export commonly used types at the crate root.
pub use analyzer::{ConsensusAnalyzer, heuristic_summary};
pub use classifier::{Classifier, ClassifierConfig, ComplexityTier, LengthConfig, classify};
pub use config::{RosinConfig, load_config};
pub use credentials::{CredentialStore, EnvCredentialStore, LayeredCredentialStore};
pub use error::{ConfigError, LlmError, PipelineError};
pub use events::{EventEmitter, PipelineEvent, StageBoard};
pub use gateway::{GatewayConfig, GatewayState, SharedGateway};
pub use history::{InMemoryRunLog, NoopRecorder, RunRecorder};
pub use pipeline::{PipelineSession, RunHandle, RunOutcome, RunRequest, VerificationPipeline};
pub use providers::{ChatClient, ChatRequest, HttpChatClient, ScriptedChatClient, ScriptedReply};
pub use resilience::{StageExecutor, StageOutcome};
pub use types::{
    Chain, Contradiction, ModelRef, PipelineRun, Provider, RunRecord, StageResult, StageStatus,
    VerificationSummary,
};
