//! Verification pipeline orchestration.
//!
//! Drives a chain of models stage by stage:
//!
//! 1. **Classify** the query once to size every stage's budget.
//! 2. **Stages** run strictly in order through the [`StageExecutor`]; each
//!    later stage sees every completed earlier stage.
//! 3. **Analyze** the completed stages into a [`VerificationSummary`].
//!
//! Cancellation is cooperative through a run-scoped token. Once it fires no
//! further events are emitted.

use crate::analyzer::ConsensusAnalyzer;
use crate::classifier::Classifier;
use crate::config::RosinConfig;
use crate::error::PipelineError;
use crate::events::{EventEmitter, PipelineEvent};
use crate::history::RunRecorder;
use crate::prompts::build_stage_prompt;
use crate::providers::{ChatClient, ChatRequest};
use crate::resilience::{StageExecutor, StageOutcome};
use crate::types::{
    Chain, ModelRef, PipelineRun, RunRecord, StageResult, StageStatus, VerificationSummary,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A request to verify one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub query: String,
    pub chain: Vec<ModelRef>,
    #[serde(default)]
    pub adversarial_mode: bool,
}

impl RunRequest {
    pub fn new(query: impl Into<String>, chain: Vec<ModelRef>) -> Self {
        Self {
            query: query.into(),
            chain,
            adversarial_mode: false,
        }
    }

    pub fn adversarial(mut self, enabled: bool) -> Self {
        self.adversarial_mode = enabled;
        self
    }

    /// Check the request and return the trimmed query with a validated chain.
    pub fn validate(&self) -> Result<(String, Chain), PipelineError> {
        let query = self.query.trim();
        if query.is_empty() {
            return Err(PipelineError::InvalidRequest {
                message: "query must not be empty".into(),
            });
        }
        let chain = Chain::new(self.chain.clone())?;
        Ok((query.to_string(), chain))
    }
}

/// How a run ended without a fatal error.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunRecord),
    Cancelled,
}

/// The orchestrator. Cheap to share behind an `Arc`.
pub struct VerificationPipeline {
    executor: StageExecutor,
    analyzer: ConsensusAnalyzer,
    classifier: Classifier,
    recorder: Arc<dyn RunRecorder>,
    event_capacity: usize,
}

impl VerificationPipeline {
    pub fn new(
        executor: StageExecutor,
        analyzer: ConsensusAnalyzer,
        classifier: Classifier,
        recorder: Arc<dyn RunRecorder>,
        event_capacity: usize,
    ) -> Self {
        Self {
            executor,
            analyzer,
            classifier,
            recorder,
            event_capacity: event_capacity.max(1),
        }
    }

    /// Wire a pipeline from configuration around one chat client.
    pub fn from_config(
        config: &RosinConfig,
        client: Arc<dyn ChatClient>,
        recorder: Arc<dyn RunRecorder>,
    ) -> Self {
        let pipeline = &config.pipeline;
        Self::new(
            StageExecutor::new(
                client.clone(),
                pipeline.fallback_candidates.clone(),
                pipeline.attempt_timeout(),
            ),
            ConsensusAnalyzer::new(
                client,
                pipeline.analyzer_candidates.clone(),
                pipeline.analyzer_max_tokens,
            ),
            Classifier::new(config.classifier.clone()),
            recorder,
            pipeline.event_channel_capacity,
        )
    }

    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    /// Run to completion on the current task, emitting through `events`.
    ///
    /// Returns `Err` only for invalid requests and final-stage exhaustion.
    pub async fn run(
        &self,
        request: RunRequest,
        events: &EventEmitter,
    ) -> Result<RunOutcome, PipelineError> {
        let (query, chain) = request.validate()?;
        let length = self.classifier.classify(&query);
        let total = chain.len();
        info!(
            stages = total,
            tier = %length.tier,
            max_tokens = length.max_tokens,
            adversarial = request.adversarial_mode,
            "Starting verification run"
        );

        let mut run = PipelineRun::new(query, chain, length, request.adversarial_mode);
        let mut stages: Vec<StageResult> = Vec::with_capacity(total);
        let models: Vec<ModelRef> = run.chain.models().to_vec();

        for (index, primary) in models.iter().enumerate() {
            let stage = index + 1;
            if events.is_cancelled() {
                info!(stage, "Run cancelled before stage");
                return Ok(RunOutcome::Cancelled);
            }

            let prompt = build_stage_prompt(
                stage,
                total,
                &run.query,
                &run.completed_stages,
                &run.length_config,
                run.adversarial_mode,
            );
            let chat = ChatRequest::new(
                prompt.system_prompt,
                prompt.user_content,
                run.length_config.max_tokens,
            );

            match self
                .executor
                .execute(stage, stage == total, primary, &chat, events)
                .await
            {
                StageOutcome::Completed { content, model } => {
                    let result = StageResult::completed(stage, model, content);
                    run.completed_stages.push(result.clone());
                    stages.push(result);
                }
                StageOutcome::Skipped { error } => {
                    stages.push(terminal_result(stage, primary, StageStatus::Skipped, error));
                }
                StageOutcome::Failed { error } => {
                    stages.push(terminal_result(stage, primary, StageStatus::Error, error.clone()));
                    warn!(stage, error = %error, "Verification run failed");
                    self.recorder.record(RunRecord::new(
                        run.query.clone(),
                        run.chain.clone(),
                        stages,
                        None,
                        run.adversarial_mode,
                    ));
                    return Err(PipelineError::StageFailed {
                        stage,
                        message: error,
                    });
                }
                StageOutcome::Cancelled => {
                    info!(stage, "Run cancelled during stage");
                    return Ok(RunOutcome::Cancelled);
                }
            }
        }

        let summary: VerificationSummary = tokio::select! {
            biased;
            _ = events.cancellation().cancelled() => return Ok(RunOutcome::Cancelled),
            summary = self.analyzer.analyze(&run) => summary,
        };

        if !events
            .emit(PipelineEvent::Summary {
                summary: summary.clone(),
            })
            .await
            || !events.emit(PipelineEvent::Done).await
        {
            return Ok(RunOutcome::Cancelled);
        }

        info!(
            completed = run.completed_stages.len(),
            total,
            analyzed = summary.is_analyzed,
            "Verification run complete"
        );
        let record = RunRecord::new(
            run.query,
            run.chain,
            stages,
            Some(summary),
            run.adversarial_mode,
        );
        self.recorder.record(record.clone());
        Ok(RunOutcome::Completed(record))
    }

    /// Validate, then run on a spawned task with its own event channel.
    pub fn spawn(
        self: &Arc<Self>,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunHandle, PipelineError> {
        request.validate()?;
        let (emitter, events) = EventEmitter::channel(self.event_capacity, cancel.clone());
        let pipeline = Arc::clone(self);
        let task = tokio::spawn(async move { pipeline.run(request, &emitter).await });
        Ok(RunHandle {
            events,
            task,
            cancel,
        })
    }
}

fn terminal_result(stage: usize, model: &ModelRef, status: StageStatus, error: String) -> StageResult {
    StageResult {
        stage,
        model: model.clone(),
        content: String::new(),
        status,
        error: Some(error),
    }
}

/// A spawned run: its event stream, its task, and its cancellation token.
pub struct RunHandle {
    pub events: mpsc::Receiver<PipelineEvent>,
    pub task: JoinHandle<Result<RunOutcome, PipelineError>>,
    pub cancel: CancellationToken,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Holds at most one in-flight run. Starting a new run cancels the previous one.
pub struct PipelineSession {
    pipeline: Arc<VerificationPipeline>,
    current: Mutex<Option<SessionRun>>,
}

/// The session's view of its current run.
struct SessionRun {
    cancel: CancellationToken,
    task: AbortHandle,
}

impl SessionRun {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

impl PipelineSession {
    pub fn new(pipeline: Arc<VerificationPipeline>) -> Self {
        Self {
            pipeline,
            current: Mutex::new(None),
        }
    }

    /// Start a run, cancelling any run already in flight.
    ///
    /// An invalid request leaves the in-flight run untouched.
    pub fn start(&self, request: RunRequest) -> Result<RunHandle, PipelineError> {
        request.validate()?;
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = current.take()
            && previous.is_live()
        {
            info!("Cancelling previous run");
            previous.cancel.cancel();
        }
        let handle = self.pipeline.spawn(request, CancellationToken::new())?;
        *current = Some(SessionRun {
            cancel: handle.cancel.clone(),
            task: handle.task.abort_handle(),
        });
        Ok(handle)
    }

    /// Cancel the in-flight run, if any.
    pub fn cancel(&self) {
        if let Some(run) = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            run.cancel.cancel();
        }
    }

    /// True while the current run is neither cancelled nor finished.
    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(SessionRun::is_live)
    }
}
