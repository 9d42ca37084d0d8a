//! Pipeline event protocol and the channel that carries it.

use crate::types::{ModelRef, StageResult, StageStatus, VerificationSummary};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events emitted by a run, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A stage began on its primary model.
    StageStart { stage: usize, model: ModelRef },
    /// A text delta for the current attempt.
    StageContent { stage: usize, content: String },
    StageComplete { stage: usize },
    /// A new attempt begins: 2 retries the primary, 3 uses a fallback.
    StageRetry {
        stage: usize,
        model: ModelRef,
        attempt: u8,
    },
    /// A non-final stage exhausted its attempts; the run continues without it.
    StageSkipped { stage: usize, error: String },
    /// The final stage exhausted its attempts; the run is over.
    StageError { stage: usize, error: String },
    Summary { summary: VerificationSummary },
    Done,
}

impl PipelineEvent {
    pub fn stage(&self) -> Option<usize> {
        match self {
            PipelineEvent::StageStart { stage, .. }
            | PipelineEvent::StageContent { stage, .. }
            | PipelineEvent::StageComplete { stage }
            | PipelineEvent::StageRetry { stage, .. }
            | PipelineEvent::StageSkipped { stage, .. }
            | PipelineEvent::StageError { stage, .. } => Some(*stage),
            PipelineEvent::Summary { .. } | PipelineEvent::Done => None,
        }
    }

    /// Short wire name, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::StageStart { .. } => "stage_start",
            PipelineEvent::StageContent { .. } => "stage_content",
            PipelineEvent::StageComplete { .. } => "stage_complete",
            PipelineEvent::StageRetry { .. } => "stage_retry",
            PipelineEvent::StageSkipped { .. } => "stage_skipped",
            PipelineEvent::StageError { .. } => "stage_error",
            PipelineEvent::Summary { .. } => "summary",
            PipelineEvent::Done => "done",
        }
    }
}

/// Sending half of a run's event channel, tied to the run's cancellation.
///
/// Nothing is delivered once the run is cancelled. If the receiver has gone
/// away the run cancels itself.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<PipelineEvent>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Bounded channel plus emitter.
    pub fn channel(
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx, cancel), rx)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Deliver an event. Returns `false` if the run is (or just became) cancelled.
    pub async fn emit(&self, event: PipelineEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => match sent {
                Ok(()) => true,
                Err(_) => {
                    tracing::debug!("Event receiver dropped, cancelling run");
                    self.cancel.cancel();
                    false
                }
            },
        }
    }
}

/// Live per-stage state folded from a run's events.
///
/// Each stage is created `streaming` on `stage_start`, flips to `retrying` when
/// a new attempt begins, and ends `complete`, `skipped` or `error`. Text from a
/// failed attempt is dropped when the next attempt starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageBoard {
    stages: Vec<StageResult>,
}

impl StageBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    pub fn stage(&self, stage: usize) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    fn stage_mut(&mut self, stage: usize) -> Option<&mut StageResult> {
        self.stages.iter_mut().find(|s| s.stage == stage)
    }

    /// Apply one event. Events for unknown stages and terminal stages are ignored.
    pub fn apply(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageStart { stage, model } => {
                if self.stage(*stage).is_none() {
                    self.stages.push(StageResult::streaming(*stage, model.clone()));
                }
            }
            PipelineEvent::StageContent { stage, content } => {
                if let Some(s) = self.stage_mut(*stage)
                    && !s.status.is_terminal()
                {
                    s.content.push_str(content);
                    s.status = StageStatus::Streaming;
                }
            }
            PipelineEvent::StageRetry { stage, model, .. } => {
                if let Some(s) = self.stage_mut(*stage)
                    && !s.status.is_terminal()
                {
                    s.model = model.clone();
                    s.content.clear();
                    s.status = StageStatus::Retrying;
                }
            }
            PipelineEvent::StageComplete { stage } => {
                if let Some(s) = self.stage_mut(*stage)
                    && !s.status.is_terminal()
                {
                    s.status = StageStatus::Complete;
                }
            }
            PipelineEvent::StageSkipped { stage, error } => {
                self.finish(*stage, StageStatus::Skipped, error);
            }
            PipelineEvent::StageError { stage, error } => {
                self.finish(*stage, StageStatus::Error, error);
            }
            PipelineEvent::Summary { .. } | PipelineEvent::Done => {}
        }
    }

    fn finish(&mut self, stage: usize, status: StageStatus, error: &str) {
        if let Some(s) = self.stage_mut(stage)
            && !s.status.is_terminal()
        {
            s.content.clear();
            s.status = status;
            s.error = Some(error.to_string());
        }
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }
}
