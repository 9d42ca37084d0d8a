//! Per-stage resilience: primary attempt, one retry, then a cross-provider fallback.
//!
//! Attempt 1 and 2 use the stage's primary model. Attempt 3 uses the first
//! configured fallback candidate from a *different* provider whose credential
//! is available. Text from a failed attempt is discarded.

use crate::error::LlmError;
use crate::events::{EventEmitter, PipelineEvent};
use crate::providers::{ChatClient, ChatRequest};
use crate::types::ModelRef;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How a stage ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// `model` is the model that produced `content`.
    Completed { content: String, model: ModelRef },
    /// A non-final stage exhausted its attempts.
    Skipped { error: String },
    /// The final stage exhausted its attempts.
    Failed { error: String },
    Cancelled,
}

/// Runs one stage with retry and fallback, emitting its events.
pub struct StageExecutor {
    client: Arc<dyn ChatClient>,
    fallback_candidates: Vec<ModelRef>,
    attempt_timeout: Option<Duration>,
}

impl StageExecutor {
    pub fn new(
        client: Arc<dyn ChatClient>,
        fallback_candidates: Vec<ModelRef>,
        attempt_timeout: Option<Duration>,
    ) -> Self {
        Self {
            client,
            fallback_candidates,
            attempt_timeout,
        }
    }

    /// First candidate from another provider with an available credential.
    pub fn select_fallback(&self, primary: &ModelRef) -> Option<&ModelRef> {
        self.fallback_candidates
            .iter()
            .find(|m| m.provider != primary.provider && self.client.has_credential(m.provider))
    }

    pub async fn execute(
        &self,
        stage: usize,
        is_final: bool,
        primary: &ModelRef,
        request: &ChatRequest,
        events: &EventEmitter,
    ) -> StageOutcome {
        info!(stage, model = %primary, "Stage starting");
        if !events
            .emit(PipelineEvent::StageStart {
                stage,
                model: primary.clone(),
            })
            .await
        {
            return StageOutcome::Cancelled;
        }

        if let Ok(content) = self.attempt(stage, 1, primary, request, events).await {
            return self.complete(stage, content, primary, events).await;
        }
        if events.is_cancelled() {
            return StageOutcome::Cancelled;
        }

        if !events
            .emit(PipelineEvent::StageRetry {
                stage,
                model: primary.clone(),
                attempt: 2,
            })
            .await
        {
            return StageOutcome::Cancelled;
        }
        let mut last_error = match self.attempt(stage, 2, primary, request, events).await {
            Ok(content) => return self.complete(stage, content, primary, events).await,
            Err(e) => e,
        };
        if events.is_cancelled() {
            return StageOutcome::Cancelled;
        }

        if let Some(fallback) = self.select_fallback(primary) {
            info!(stage, primary = %primary, fallback = %fallback, "Falling back to another provider");
            if !events
                .emit(PipelineEvent::StageRetry {
                    stage,
                    model: fallback.clone(),
                    attempt: 3,
                })
                .await
            {
                return StageOutcome::Cancelled;
            }
            match self.attempt(stage, 3, fallback, request, events).await {
                Ok(content) => return self.complete(stage, content, fallback, events).await,
                Err(e) => last_error = e,
            }
            if events.is_cancelled() {
                return StageOutcome::Cancelled;
            }
        } else {
            warn!(stage, primary = %primary, "No fallback candidate available");
        }

        let error = last_error.display_message();
        if is_final {
            warn!(stage, error = %error, "Final stage exhausted all attempts");
            if !events
                .emit(PipelineEvent::StageError {
                    stage,
                    error: error.clone(),
                })
                .await
            {
                return StageOutcome::Cancelled;
            }
            StageOutcome::Failed { error }
        } else {
            warn!(stage, error = %error, "Stage exhausted all attempts, skipping");
            if !events
                .emit(PipelineEvent::StageSkipped {
                    stage,
                    error: error.clone(),
                })
                .await
            {
                return StageOutcome::Cancelled;
            }
            StageOutcome::Skipped { error }
        }
    }

    async fn complete(
        &self,
        stage: usize,
        content: String,
        model: &ModelRef,
        events: &EventEmitter,
    ) -> StageOutcome {
        if !events.emit(PipelineEvent::StageComplete { stage }).await {
            return StageOutcome::Cancelled;
        }
        info!(stage, model = %model, chars = content.chars().count(), "Stage complete");
        StageOutcome::Completed {
            content,
            model: model.clone(),
        }
    }

    /// One streaming attempt, raced against cancellation and the optional timeout.
    async fn attempt(
        &self,
        stage: usize,
        attempt: u8,
        model: &ModelRef,
        request: &ChatRequest,
        events: &EventEmitter,
    ) -> Result<String, LlmError> {
        let streamed = async {
            let mut tokens = self.client.stream(model, request).await?;
            let mut content = String::new();
            while let Some(delta) = tokens.next().await {
                let delta = delta?;
                content.push_str(&delta);
                if !events
                    .emit(PipelineEvent::StageContent {
                        stage,
                        content: delta,
                    })
                    .await
                {
                    return Err(LlmError::Cancelled);
                }
            }
            Ok(content)
        };

        let bounded = async {
            match self.attempt_timeout {
                Some(limit) => tokio::time::timeout(limit, streamed)
                    .await
                    .unwrap_or(Err(LlmError::Timeout {
                        timeout_secs: limit.as_secs(),
                    })),
                None => streamed.await,
            }
        };

        let result = tokio::select! {
            biased;
            _ = events.cancellation().cancelled() => Err(LlmError::Cancelled),
            result = bounded => result,
        };

        if let Err(e) = &result
            && !matches!(e, LlmError::Cancelled)
        {
            warn!(stage, attempt, model = %model, error = %e, "Stage attempt failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ScriptedChatClient, ScriptedReply};
    use crate::types::Provider;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn primary() -> ModelRef {
        ModelRef::new(Provider::Anthropic, "claude-sonnet-4-5")
    }

    fn fallbacks() -> Vec<ModelRef> {
        vec![
            ModelRef::new(Provider::Anthropic, "claude-haiku-4-5"),
            ModelRef::new(Provider::Gemini, "gemini-2.5-flash"),
            ModelRef::new(Provider::Xai, "grok-3-fast"),
        ]
    }

    fn req() -> ChatRequest {
        ChatRequest::new("sys", "user", 64)
    }

    async fn drain(mut rx: mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            out.push(ev);
        }
        out
    }

    async fn run(
        client: Arc<ScriptedChatClient>,
        is_final: bool,
    ) -> (StageOutcome, Vec<PipelineEvent>) {
        let executor = StageExecutor::new(client, fallbacks(), None);
        let (emitter, rx) = EventEmitter::channel(64, CancellationToken::new());
        let outcome = executor
            .execute(1, is_final, &primary(), &req(), &emitter)
            .await;
        drop(emitter);
        (outcome, drain(rx).await)
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_reply(&primary(), ScriptedReply::tokens(&["Par", "is"]));
        let (outcome, events) = run(client, false).await;
        assert_eq!(
            outcome,
            StageOutcome::Completed {
                content: "Paris".into(),
                model: primary()
            }
        );
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec!["stage_start", "stage_content", "stage_content", "stage_complete"]
        );
    }

    #[tokio::test]
    async fn test_retry_then_success_uses_primary() {
        let client = Arc::new(ScriptedChatClient::new());
        client
            .push_reply(&primary(), ScriptedReply::fail("connection reset"))
            .push_reply(&primary(), ScriptedReply::text("ok"));
        let (outcome, events) = run(client.clone(), false).await;
        assert_eq!(
            outcome,
            StageOutcome::Completed {
                content: "ok".into(),
                model: primary()
            }
        );
        assert!(events.contains(&PipelineEvent::StageRetry {
            stage: 1,
            model: primary(),
            attempt: 2
        }));
        assert!(!events.iter().any(|e| matches!(e, PipelineEvent::StageRetry { attempt: 3, .. })));
        assert_eq!(client.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_fallback_skips_same_provider() {
        let client = Arc::new(ScriptedChatClient::new());
        client
            .push_reply(&primary(), ScriptedReply::fail("500"))
            .push_reply(&primary(), ScriptedReply::fail("500"));
        let (outcome, events) = run(client, false).await;
        let gemini = ModelRef::new(Provider::Gemini, "gemini-2.5-flash");
        assert_eq!(
            outcome,
            StageOutcome::Completed {
                content: "gemini-2.5-flash response".into(),
                model: gemini.clone()
            }
        );
        assert!(events.contains(&PipelineEvent::StageRetry {
            stage: 1,
            model: gemini,
            attempt: 3
        }));
    }

    #[tokio::test]
    async fn test_fallback_requires_credential() {
        let client = Arc::new(ScriptedChatClient::new());
        client.remove_credential(Provider::Gemini);
        client
            .push_reply(&primary(), ScriptedReply::fail("500"))
            .push_reply(&primary(), ScriptedReply::fail("500"));
        let (outcome, _) = run(client, false).await;
        match outcome {
            StageOutcome::Completed { model, .. } => assert_eq!(model.provider, Provider::Xai),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_text_discarded_on_retry() {
        let client = Arc::new(ScriptedChatClient::new());
        client
            .push_reply(
                &primary(),
                ScriptedReply::FailAfter(
                    vec!["garbage ".into()],
                    LlmError::Streaming {
                        message: "reset".into(),
                    },
                ),
            )
            .push_reply(&primary(), ScriptedReply::text("clean"));
        let (outcome, events) = run(client, false).await;
        assert_eq!(
            outcome,
            StageOutcome::Completed {
                content: "clean".into(),
                model: primary()
            }
        );
        // Already-emitted tokens are not retracted.
        assert!(events.contains(&PipelineEvent::StageContent {
            stage: 1,
            content: "garbage ".into()
        }));
    }

    #[tokio::test]
    async fn test_exhausted_non_final_is_skipped() {
        let client = Arc::new(ScriptedChatClient::new());
        for _ in 0..2 {
            client.push_reply(&primary(), ScriptedReply::fail("down"));
        }
        client.push_reply(
            &ModelRef::new(Provider::Gemini, "gemini-2.5-flash"),
            ScriptedReply::Fail(LlmError::Api {
                provider: Provider::Gemini,
                status: 503,
                message: "x".repeat(500),
            }),
        );
        let (outcome, events) = run(client, false).await;
        let StageOutcome::Skipped { error } = outcome else {
            panic!("expected skip");
        };
        assert_eq!(error.chars().count(), 200);
        assert!(matches!(events.last(), Some(PipelineEvent::StageSkipped { .. })));
    }

    #[tokio::test]
    async fn test_exhausted_final_without_fallback_fails() {
        let client = Arc::new(ScriptedChatClient::new());
        for p in [Provider::Gemini, Provider::Xai, Provider::OpenAi] {
            client.remove_credential(p);
        }
        for _ in 0..2 {
            client.push_reply(&primary(), ScriptedReply::fail("down"));
        }
        let (outcome, events) = run(client.clone(), true).await;
        assert!(matches!(outcome, StageOutcome::Failed { .. }));
        assert!(matches!(events.last(), Some(PipelineEvent::StageError { stage: 1, .. })));
        assert_eq!(client.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let client = Arc::new(ScriptedChatClient::new());
        client
            .push_reply(&primary(), ScriptedReply::Stall(vec![]))
            .push_reply(&primary(), ScriptedReply::text("late but fine"));
        let executor = StageExecutor::new(client, fallbacks(), Some(Duration::from_millis(50)));
        let (emitter, _rx) = EventEmitter::channel(64, CancellationToken::new());
        let outcome = executor.execute(1, false, &primary(), &req(), &emitter).await;
        assert!(matches!(outcome, StageOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_cancel_during_stream_stops_silently() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_reply(&primary(), ScriptedReply::Stall(vec!["a".into()]));
        let executor = StageExecutor::new(client.clone(), fallbacks(), None);
        let cancel = CancellationToken::new();
        let (emitter, mut rx) = EventEmitter::channel(64, cancel.clone());

        let handle = tokio::spawn(async move {
            executor.execute(1, false, &primary(), &req(), &emitter).await
        });
        assert!(matches!(rx.recv().await, Some(PipelineEvent::StageStart { .. })));
        assert!(matches!(rx.recv().await, Some(PipelineEvent::StageContent { .. })));
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), StageOutcome::Cancelled);
        assert_eq!(rx.recv().await, None);
        assert_eq!(client.calls().len(), 1);
    }
}
