//! Scripted chat client for tests and offline demos.
//!
//! Replies are queued per model and consumed one per call. Every call is
//! recorded so tests can assert on the prompts a stage received.

use super::{ChatClient, ChatRequest, TokenStream};
use crate::error::LlmError;
use crate::types::{ModelRef, Provider};
use async_trait::async_trait;
use futures::{StreamExt, stream};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// One scripted reply to a `stream` call.
#[derive(Debug)]
pub enum ScriptedReply {
    /// Stream these deltas, then end.
    Tokens(Vec<String>),
    /// Fail before yielding anything.
    Fail(LlmError),
    /// Stream these deltas, then fail mid-stream.
    FailAfter(Vec<String>, LlmError),
    /// Stream these deltas, then never finish.
    Stall(Vec<String>),
}

impl ScriptedReply {
    pub fn text(text: &str) -> Self {
        ScriptedReply::Tokens(vec![text.to_string()])
    }

    pub fn tokens(tokens: &[&str]) -> Self {
        ScriptedReply::Tokens(tokens.iter().map(|t| t.to_string()).collect())
    }

    /// A transport-level failure.
    pub fn fail(message: &str) -> Self {
        ScriptedReply::Fail(LlmError::Request {
            message: message.to_string(),
        })
    }
}

/// One queued answer to a `complete` call.
#[derive(Debug)]
enum ScriptedCompletion {
    Reply(Result<String, LlmError>),
    Stall,
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub model: ModelRef,
    pub request: ChatRequest,
    pub streaming: bool,
}

/// A [`ChatClient`] that replays queued replies.
///
/// A model with an empty queue streams `"<model> response"`. `complete`
/// consumes a separate queue and fails when it is empty.
pub struct ScriptedChatClient {
    replies: Mutex<HashMap<ModelRef, VecDeque<ScriptedReply>>>,
    completions: Mutex<VecDeque<ScriptedCompletion>>,
    credentials: Mutex<HashSet<Provider>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedChatClient {
    /// A client with credentials for every provider.
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            completions: Mutex::new(VecDeque::new()),
            credentials: Mutex::new(Provider::ALL.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply for the next `stream` call on `model`.
    pub fn push_reply(&self, model: &ModelRef, reply: ScriptedReply) -> &Self {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(model.clone())
            .or_default()
            .push_back(reply);
        self
    }

    /// Queue a result for the next `complete` call on any model.
    pub fn push_completion(&self, result: Result<String, LlmError>) -> &Self {
        self.completions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(ScriptedCompletion::Reply(result));
        self
    }

    /// Make the next `complete` call wait forever.
    pub fn push_stalled_completion(&self) -> &Self {
        self.completions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(ScriptedCompletion::Stall);
        self
    }

    pub fn remove_credential(&self, provider: Provider) -> &Self {
        self.credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&provider);
        self
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Streaming calls made against `model`.
    pub fn stream_calls_for(&self, model: &ModelRef) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.streaming && &c.model == model)
            .collect()
    }

    fn record(&self, model: &ModelRef, request: &ChatRequest, streaming: bool) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                model: model.clone(),
                request: request.clone(),
                streaming,
            });
    }

    fn check_credential(&self, provider: Provider) -> Result<(), LlmError> {
        if self.has_credential(provider) {
            Ok(())
        } else {
            Err(LlmError::MissingCredential { provider })
        }
    }
}

impl Default for ScriptedChatClient {
    fn default() -> Self {
        Self::new()
    }
}

fn ok_tokens(tokens: Vec<String>) -> impl futures::Stream<Item = Result<String, LlmError>> + Send {
    stream::iter(tokens.into_iter().map(Ok))
}

#[async_trait]
impl ChatClient for ScriptedChatClient {
    async fn stream(&self, model: &ModelRef, request: &ChatRequest) -> Result<TokenStream, LlmError> {
        self.record(model, request, true);
        self.check_credential(model.provider)?;

        let reply = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(model)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| ScriptedReply::Tokens(vec![format!("{} response", model.model)]));

        let tokens: TokenStream = match reply {
            ScriptedReply::Tokens(tokens) => Box::pin(ok_tokens(tokens)),
            ScriptedReply::Fail(err) => return Err(err),
            ScriptedReply::FailAfter(tokens, err) => {
                Box::pin(ok_tokens(tokens).chain(stream::once(async move { Err(err) })))
            }
            ScriptedReply::Stall(tokens) => Box::pin(ok_tokens(tokens).chain(stream::pending())),
        };
        Ok(tokens)
    }

    async fn complete(&self, model: &ModelRef, request: &ChatRequest) -> Result<String, LlmError> {
        self.record(model, request, false);
        self.check_credential(model.provider)?;
        let next = self
            .completions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(ScriptedCompletion::Reply(result)) => result,
            Some(ScriptedCompletion::Stall) => std::future::pending().await,
            None => Err(LlmError::Request {
                message: "no scripted completion".to_string(),
            }),
        }
    }

    fn has_credential(&self, provider: Provider) -> bool {
        self.credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&provider)
    }
}
