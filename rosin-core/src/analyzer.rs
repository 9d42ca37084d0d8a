//! Consensus analysis over completed stages.
//!
//! One extra non-streaming call asks a model for a strict-JSON judgment of
//! agreement, hallucination risk, and confidence across the stages. Any
//! failure downgrades to a deterministic heuristic built from stage counts.

use crate::providers::{ChatClient, ChatRequest};
use crate::types::{Contradiction, ModelRef, PipelineRun, VerificationSummary};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const ANALYZER_SYSTEM_PROMPT: &str = "You are a verification analyst. You will receive a user query \
and the responses of several independent LLM stages that answered and cross-checked it.\n\n\
Compare the stages and respond with ONLY a JSON object, no prose and no code fences, with exactly these keys:\n\
{\n\
  \"consistencySummary\": string, how consistent the stages are with each other,\n\
  \"hallucinationRisk\": string, any claims that look fabricated or unsupported,\n\
  \"confidenceLevel\": one of \"High\", \"Moderate\", \"Low\",\n\
  \"confidenceScore\": number between 0 and 1,\n\
  \"contradictions\": [{\"topic\": string, \"stageA\": number, \"stageB\": number, \"description\": string}]\n\
}\n\n\
Use the stage numbers exactly as given. Use an empty array when the stages agree.";

/// The analyzer model's raw judgment.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisResponse {
    consistency_summary: String,
    hallucination_risk: String,
    confidence_level: String,
    #[serde(default)]
    confidence_score: Option<f64>,
    #[serde(default)]
    contradictions: Vec<AnalysisContradiction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisContradiction {
    topic: String,
    stage_a: i64,
    stage_b: i64,
    description: String,
}

/// Produces the terminal [`VerificationSummary`] of a run.
pub struct ConsensusAnalyzer {
    client: Arc<dyn ChatClient>,
    candidates: Vec<ModelRef>,
    max_tokens: u32,
}

impl ConsensusAnalyzer {
    pub fn new(client: Arc<dyn ChatClient>, candidates: Vec<ModelRef>, max_tokens: u32) -> Self {
        Self {
            client,
            candidates,
            max_tokens,
        }
    }

    /// First candidate with an available credential.
    pub fn select_model(&self) -> Option<&ModelRef> {
        self.candidates
            .iter()
            .find(|m| self.client.has_credential(m.provider))
    }

    /// Never fails: analyzer problems fall back to [`heuristic_summary`].
    pub async fn analyze(&self, run: &PipelineRun) -> VerificationSummary {
        if run.completed_stages.len() < 2 {
            debug!(
                completed = run.completed_stages.len(),
                "Too few completed stages for analysis"
            );
            return heuristic_summary(run);
        }

        let Some(model) = self.select_model() else {
            warn!("No analyzer model has a credential, using heuristic summary");
            return heuristic_summary(run);
        };

        let request = ChatRequest::new(ANALYZER_SYSTEM_PROMPT, analyzer_input(run), self.max_tokens);
        info!(model = %model, stages = run.completed_stages.len(), "Running consensus analysis");

        let text = match self.client.complete(model, &request).await {
            Ok(text) => text,
            Err(e) => {
                warn!(model = %model, error = %e, "Analyzer call failed, using heuristic summary");
                return heuristic_summary(run);
            }
        };

        match parse_analysis(&text) {
            Ok(response) => {
                let completed: HashSet<usize> =
                    run.completed_stages.iter().map(|s| s.stage).collect();
                into_summary(response, &completed)
            }
            Err(e) => {
                let preview: String = text.chars().take(200).collect();
                warn!(error = %e, response_preview = %preview, "Analyzer returned unparseable JSON, using heuristic summary");
                heuristic_summary(run)
            }
        }
    }
}

/// User message for the analyzer: the query plus every completed stage.
fn analyzer_input(run: &PipelineRun) -> String {
    let mut input = format!("Original Query: {}", run.query);
    for stage in &run.completed_stages {
        input.push_str(&format!(
            "\n\n--- Stage {} ({}) ---\n{}",
            stage.stage,
            stage.model.label(),
            stage.content
        ));
    }
    input
}

/// Parse the analyzer reply, retrying once with markdown code fences removed.
fn parse_analysis(text: &str) -> Result<AnalysisResponse, serde_json::Error> {
    serde_json::from_str(text.trim()).or_else(|_| serde_json::from_str(strip_code_fences(text)))
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .trim_end()
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

fn into_summary(response: AnalysisResponse, completed: &HashSet<usize>) -> VerificationSummary {
    let score = response
        .confidence_score
        .filter(|s| s.is_finite())
        .map(|s| s.clamp(0.0, 1.0));
    let level = response.confidence_level.trim().to_string();
    let confidence = match score {
        Some(s) => format!("{level} ({}%)", (s * 100.0).round() as u32),
        None => level,
    };

    let references_completed =
        |i: i64| usize::try_from(i).is_ok_and(|i| completed.contains(&i));
    let contradictions = response
        .contradictions
        .into_iter()
        .filter(|c| references_completed(c.stage_a) && references_completed(c.stage_b))
        .map(|c| Contradiction {
            topic: c.topic,
            stage_a: c.stage_a as usize,
            stage_b: c.stage_b as usize,
            description: c.description,
        })
        .collect();

    VerificationSummary {
        consistency: response.consistency_summary,
        hallucinations: response.hallucination_risk,
        confidence,
        confidence_score: score,
        contradictions,
        is_analyzed: true,
    }
}

/// Deterministic summary from stage counts alone.
pub fn heuristic_summary(run: &PipelineRun) -> VerificationSummary {
    let completed = run.completed_stages.len();
    let total = run.total_stages();
    let skipped = run.skipped_stages();

    let consistency = if completed < 2 {
        format!(
            "Insufficient stages for cross-verification ({completed} of {total} completed)"
        )
    } else if skipped > 0 {
        format!("Cross-verified across {completed} of {total} stages ({skipped} skipped)")
    } else {
        format!("Cross-verified across {completed} of {total} stages")
    };

    let hallucinations = if skipped > 0 {
        format!(
            "Checked at each completed stage; {skipped} stage(s) skipped, so coverage is reduced"
        )
    } else {
        "Checked at each stage - potential issues flagged".to_string()
    };

    let confidence = match completed {
        n if n >= 3 => "High",
        2 => "Moderate",
        _ => "Low",
    }
    .to_string();

    VerificationSummary {
        consistency,
        hallucinations,
        confidence,
        confidence_score: None,
        contradictions: Vec::new(),
        is_analyzed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;
    use crate::error::LlmError;
    use crate::providers::ScriptedChatClient;
    use crate::types::{Chain, Provider, StageResult};
    use pretty_assertions::assert_eq;

    fn run_with(completed: &[usize], total: usize) -> PipelineRun {
        let chain = match total {
            2 => Chain::default_two(),
            _ => Chain::default_three(),
        };
        let mut run = PipelineRun::new("q".into(), chain.clone(), classify("q"), false);
        for &stage in completed {
            let model = chain.stage_model(stage).cloned().unwrap();
            run.completed_stages
                .push(StageResult::completed(stage, model, format!("answer {stage}")));
        }
        run
    }

    fn analyzer(client: Arc<ScriptedChatClient>) -> ConsensusAnalyzer {
        ConsensusAnalyzer::new(
            client,
            vec![
                ModelRef::new(Provider::Gemini, "gemini-2.5-flash"),
                ModelRef::new(Provider::OpenAi, "gpt-4o-mini"),
            ],
            1024,
        )
    }

    const GOOD_JSON: &str = r#"{
        "consistencySummary": "Stages agree on the core answer.",
        "hallucinationRisk": "Low",
        "confidenceLevel": "High",
        "confidenceScore": 0.87,
        "contradictions": [
            {"topic": "date", "stageA": 1, "stageB": 3, "description": "1889 vs 1887"},
            {"topic": "ghost", "stageA": 2, "stageB": 9, "description": "bad index"}
        ]
    }"#;

    #[test]
    fn test_heuristic_one_stage() {
        let summary = heuristic_summary(&run_with(&[1], 3));
        assert!(!summary.is_analyzed);
        assert_eq!(summary.confidence, "Low");
        assert!(summary.consistency.starts_with("Insufficient stages"));
        assert!(summary.contradictions.is_empty());
    }

    #[test]
    fn test_heuristic_skipped_stage() {
        let summary = heuristic_summary(&run_with(&[1, 3], 3));
        assert_eq!(summary.consistency, "Cross-verified across 2 of 3 stages (1 skipped)");
        assert_eq!(summary.confidence, "Moderate");
        assert!(summary.hallucinations.contains("coverage is reduced"));
    }

    #[test]
    fn test_heuristic_full_run() {
        let summary = heuristic_summary(&run_with(&[1, 2, 3], 3));
        assert_eq!(summary.consistency, "Cross-verified across 3 of 3 stages");
        assert_eq!(summary.confidence, "High");
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```\n"), "{}");
        assert_eq!(strip_code_fences("{}"), "{}");
    }

    #[test]
    fn test_into_summary_filters_and_formats() {
        let response = parse_analysis(GOOD_JSON).unwrap();
        let completed: HashSet<usize> = [1, 2, 3].into_iter().collect();
        let summary = into_summary(response, &completed);
        assert_eq!(summary.confidence, "High (87%)");
        assert_eq!(summary.confidence_score, Some(0.87));
        assert_eq!(summary.contradictions.len(), 1);
        assert_eq!(summary.contradictions[0].stage_b, 3);
        assert!(summary.is_analyzed);
    }

    #[test]
    fn test_score_clamped() {
        let json = r#"{"consistencySummary":"c","hallucinationRisk":"h","confidenceLevel":"Low","confidenceScore":1.7}"#;
        let summary = into_summary(parse_analysis(json).unwrap(), &HashSet::new());
        assert_eq!(summary.confidence_score, Some(1.0));
        assert_eq!(summary.confidence, "Low (100%)");
    }

    #[test]
    fn test_missing_score_uses_level() {
        let json = r#"{"consistencySummary":"c","hallucinationRisk":"h","confidenceLevel":"Moderate","contradictions":[]}"#;
        let summary = into_summary(parse_analysis(json).unwrap(), &HashSet::new());
        assert_eq!(summary.confidence, "Moderate");
        assert_eq!(summary.confidence_score, None);
    }

    #[tokio::test]
    async fn test_analyze_fenced_json() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_completion(Ok(format!("```json\n{GOOD_JSON}\n```")));
        let summary = analyzer(client.clone()).analyze(&run_with(&[1, 2, 3], 3)).await;
        assert!(summary.is_analyzed);
        assert_eq!(summary.contradictions.len(), 1);

        let call = &client.calls()[0];
        assert!(!call.streaming);
        assert_eq!(call.request.max_tokens, 1024);
        assert_eq!(call.model.model, "gemini-2.5-flash");
        assert!(call.request.user_content.contains("--- Stage 3"));
    }

    #[tokio::test]
    async fn test_analyze_picks_first_credentialed_candidate() {
        let client = Arc::new(ScriptedChatClient::new());
        client.remove_credential(Provider::Gemini);
        client.push_completion(Ok(GOOD_JSON.to_string()));
        analyzer(client.clone()).analyze(&run_with(&[1, 2], 2)).await;
        assert_eq!(client.calls()[0].model.provider, Provider::OpenAi);
    }

    #[tokio::test]
    async fn test_analyze_garbage_downgrades() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_completion(Ok("I think they mostly agree.".into()));
        let summary = analyzer(client).analyze(&run_with(&[1, 2, 3], 3)).await;
        assert!(!summary.is_analyzed);
        assert_eq!(summary.confidence, "High");
    }

    #[tokio::test]
    async fn test_analyze_call_error_downgrades() {
        let client = Arc::new(ScriptedChatClient::new());
        client.push_completion(Err(LlmError::Api {
            provider: Provider::Gemini,
            status: 500,
            message: "oops".into(),
        }));
        let summary = analyzer(client).analyze(&run_with(&[1, 2], 2)).await;
        assert!(!summary.is_analyzed);
    }

    #[tokio::test]
    async fn test_analyze_single_stage_skips_call() {
        let client = Arc::new(ScriptedChatClient::new());
        let summary = analyzer(client.clone()).analyze(&run_with(&[1], 3)).await;
        assert!(!summary.is_analyzed);
        assert!(client.calls().is_empty());
    }
}
