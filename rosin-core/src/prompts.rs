//! Stage prompt construction.
//!
//! Each stage gets a role-specific system prompt (initial answer, cross-check,
//! or final synthesis) with the run's length instruction appended, and a user
//! message carrying the query plus every completed prior stage.

use crate::classifier::LengthConfig;
use crate::types::{StageResult, StageStatus};

/// System prompt and user message for one stage call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePrompt {
    pub system_prompt: String,
    pub user_content: String,
}

/// Role a stage plays in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Initial,
    Verifier,
    Final,
}

impl StageRole {
    /// Stage 1 is initial; the last stage is final (it wins over verifier for 2-stage chains).
    pub fn for_stage(stage: usize, total_stages: usize) -> Self {
        if stage <= 1 {
            StageRole::Initial
        } else if stage >= total_stages {
            StageRole::Final
        } else {
            StageRole::Verifier
        }
    }
}

const INITIAL_PROMPT: &str = "You are the first stage of a multi-LLM verification pipeline. \
Your task is to provide an initial, thorough response to the user's query. \
Focus on accuracy and comprehensive coverage of the topic.\n\n\
Be factual and cite any assumptions you make. If you're uncertain about something, acknowledge it.";

const FINAL_PROMPT: &str = "You are the final stage of a multi-LLM verification pipeline. \
You produce the definitive, verified response.\n\n\
Your tasks:\n\
1. Review every previous stage and note where they agree and where they disagree\n\
2. Where stages conflict, state the best-supported conclusion\n\
3. Synthesize all previous stages into one clear final answer\n\
4. Remove any redundancy\n\
5. Note any remaining caveats or areas of genuine uncertainty\n\n\
Produce the final verified response that best answers the user's original query.";

fn verifier_prompt(stage: usize) -> String {
    format!(
        "You are stage {stage} of a multi-LLM verification pipeline. \
You are reviewing and verifying the previous stages' output.\n\n\
Your tasks:\n\
1. Verify the factual accuracy of every previous response\n\
2. Cross-check the previous stages against each other and against your knowledge\n\
3. Identify any potential errors, hallucinations, or unsupported claims\n\
4. Correct any inaccuracies you find\n\
5. Add any important information that was missed\n\
6. Improve clarity where needed\n\n\
Provide a refined and verified version of the response."
    )
}

fn adversarial_prompt(stage: usize) -> String {
    format!(
        "You are stage {stage} of a multi-LLM verification pipeline, acting as an adversarial reviewer. \
Assume the previous stages contain mistakes until proven otherwise.\n\n\
Your tasks:\n\
1. Aggressively hunt for factual errors, hallucinations, and unsupported claims\n\
2. Challenge every assumption, including ones the previous stages agree on\n\
3. Point out missing counterarguments, edge cases, and overconfident statements\n\
4. Reject anything you cannot confirm rather than repeating it\n\n\
Then provide a hardened, corrected version of the response that survives your scrutiny."
    )
}

/// Build the prompt for `stage` (1-based) of a `total_stages` chain.
///
/// `prior_stages` may contain any results so far; only completed ones are quoted.
pub fn build_stage_prompt(
    stage: usize,
    total_stages: usize,
    query: &str,
    prior_stages: &[StageResult],
    length: &LengthConfig,
    adversarial: bool,
) -> StagePrompt {
    let role = StageRole::for_stage(stage, total_stages);
    let (base, instruction) = match role {
        StageRole::Initial => (INITIAL_PROMPT.to_string(), &length.prompt_instruction),
        StageRole::Verifier if adversarial => (adversarial_prompt(stage), &length.verify_instruction),
        StageRole::Verifier => (verifier_prompt(stage), &length.verify_instruction),
        StageRole::Final => (FINAL_PROMPT.to_string(), &length.final_instruction),
    };

    let system_prompt = format!("{base}\n\n{instruction}");

    let mut user_content = format!("Original Query: {query}");
    if role != StageRole::Initial {
        for prior in prior_stages
            .iter()
            .filter(|s| s.status == StageStatus::Complete && s.stage < stage)
        {
            user_content.push_str(&format!(
                "\n\n--- Stage {} ({}) ---\n{}",
                prior.stage,
                prior.model.label(),
                prior.content
            ));
        }
    }

    StagePrompt {
        system_prompt,
        user_content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;
    use crate::types::{ModelRef, Provider};

    fn done(stage: usize, provider: Provider, model: &str, text: &str) -> StageResult {
        StageResult::completed(stage, ModelRef::new(provider, model), text)
    }

    #[test]
    fn test_first_stage_prompt() {
        let length = classify("What is the capital of France?");
        let p = build_stage_prompt(1, 3, "What is the capital of France?", &[], &length, false);
        assert!(p.system_prompt.starts_with("You are the first stage"));
        assert!(p.system_prompt.ends_with(&length.prompt_instruction));
        assert_eq!(p.user_content, "Original Query: What is the capital of France?");
    }

    #[test]
    fn test_middle_stage_quotes_all_priors() {
        let length = classify("q");
        let priors = vec![done(1, Provider::Anthropic, "claude-sonnet-4-5", "Paris.")];
        let p = build_stage_prompt(2, 3, "q", &priors, &length, false);
        assert!(p.system_prompt.starts_with("You are stage 2"));
        assert!(p.system_prompt.ends_with(&length.verify_instruction));
        assert!(p.user_content.contains("--- Stage 1 (Anthropic / claude-sonnet-4-5) ---\nParis."));
    }

    #[test]
    fn test_adversarial_middle_stage() {
        let length = classify("q");
        let p = build_stage_prompt(2, 4, "q", &[], &length, true);
        assert!(p.system_prompt.contains("adversarial reviewer"));
        assert!(p.system_prompt.contains("Challenge every assumption"));
        assert!(p.system_prompt.ends_with(&length.verify_instruction));
    }

    #[test]
    fn test_two_stage_chain_final_wins() {
        let length = classify("q");
        let p = build_stage_prompt(2, 2, "q", &[], &length, true);
        assert!(p.system_prompt.starts_with("You are the final stage"));
        assert!(p.system_prompt.ends_with(&length.final_instruction));
        assert!(!p.system_prompt.contains("adversarial"));
    }

    #[test]
    fn test_skipped_stage_not_quoted() {
        let length = classify("q");
        let mut skipped = StageResult::streaming(2, ModelRef::new(Provider::Gemini, "gemini-2.5-pro"));
        skipped.status = StageStatus::Skipped;
        skipped.content = "partial garbage".into();
        let priors = vec![done(1, Provider::OpenAi, "gpt-4o", "A"), skipped];
        let p = build_stage_prompt(3, 3, "q", &priors, &length, false);
        assert!(p.user_content.contains("--- Stage 1"));
        assert!(!p.user_content.contains("Stage 2"));
        assert!(!p.user_content.contains("partial garbage"));
    }

    #[test]
    fn test_stage_role() {
        assert_eq!(StageRole::for_stage(1, 2), StageRole::Initial);
        assert_eq!(StageRole::for_stage(2, 2), StageRole::Final);
        assert_eq!(StageRole::for_stage(2, 3), StageRole::Verifier);
        assert_eq!(StageRole::for_stage(4, 4), StageRole::Final);
    }
}
