//! Query complexity classification.
//!
//! Scores a raw query with cheap lexical signals and maps the score to a
//! [`LengthConfig`]: a generation budget plus the length instructions each
//! stage role appends to its prompt. Pure and deterministic; no I/O.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Coarse size class of the expected answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Brief,
    Moderate,
    Detailed,
}

impl fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComplexityTier::Brief => write!(f, "brief"),
            ComplexityTier::Moderate => write!(f, "moderate"),
            ComplexityTier::Detailed => write!(f, "detailed"),
        }
    }
}

/// Budget and instructions for one run, computed once from the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthConfig {
    pub tier: ComplexityTier,
    pub max_tokens: u32,
    pub prompt_instruction: String,
    pub verify_instruction: String,
    pub final_instruction: String,
}

/// Budget and instructions attached to one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub max_tokens: u32,
    pub prompt_instruction: String,
    pub verify_instruction: String,
    pub final_instruction: String,
}

impl TierConfig {
    fn new(max_tokens: u32, prompt: &str, verify: &str, finale: &str) -> Self {
        Self {
            max_tokens,
            prompt_instruction: prompt.to_string(),
            verify_instruction: verify.to_string(),
            final_instruction: finale.to_string(),
        }
    }

    fn to_length_config(&self, tier: ComplexityTier) -> LengthConfig {
        LengthConfig {
            tier,
            max_tokens: self.max_tokens,
            prompt_instruction: self.prompt_instruction.clone(),
            verify_instruction: self.verify_instruction.clone(),
            final_instruction: self.final_instruction.clone(),
        }
    }
}

/// Scoring rules and tier data. The defaults are the production values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Inclusive word-count band worth +1.
    pub short_words: (usize, usize),
    /// Inclusive word-count band worth +2. Anything longer is worth +3.
    pub medium_words: (usize, usize),
    /// Regexes over the lowercased query; any match is worth +2 once.
    pub multi_part_patterns: Vec<String>,
    /// Each keyword present is worth +1, up to `depth_cap`.
    pub depth_keywords: Vec<String>,
    pub depth_cap: i32,
    /// The first pattern present is worth -2.
    pub simplicity_patterns: Vec<String>,
    /// Scores at or below this are brief.
    pub brief_max_score: i32,
    /// Scores at or below this (and above brief) are moderate.
    pub moderate_max_score: i32,
    pub brief: TierConfig,
    pub moderate: TierConfig,
    pub detailed: TierConfig,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            short_words: (9, 25),
            medium_words: (26, 50),
            multi_part_patterns: vec![
                "and also|additionally|furthermore|moreover".into(),
                r"\d+\.\s".into(),
                ";".into(),
            ],
            depth_keywords: [
                "explain",
                "analyze",
                "analyse",
                "compare",
                "contrast",
                "discuss",
                "step by step",
                "in detail",
                "elaborate",
                "comprehensive",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            depth_cap: 2,
            simplicity_patterns: [
                "what is",
                "what's",
                "define",
                "who is",
                "who's",
                "yes or no",
                "true or false",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            brief_max_score: 0,
            moderate_max_score: 3,
            brief: TierConfig::new(
                512,
                "Respond concisely. A few sentences is ideal.",
                "Keep your verification concise. Only flag real issues.",
                "Synthesize into a brief, direct answer.",
            ),
            moderate: TierConfig::new(
                1536,
                "Cover key points without excessive elaboration.",
                "Verify key claims. Be thorough but not verbose.",
                "Produce a clear, well-structured answer covering the key points.",
            ),
            detailed: TierConfig::new(
                3072,
                "Be thorough and comprehensive. Cover all aspects in depth.",
                "Conduct a thorough verification. Check every claim and add missing detail.",
                "Produce a comprehensive, detailed synthesis covering all aspects in depth.",
            ),
        }
    }
}

/// A classifier with its multi-part patterns compiled.
#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
    multi_part: Vec<Regex>,
}

static DEFAULT_CLASSIFIER: LazyLock<Classifier> =
    LazyLock::new(|| Classifier::new(ClassifierConfig::default()));

impl Classifier {
    /// Compile a classifier. Patterns that fail to compile are ignored.
    pub fn new(config: ClassifierConfig) -> Self {
        let multi_part = config
            .multi_part_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "Ignoring invalid multi-part pattern");
                    None
                }
            })
            .collect();
        Self { config, multi_part }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Additive complexity score of a query.
    pub fn score(&self, query: &str) -> i32 {
        let cfg = &self.config;
        let trimmed = query.trim();
        let lower = trimmed.to_lowercase();
        let word_count = trimmed.split_whitespace().count();

        let mut score = 0;

        if (cfg.short_words.0..=cfg.short_words.1).contains(&word_count) {
            score += 1;
        } else if (cfg.medium_words.0..=cfg.medium_words.1).contains(&word_count) {
            score += 2;
        } else if word_count > cfg.medium_words.1 {
            score += 3;
        }

        if query.matches('?').count() >= 2 {
            score += 2;
        }

        if self.multi_part.iter().any(|re| re.is_match(&lower)) {
            score += 2;
        }

        let depth_hits = cfg
            .depth_keywords
            .iter()
            .filter(|k| lower.contains(k.as_str()))
            .count() as i32;
        score += depth_hits.min(cfg.depth_cap);

        if cfg.simplicity_patterns.iter().any(|p| lower.contains(p.as_str())) {
            score -= 2;
        }

        score
    }

    pub fn tier_for_score(&self, score: i32) -> ComplexityTier {
        if score <= self.config.brief_max_score {
            ComplexityTier::Brief
        } else if score <= self.config.moderate_max_score {
            ComplexityTier::Moderate
        } else {
            ComplexityTier::Detailed
        }
    }

    pub fn classify(&self, query: &str) -> LengthConfig {
        let score = self.score(query);
        let tier = self.tier_for_score(score);
        tracing::debug!(score, %tier, "Classified query complexity");
        let tier_config = match tier {
            ComplexityTier::Brief => &self.config.brief,
            ComplexityTier::Moderate => &self.config.moderate,
            ComplexityTier::Detailed => &self.config.detailed,
        };
        tier_config.to_length_config(tier)
    }
}

/// Classify with the default rules.
pub fn classify(query: &str) -> LengthConfig {
    DEFAULT_CLASSIFIER.classify(query)
}
