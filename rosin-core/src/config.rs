//! Configuration system for Rosin.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/rosin/config.toml` and/or `.rosin/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::ClassifierConfig;
use crate::credentials::EnvCredentialStore;
use crate::error::ConfigError;
use crate::gateway::GatewayConfig;
use crate::types::{ModelRef, Provider};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RosinConfig {
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl RosinConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                message: "pipeline.event_channel_capacity must be at least 1".into(),
            });
        }
        if self.pipeline.attempt_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid {
                message: "pipeline.attempt_timeout_secs must be positive when set".into(),
            });
        }
        let c = &self.classifier;
        if !(c.brief.max_tokens < c.moderate.max_tokens && c.moderate.max_tokens < c.detailed.max_tokens) {
            return Err(ConfigError::Invalid {
                message: "classifier token budgets must strictly increase brief < moderate < detailed"
                    .into(),
            });
        }
        Ok(())
    }
}

/// Per-provider connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Base URL override (proxies, self-hosted gateways, test servers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl ProviderSettings {
    fn for_provider(provider: Provider) -> Self {
        Self {
            base_url: None,
            api_key_env: provider.default_api_key_env().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub openai: ProviderSettings,
    pub anthropic: ProviderSettings,
    pub gemini: ProviderSettings,
    pub xai: ProviderSettings,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai: ProviderSettings::for_provider(Provider::OpenAi),
            anthropic: ProviderSettings::for_provider(Provider::Anthropic),
            gemini: ProviderSettings::for_provider(Provider::Gemini),
            xai: ProviderSettings::for_provider(Provider::Xai),
        }
    }
}

impl ProvidersConfig {
    pub fn settings(&self, provider: Provider) -> &ProviderSettings {
        match provider {
            Provider::OpenAi => &self.openai,
            Provider::Anthropic => &self.anthropic,
            Provider::Gemini => &self.gemini,
            Provider::Xai => &self.xai,
        }
    }

    pub fn settings_mut(&mut self, provider: Provider) -> &mut ProviderSettings {
        match provider {
            Provider::OpenAi => &mut self.openai,
            Provider::Anthropic => &mut self.anthropic,
            Provider::Gemini => &mut self.gemini,
            Provider::Xai => &mut self.xai,
        }
    }

    /// Effective base URL, without a trailing slash.
    pub fn base_url(&self, provider: Provider) -> String {
        self.settings(provider)
            .base_url
            .as_deref()
            .unwrap_or_else(|| provider.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    /// Environment-backed credential store honoring each provider's `api_key_env`.
    pub fn env_credential_store(&self) -> EnvCredentialStore {
        Provider::ALL.iter().fold(EnvCredentialStore::new(), |store, p| {
            store.with_var(*p, self.settings(*p).api_key_env.clone())
        })
    }
}

/// Pipeline-level behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Attempt-3 candidates, tried in order; the first with a different
    /// provider than the failing primary and an available credential wins.
    pub fallback_candidates: Vec<ModelRef>,
    /// Analyzer candidates, tried in order; the first with a credential wins.
    pub analyzer_candidates: Vec<ModelRef>,
    /// Per-attempt timeout. `None` waits indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_secs: Option<u64>,
    /// Capacity of the bounded event channel.
    pub event_channel_capacity: usize,
    /// Generation budget for the analyzer call.
    pub analyzer_max_tokens: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fallback_candidates: vec![
                ModelRef::new(Provider::Gemini, "gemini-2.5-flash"),
                ModelRef::new(Provider::Xai, "grok-3-fast"),
                ModelRef::new(Provider::Anthropic, "claude-haiku-4-5"),
                ModelRef::new(Provider::OpenAi, "gpt-4o-mini"),
            ],
            analyzer_candidates: vec![
                ModelRef::new(Provider::Gemini, "gemini-2.5-flash"),
                ModelRef::new(Provider::OpenAi, "gpt-4o-mini"),
                ModelRef::new(Provider::Xai, "grok-3-fast"),
                ModelRef::new(Provider::Anthropic, "claude-haiku-4-5"),
            ],
            attempt_timeout_secs: None,
            event_channel_capacity: 256,
            analyzer_max_tokens: 1024,
        }
    }
}

impl PipelineConfig {
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_secs.map(Duration::from_secs)
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "rosin", "rosin")
}

/// Path of the user-level config file, if a home directory exists.
pub fn user_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

/// Load configuration from all sources, merging in order:
/// 1. Built-in defaults
/// 2. User config file (`~/.config/rosin/config.toml`)
/// 3. Workspace config file (`.rosin/config.toml`)
/// 4. Environment variables (`ROSIN_` prefix)
/// 5. Explicit overrides
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&RosinConfig>,
) -> Result<RosinConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(RosinConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".rosin").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // ROSIN_GATEWAY__PORT, ROSIN_PIPELINE__ATTEMPT_TIMEOUT_SECS, etc.
    figment = figment.merge(Env::prefixed("ROSIN_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: RosinConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

/// Check whether any Rosin configuration file exists (user-level or workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| ws.join(".rosin").join("config.toml").exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = RosinConfig::default();
        assert_eq!(config.pipeline.fallback_candidates.len(), 4);
        assert_eq!(config.pipeline.fallback_candidates[0].model, "gemini-2.5-flash");
        assert_eq!(config.pipeline.analyzer_max_tokens, 1024);
        assert_eq!(config.providers.xai.api_key_env, "XAI_API_KEY");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_base_url_resolution() {
        let mut providers = ProvidersConfig::default();
        assert_eq!(providers.base_url(Provider::Xai), "https://api.x.ai/v1");
        providers.settings_mut(Provider::OpenAi).base_url = Some("http://localhost:9000/v1/".into());
        assert_eq!(providers.base_url(Provider::OpenAi), "http://localhost:9000/v1");
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = RosinConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: RosinConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = RosinConfig::default();
        overrides.gateway.port = 9191;
        overrides.pipeline.attempt_timeout_secs = Some(30);

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.gateway.port, 9191);
        assert_eq!(config.pipeline.attempt_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let rosin_dir = dir.path().join(".rosin");
        std::fs::create_dir_all(&rosin_dir).unwrap();
        std::fs::write(
            rosin_dir.join("config.toml"),
            r#"
[providers.openai]
base_url = "http://127.0.0.1:4000/v1"
api_key_env = "PROXY_KEY"

[pipeline]
attempt_timeout_secs = 45
analyzer_candidates = [{ provider = "openai", model = "gpt-4o-mini" }]

[classifier.brief]
max_tokens = 256
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.providers.base_url(Provider::OpenAi), "http://127.0.0.1:4000/v1");
        assert_eq!(config.providers.openai.api_key_env, "PROXY_KEY");
        assert_eq!(config.pipeline.attempt_timeout_secs, Some(45));
        assert_eq!(config.pipeline.analyzer_candidates.len(), 1);
        assert_eq!(config.classifier.brief.max_tokens, 256);
        // Untouched sections keep their defaults.
        assert_eq!(config.classifier.detailed.max_tokens, 3072);
        assert_eq!(config.pipeline.fallback_candidates.len(), 4);
        assert!(config_exists(Some(dir.path())));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = RosinConfig::default();
        config.pipeline.event_channel_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_validate_rejects_non_increasing_budgets() {
        let mut config = RosinConfig::default();
        config.classifier.moderate.max_tokens = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_credential_store_uses_configured_vars() {
        let mut providers = ProvidersConfig::default();
        providers.gemini.api_key_env = "GOOGLE_API_KEY".into();
        let store = providers.env_credential_store();
        assert_eq!(store.var_for(Provider::Gemini), "GOOGLE_API_KEY");
    }
}
