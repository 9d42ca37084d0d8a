//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::KeyAction;
use crate::render::EventRenderer;
use anyhow::Context;
use rosin_core::config::config_exists;
use rosin_core::credentials::{CredentialStore, KeyringCredentialStore};
use rosin_core::gateway::{GatewayState, run_gateway};
use rosin_core::{
    Chain, ChatClient, Classifier, HttpChatClient, InMemoryRunLog, LayeredCredentialStore,
    ModelRef, NoopRecorder, Provider, RosinConfig, RunOutcome, RunRecord, RunRequest,
    StageStatus, VerificationPipeline,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Verify {
            query,
            chain,
            stages,
            adversarial,
            json,
        } => handle_verify(workspace, query, &chain, stages, adversarial, json).await,
        Commands::Classify { query } => handle_classify(workspace, &query),
        Commands::Serve { host, port } => handle_serve(workspace, host, port).await,
        Commands::Models => handle_models(workspace),
        Commands::Key { action } => handle_key(action),
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn load_config(workspace: &Path) -> anyhow::Result<RosinConfig> {
    rosin_core::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn http_client(config: &RosinConfig) -> anyhow::Result<Arc<HttpChatClient>> {
    let credentials = LayeredCredentialStore::env_then_keyring(config.providers.env_credential_store());
    let client = HttpChatClient::new(config.providers.clone(), Arc::new(credentials))?;
    Ok(Arc::new(client))
}

/// An explicit `--chain` wins; otherwise the default chain for `stages`.
fn resolve_chain(chain: &[String], stages: u8) -> anyhow::Result<Chain> {
    if chain.is_empty() {
        return Ok(if stages == 2 {
            Chain::default_two()
        } else {
            Chain::default_three()
        });
    }
    let models = chain
        .iter()
        .map(|s| s.parse::<ModelRef>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Chain::new(models)?)
}

async fn handle_verify(
    workspace: &Path,
    query: String,
    chain: &[String],
    stages: u8,
    adversarial: bool,
    json: bool,
) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let chain = resolve_chain(chain, stages)?;
    let client = http_client(&config)?;

    for model in chain.models() {
        if !client.has_credential(model.provider) {
            eprintln!(
                "Warning: no API key for {} (set {} or run `rosin key set {}`); fallbacks will be used.",
                model.provider,
                config.providers.settings(model.provider).api_key_env,
                model.provider.id()
            );
        }
    }

    let pipeline = Arc::new(VerificationPipeline::from_config(
        &config,
        client,
        Arc::new(NoopRecorder),
    ));
    let cancel = CancellationToken::new();
    let request = RunRequest::new(query, chain.models().to_vec()).adversarial(adversarial);
    let mut handle = pipeline.spawn(request, cancel.clone())?;

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, cancelling run");
            ctrl_c.cancel();
        }
    });

    let mut renderer = EventRenderer::new(std::io::stdout().lock(), json);
    while let Some(event) = handle.events.recv().await {
        renderer.render(&event)?;
    }
    drop(renderer);

    match handle.task.await.context("verification task failed")? {
        Ok(RunOutcome::Completed(record)) => {
            if !json {
                eprintln!("{}", completion_line(&record));
            }
            Ok(())
        }
        Ok(RunOutcome::Cancelled) => {
            eprintln!("Run cancelled.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn completion_line(record: &RunRecord) -> String {
    let completed = record
        .stages
        .iter()
        .filter(|s| s.status == StageStatus::Complete)
        .count();
    format!(
        "Run {} verified {completed}/{} stages via {}",
        record.id,
        record.chain.len(),
        record.chain_summary()
    )
}

fn handle_classify(workspace: &Path, query: &str) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let classifier = Classifier::new(config.classifier);
    let score = classifier.score(query);
    let length = classifier.classify(query);
    println!("Tier:       {}", length.tier);
    println!("Score:      {score}");
    println!("Max tokens: {}", length.max_tokens);
    println!("Guidance:   {}", length.prompt_instruction);
    Ok(())
}

async fn handle_serve(workspace: &Path, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = load_config(workspace)?;
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let client = http_client(&config)?;
    let runs = Arc::new(InMemoryRunLog::default());
    let pipeline = VerificationPipeline::from_config(&config, client, runs.clone());
    let state = Arc::new(GatewayState::new(config.gateway.clone(), Arc::new(pipeline), runs));
    if config.gateway.auth_tokens.is_empty() {
        tracing::warn!("Gateway running in open mode (no auth tokens configured)");
    }
    println!(
        "Rosin gateway listening on http://{}:{}",
        config.gateway.host, config.gateway.port
    );
    run_gateway(state).await.context("gateway stopped")?;
    Ok(())
}

fn handle_models(workspace: &Path) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let credentials = LayeredCredentialStore::env_then_keyring(config.providers.env_credential_store());
    for provider in Provider::ALL {
        let status = if credentials.has_key(provider) {
            "key found"
        } else {
            "no key"
        };
        println!("{} ({status})", provider.display_name());
        for model in provider.catalog_models() {
            println!("  {}:{}", provider.id(), model);
        }
    }
    println!("\nDefault 3-stage chain: {}", chain_line(&Chain::default_three()));
    println!("Default 2-stage chain: {}", chain_line(&Chain::default_two()));
    Ok(())
}

fn chain_line(chain: &Chain) -> String {
    chain
        .models()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn handle_key(action: KeyAction) -> anyhow::Result<()> {
    let store = KeyringCredentialStore::new();
    match action {
        KeyAction::Set { provider } => {
            let provider: Provider = provider.parse()?;
            let api_key: String = dialoguer::Password::new()
                .with_prompt(format!("Enter your {} API key", provider.display_name()))
                .interact()?;
            let api_key = api_key.trim();
            if api_key.is_empty() {
                anyhow::bail!("API key must not be empty");
            }
            store.store_key(provider, api_key)?;
            println!("Stored {} API key in the OS keyring.", provider.display_name());
        }
        KeyAction::Remove { provider } => {
            let provider: Provider = provider.parse()?;
            store.delete_key(provider)?;
            println!("Removed {} API key from the OS keyring.", provider.display_name());
        }
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".rosin");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&RosinConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!("Created default configuration at: {}", config_path.display());
            Ok(())
        }
        ConfigAction::Show => {
            print!("{}", show_config(workspace)?);
            Ok(())
        }
    }
}

/// The effective configuration as TOML, flagged when no file contributed to it.
fn show_config(workspace: &Path) -> anyhow::Result<String> {
    let config = load_config(workspace)?;
    let mut out = String::new();
    if !config_exists(Some(workspace)) {
        out.push_str("# No configuration file found; showing defaults.\n");
    }
    out.push_str(&toml::to_string_pretty(&config)?);
    Ok(out)
}
