// cuebridge - caption translation daemon and CLI
// Author: kelexine (https://github.com/kelexine)

use anyhow::{bail, Context, Result};
use clap::Parser;
use cuebridge::auth::SessionExport;
use cuebridge::cache::{CacheEntrySummary, CacheManager, KeyFilter};
use cuebridge::cli::{Args, CacheCommand, Command, SessionCommand};
use cuebridge::config::AppConfig;
use cuebridge::credentials::CredentialStore;
use cuebridge::models::CaptureTrack;
use cuebridge::orchestrator::{BatchProgress, BatchRequest, Orchestrator};
use cuebridge::providers::{ProviderEnv, ProviderKind, ProviderRegistry};
use cuebridge::server::create_router;
use cuebridge::utils::logging;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Phase 1: Load configuration
    let config = AppConfig::load(args.config.as_deref())?;

    // Phase 2: Initialize logging
    logging::init(&config.logging)?;
    info!("Starting cuebridge v{}", env!("CARGO_PKG_VERSION"));

    // Phase 3: Dispatch
    match args.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Serve { host, port } => serve(config, host, port).await,
        Command::Translate {
            input,
            target,
            provider,
            output,
        } => translate(config, &input, target, provider, output.as_deref()).await,
        Command::Session { action } => session(config, action).await,
        Command::Cache { action } => cache(config, action).await,
    }
}

/// Credential store and refresh skew shared by all provider constructors.
fn provider_env(config: &AppConfig) -> ProviderEnv {
    let credentials = match CredentialStore::from_config(&config.credentials) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!("Credential store unavailable, sessions stay in memory: {}", e);
            None
        }
    };
    ProviderEnv {
        credentials,
        refresh_skew: config.credentials.refresh_skew(),
    }
}

fn build_orchestrator(config: &AppConfig, cache: Arc<CacheManager>) -> Arc<Orchestrator> {
    let registry = ProviderRegistry::with_builtins();
    let providers = registry.instantiate_all(&config.providers, &provider_env(config));
    if providers.is_empty() {
        warn!("No providers could be instantiated; translate requests will fail");
    }
    Arc::new(Orchestrator::from_config(config, cache, providers))
}

async fn serve(mut config: AppConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    // Phase 4: Cache tiers and background expiry
    let shutdown = CancellationToken::new();
    let cache = Arc::new(CacheManager::from_config(&config.cache));
    let sweeper = cache
        .clone()
        .spawn_expiry_task(config.cache.sweep_interval(), shutdown.clone());

    // Phase 5: Providers and orchestrator
    let orchestrator = build_orchestrator(&config, cache);

    // Phase 6: Build and start HTTP server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let app = create_router(config, orchestrator, shutdown.clone());

    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Phase 7: Run server with graceful shutdown
    let on_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            on_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!("Cache expiry task ended abnormally: {}", e);
    }
    info!("Server shut down gracefully");
    Ok(())
}

async fn translate(
    config: AppConfig,
    input: &Path,
    target: String,
    provider: Option<String>,
    output: Option<&Path>,
) -> Result<()> {
    let raw = std::fs::read_to_string(input)
        .with_context(|| format!("reading track {}", input.display()))?;
    let track: CaptureTrack = serde_json::from_str(&raw)
        .with_context(|| format!("parsing track {}", input.display()))?;

    let cache = Arc::new(CacheManager::from_config(&config.cache));
    let orchestrator = build_orchestrator(&config, cache);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    let request = BatchRequest {
        video_id: track.video_id,
        source_language: track.source_language,
        target_language: target,
        cues: track.cues,
        provider,
        context: None,
    };
    let result = orchestrator
        .translate_batch_with_progress(request, &cancel, &|p: BatchProgress| {
            info!(
                "Progress {:.0}% ({}/{} chunks)",
                p.percentage, p.completed_chunks, p.total_chunks
            )
        })
        .await?;

    for warning in &result.warnings {
        warn!("{}", warning.message);
    }
    if let Some(partial) = &result.partial {
        warn!(
            "Stopped early ({}): {} cues untranslated",
            partial.error_kind,
            partial.failed_indices.len()
        );
    }

    let json = serde_json::to_string_pretty(&result)?;
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            info!("Wrote {} cues to {}", result.cues.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

async fn session(config: AppConfig, action: SessionCommand) -> Result<()> {
    match action {
        SessionCommand::Import { provider, file } => {
            let Some(provider_config) = config.provider(&provider) else {
                bail!("provider '{}' is not configured", provider);
            };
            let kind: ProviderKind = provider_config.provider_type.parse()?;
            if !matches!(
                kind,
                ProviderKind::ChatGptSubscription | ProviderKind::ClaudeSubscription
            ) {
                bail!("provider '{}' ({}) does not use sessions", provider, kind);
            }

            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading session file {}", file.display()))?;
            let export: SessionExport =
                serde_json::from_str(&raw).context("session file is not a session export")?;
            if let Some(exported_for) = &export.provider {
                info!("Session file was exported for '{}'", exported_for);
            }

            let store = CredentialStore::from_config(&config.credentials)?;
            let session = export.into_session();
            store.save(&provider, &session)?;
            info!(
                "Imported session for {} (expires in {:?}s, refreshable: {})",
                provider,
                session.expires_in_seconds(),
                session.can_refresh()
            );
            Ok(())
        }
        SessionCommand::Validate { provider } => {
            let Some(provider_config) = config.provider(&provider) else {
                bail!("provider '{}' is not configured", provider);
            };
            let instance =
                ProviderRegistry::with_builtins().create(provider_config, &provider_env(&config))?;
            let check = instance.validate_credentials().await;
            println!("{}", serde_json::to_string_pretty(&check)?);
            if !check.valid {
                bail!("credentials for '{}' are not valid", provider);
            }
            Ok(())
        }
    }
}

async fn cache(config: AppConfig, action: CacheCommand) -> Result<()> {
    let cache = CacheManager::from_config(&config.cache);
    if !cache.has_durable_tier() {
        bail!(
            "durable cache at {} could not be opened",
            config.cache.database_path().display()
        );
    }

    match action {
        CacheCommand::List { video_id } => {
            let filter = video_id.map(KeyFilter::video).unwrap_or_default();
            let entries = cache.list(&filter).await?;
            let summaries: Vec<CacheEntrySummary> =
                entries.iter().map(CacheEntrySummary::from).collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        CacheCommand::Purge { video_id } => {
            let removed = cache.invalidate_video(&video_id).await?;
            println!("Removed {} cached translations for {}", removed, video_id);
        }
        CacheCommand::EvictExpired => {
            let removed = cache.evict_expired().await?;
            println!("Removed {} expired entries", removed);
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
