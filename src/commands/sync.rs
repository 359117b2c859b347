// ABOUTME: sync command - replicates one or more root entities and prints their new ids
// ABOUTME: Optionally reuses and records identifier mappings across invocations

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::capability::CapabilityRegistry;
use crate::config::ReplicatorConfig;
use crate::engine::{SyncEngine, SyncResult};
use crate::entity::EntityId;
use crate::state::MappingState;

pub struct SyncOptions {
    pub config: PathBuf,
    pub entity_type: String,
    pub ids: Vec<String>,
    pub source: Option<String>,
    pub target: Option<String>,
    pub batch_size: Option<i64>,
    pub mappings: Option<PathBuf>,
}

/// Loads the configuration file and applies command-line overrides.
pub fn load_config(
    path: &std::path::Path,
    source: Option<String>,
    target: Option<String>,
    batch_size: Option<i64>,
) -> Result<ReplicatorConfig> {
    let mut config = ReplicatorConfig::load(path)?;
    if let Some(source) = source {
        config = config.from(source);
    }
    if let Some(target) = target {
        config = config.to(target);
    }
    if let Some(batch_size) = batch_size {
        config = config.with_batch_size(batch_size)?;
    }
    config.validate()?;
    Ok(config)
}

pub async fn run(opts: SyncOptions) -> Result<()> {
    let config = load_config(&opts.config, opts.source, opts.target, opts.batch_size)?;
    let registry = CapabilityRegistry::from_config(&config)?;
    let ids: Vec<EntityId> = opts.ids.iter().map(|raw| EntityId::parse(raw)).collect();

    let mut state = match &opts.mappings {
        Some(path) => Some(MappingState::load_for(path, config.source(), config.target()).await?),
        None => None,
    };

    tracing::info!(
        "Replicating {} {} root(s) from {} to {}",
        ids.len(),
        opts.entity_type,
        crate::utils::strip_password_from_url(config.source())?,
        crate::utils::strip_password_from_url(config.target())?
    );

    let mut engine = SyncEngine::connect(&config, registry).await?;
    if let Some(state) = &state {
        engine = engine.with_mapper(state.to_mapper());
    }

    let mut outcome = Ok(());
    for id in ids {
        match engine.sync(&opts.entity_type, id).await {
            Ok(result) => print_result(&mut std::io::stdout(), &result)?,
            Err(e) => {
                outcome = Err(anyhow::Error::new(e).context(format!(
                    "Failed to sync {} from {}",
                    opts.entity_type,
                    crate::utils::strip_password_from_url(config.source())?
                )));
                break;
            }
        }
    }

    // A failed sync restores the mapper, so only committed mappings are recorded.
    if let (Some(path), Some(state)) = (&opts.mappings, state.as_mut()) {
        state.record(engine.mapper());
        state.save(path).await?;
        tracing::info!("Recorded {} mapping(s) in {:?}", state.mappings.len(), path);
    }

    outcome
}

fn print_result(out: &mut impl Write, result: &SyncResult) -> Result<()> {
    let line = serde_json::to_string(result).context("Failed to serialize sync result")?;
    writeln!(out, "{}", line).context("Failed to write sync result")?;
    Ok(())
}
