// ABOUTME: check command - validates a configuration and prints the declared relation graph
// ABOUTME: Never opens a store connection

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::Result;

use crate::capability::{CapabilityRegistry, Syncable};
use crate::entity::KeyKind;

pub struct CheckOptions {
    pub config: PathBuf,
    pub source: Option<String>,
    pub target: Option<String>,
    pub batch_size: Option<i64>,
}

pub async fn run(opts: CheckOptions) -> Result<()> {
    let config = super::sync::load_config(&opts.config, opts.source, opts.target, opts.batch_size)?;
    crate::utils::validate_source_target_different(config.source(), config.target())?;
    let registry = CapabilityRegistry::from_config(&config)?;

    tracing::info!(
        "Configuration {:?} is valid: {} syncable entity type(s)",
        opts.config,
        registry.len()
    );
    print!("{}", describe(&registry));
    Ok(())
}

/// Renders every registered entity type with its key, exclusions and relations.
pub fn describe(registry: &CapabilityRegistry) -> String {
    let mut out = String::new();
    for entity_type in registry.entity_types() {
        let Some(capability) = registry.get(entity_type) else {
            continue;
        };
        describe_entity(&mut out, capability.as_ref());
    }
    out
}

fn describe_entity(out: &mut String, capability: &dyn Syncable) {
    let schema = capability.schema();
    let key_kind = match schema.key_kind {
        KeyKind::Integer => "integer",
        KeyKind::Uuid => "uuid",
    };
    let _ = writeln!(
        out,
        "{} (key {}: {})",
        schema.entity_type, schema.primary_key, key_kind
    );

    let excluded = capability.excluded_attributes();
    let names: Vec<&str> = excluded
        .iter()
        .map(String::as_str)
        .filter(|name| *name != schema.primary_key)
        .collect();
    if !names.is_empty() {
        let _ = writeln!(out, "  excluded: {}", names.join(", "));
    }

    for (name, relation) in capability.relation_descriptors() {
        let _ = write!(
            out,
            "  {} -> {} {} via {}",
            name, relation.kind, relation.related_type, relation.foreign_key
        );
        for (attribute, value) in &relation.conditions {
            let rendered = serde_json::to_string(value).unwrap_or_default();
            let _ = write!(out, " where {} = {}", attribute, rendered);
        }
        out.push('\n');
    }
}
