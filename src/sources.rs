use anyhow::Result;

use crate::config::Config;
use crate::traits::AdapterRegistry;

/// One row of the `cix sources` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub kind: &'static str,
    pub available: bool,
    pub detail: String,
}

pub fn source_statuses(registry: &AdapterRegistry) -> Vec<SourceStatus> {
    registry
        .adapters()
        .map(|adapter| {
            let reason = adapter.unavailable_reason();
            SourceStatus {
                kind: adapter.kind().as_str(),
                available: reason.is_none(),
                detail: reason.unwrap_or_else(|| adapter.description().to_string()),
            }
        })
        .collect()
}

pub fn list_sources(config: &Config) -> Result<()> {
    let registry = AdapterRegistry::from_config(config)?;

    println!("{:<10} {:<14} DETAIL", "KIND", "STATUS");
    for status in source_statuses(&registry) {
        let label = if status.available {
            "OK"
        } else {
            "UNAVAILABLE"
        };
        println!("{:<10} {:<14} {}", status.kind, label, status.detail);
    }

    Ok(())
}
