//! Loads records from a JSON file into the in-memory store.

use std::path::Path;

use anyhow::Context;
use dataform_core::Record;
use dataform_db_memory::InMemoryRecordStore;
use tracing::info;

/// Parses a JSON array of records.
pub async fn read_records(path: &Path) -> anyhow::Result<Vec<Record>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("seed file {} is not a JSON array of records", path.display()))
}

/// Applies every record from `path` to `store`. Returns how many were loaded.
pub async fn seed_store(store: &InMemoryRecordStore, path: &Path) -> anyhow::Result<usize> {
    let records = read_records(path).await?;
    let count = records.len();

    for record in records {
        let label = format!("{}/{}", record.namespace, record.name);
        store
            .apply(record)
            .await
            .with_context(|| format!("failed to load seed record {label}"))?;
    }

    info!(path = %path.display(), count, "Seeded record store");
    Ok(count)
}
