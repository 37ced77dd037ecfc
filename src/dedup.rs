use tracing::debug;

use crate::core::TransactionEntry;
use crate::store::{self, SqliteStore};

/// The entries that survived the filter plus the count that did not.
#[derive(Debug)]
pub struct FilterOutcome {
    pub new: Vec<TransactionEntry>,
    pub duplicates: usize,
}

/// Batch suppression of already-imported records. One query fetches every
/// persisted external ID for the source; candidates are filtered against the
/// in-memory set, O(n) total. One existence query per candidate would be
/// O(n^2) against the store and is deliberately not how this works.
pub async fn filter_new(
    store: &SqliteStore,
    source_id: &str,
    candidates: Vec<TransactionEntry>,
) -> Result<FilterOutcome, store::Error> {
    let known = store.txns().external_ids(source_id).await?;
    let total = candidates.len();

    let new: Vec<TransactionEntry> = candidates
        .into_iter()
        .filter(|entry| !known.contains(entry.external_id()))
        .collect();
    let duplicates = total - new.len();
    debug!(source = source_id, total, duplicates, "duplicate filter applied");

    Ok(FilterOutcome { new, duplicates })
}
