use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::info;

use crate::error::SyncError;
use crate::store::SqliteStore;
use crate::upstream::aggregator::AggregatorClient;

pub const DEFAULT_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Institution {
    pub id: String,
    pub name: String,
    pub country: String,
}

/// Cached list of connectable institutions. Serves from the local cache
/// until the TTL lapses, then refreshes from the aggregator and rewrites the
/// cache wholesale.
pub struct InstitutionCatalog {
    store: Arc<SqliteStore>,
    client: Arc<AggregatorClient>,
    ttl: Duration,
}

impl InstitutionCatalog {
    pub fn new(store: Arc<SqliteStore>, client: Arc<AggregatorClient>, ttl_hours: i64) -> Self {
        InstitutionCatalog {
            store,
            client,
            ttl: Duration::hours(ttl_hours),
        }
    }

    pub async fn list(&self, force_refresh: bool) -> Result<Vec<Institution>, SyncError> {
        if !force_refresh {
            if let Some(fetched_at) = self.store.institutions().fetched_at().await? {
                if Utc::now() - fetched_at < self.ttl {
                    return Ok(self.store.institutions().list().await?);
                }
            }
        }

        let fresh = self.client.institutions().await?;
        self.store
            .institutions()
            .replace_all(&fresh, Utc::now())
            .await?;
        info!(count = fresh.len(), "institution catalog refreshed");

        Ok(fresh)
    }
}
