use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tabwriter::TabWriter;
use tracing::{info, warn};
use ulid::Ulid;

use crate::error::SyncError;
use crate::store::SqliteStore;
use crate::upstream::aggregator::AggregatorClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Pending,
    Active,
    Failed,
    Disconnected,
}

impl ToString for ConnectionStatus {
    fn to_string(&self) -> String {
        match self {
            ConnectionStatus::Pending => "PENDING",
            ConnectionStatus::Active => "ACTIVE",
            ConnectionStatus::Failed => "FAILED",
            ConnectionStatus::Disconnected => "DISCONNECTED",
        }
        .to_string()
    }
}

impl TryFrom<&str> for ConnectionStatus {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "PENDING" => Ok(ConnectionStatus::Pending),
            "ACTIVE" => Ok(ConnectionStatus::Active),
            "FAILED" => Ok(ConnectionStatus::Failed),
            "DISCONNECTED" => Ok(ConnectionStatus::Disconnected),
            s => Err(anyhow::anyhow!("unknown connection status {}", s)),
        }
    }
}

/// A link to one institution through the aggregator. `external_id` is the
/// aggregator's identifier; `id` is ours.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub institution_id: String,
    pub external_id: String,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
}

/// Creates, polls, lists, and deletes bank-account links. Login credentials
/// pass straight through to the aggregator and are never stored locally.
pub struct ConnectionManager {
    store: Arc<SqliteStore>,
    client: Arc<AggregatorClient>,
}

impl ConnectionManager {
    pub fn new(store: Arc<SqliteStore>, client: Arc<AggregatorClient>) -> Self {
        ConnectionManager { store, client }
    }

    pub async fn create(
        &self,
        institution_id: &str,
        login_id: &str,
        password: &str,
    ) -> Result<Connection, SyncError> {
        let upstream = self
            .client
            .create_connection(institution_id, login_id, password)
            .await?;

        let connection = Connection {
            id: Ulid::new().to_string(),
            institution_id: institution_id.to_string(),
            external_id: upstream.id,
            status: map_status(&upstream.status),
            created_at: Utc::now(),
        };
        self.store.connections().save(&connection).await?;
        info!(connection = %connection.id, institution = institution_id, "connection created");

        Ok(connection)
    }

    /// Polls the aggregator until verification settles to `Active` or
    /// `Failed`, persisting every observed transition. Returns the last
    /// status seen when the attempt budget runs out.
    pub async fn poll_until_settled(
        &self,
        id: &str,
        attempts: u32,
        interval: Duration,
    ) -> Result<ConnectionStatus, SyncError> {
        let connection = self.store.connections().get(id).await?;
        let mut status = connection.status;

        for attempt in 0..attempts {
            let upstream = self
                .client
                .connection_status(&connection.external_id)
                .await?;
            status = map_status(&upstream.status);

            if status != connection.status {
                self.store.connections().update_status(id, status).await?;
            }
            if matches!(status, ConnectionStatus::Active | ConnectionStatus::Failed) {
                return Ok(status);
            }

            // No point waiting once the budget is spent.
            if attempt + 1 < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Ok(status)
    }

    pub async fn list(&self) -> Result<Vec<Connection>, SyncError> {
        Ok(self.store.connections().list().await?)
    }

    /// Deletes the link upstream first, then locally. A missing upstream
    /// record is fine; the local row still goes.
    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        let connection = self.store.connections().get(id).await?;

        match self.client.delete_connection(&connection.external_id).await {
            Ok(()) => {}
            Err(SyncError::Upstream { status: 404, .. }) => {
                warn!(connection = %id, "upstream connection already gone");
            }
            Err(e) => return Err(e),
        }
        self.store.connections().delete(id).await?;
        info!(connection = %id, "connection deleted");

        Ok(())
    }
}

fn map_status(upstream: &str) -> ConnectionStatus {
    match upstream.to_lowercase().as_str() {
        "active" | "success" => ConnectionStatus::Active,
        "pending" | "verifying" => ConnectionStatus::Pending,
        "failed" | "invalid-credentials" => ConnectionStatus::Failed,
        "disconnected" => ConnectionStatus::Disconnected,
        other => {
            warn!(status = other, "unknown upstream connection status");
            ConnectionStatus::Pending
        }
    }
}

pub fn display_connections_table(connections: &[Connection]) -> anyhow::Result<String> {
    let mut tw = TabWriter::new(vec![]);
    writeln!(tw, "ID\tInstitution\tUpstream ID\tStatus\tCreated")?;

    for conn in connections {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}",
            conn.id,
            conn.institution_id,
            conn.external_id,
            conn.status.to_string(),
            conn.created_at.format("%Y-%m-%d")
        )?;
    }

    Ok(String::from_utf8(tw.into_inner()?)?)
}
