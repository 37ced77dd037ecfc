mod connection;
mod institution;
mod txn;

pub use txn::{StoredLineItem, StoredTransaction};

use std::sync::Arc;

use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::TransactionEntry;

#[derive(Debug, Error)]
pub enum Error {
    #[error("conflicting data already exists")]
    AlreadyExists,
    #[error("record {index} of batch 0..={last} failed validation: {reason}")]
    Validation {
        index: usize,
        last: usize,
        reason: String,
    },
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Database(#[from] SqlxError),
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        self.to_string() == other.to_string()
    }
}

type Result<T> = ::std::result::Result<T, Error>;

/// Transactional write boundary to the local ledger. Reads go straight to the
/// pool; commits are serialized through a single writer lock so concurrent
/// sync runs enqueue rather than interleave.
pub struct SqliteStore {
    pool: Arc<sqlx::pool::Pool<sqlx::sqlite::Sqlite>>,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    pub async fn new(uri: &str) -> Result<Self> {
        // In-memory SQLite databases are per-connection; a second pooled
        // connection would see an empty schema, so those get a single
        // connection. File-backed stores serve concurrent readers; writes
        // still serialize through the store's lock.
        let mut options = sqlx::sqlite::SqlitePoolOptions::new();
        if uri.contains(":memory:") {
            options = options.max_connections(1);
        }
        let pool = options.connect(uri).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool: Arc::new(pool),
            write_lock: Mutex::new(()),
        })
    }

    pub fn connections(&self) -> connection::Store<'_> {
        connection::Store::new(self)
    }

    pub fn institutions(&self) -> institution::Store<'_> {
        institution::Store::new(self)
    }

    pub fn txns(&self) -> txn::Store<'_> {
        txn::Store::new(self)
    }

    pub(crate) fn pool(&self) -> &sqlx::pool::Pool<sqlx::sqlite::Sqlite> {
        &self.pool
    }

    /// Commits a whole sync batch in one transaction. Every record is
    /// validated before anything is written; any failure aborts with the
    /// offending index and batch range, leaving the store untouched.
    pub async fn save_batch(&self, source_id: &str, entries: &[TransactionEntry]) -> Result<()> {
        for (index, entry) in entries.iter().enumerate() {
            if let Err(reason) = validate(entry) {
                return Err(Error::Validation {
                    index,
                    last: entries.len().saturating_sub(1),
                    reason,
                });
            }
        }

        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            txn::insert_transaction(&mut tx, source_id, entry).await?;
            let txn_id = entry.canonical.id.to_string();
            for item in &entry.items {
                txn::insert_line_item(&mut tx, &txn_id, item).await?;
            }
        }

        tx.commit().await?;
        debug!(source = source_id, records = entries.len(), "batch committed");

        Ok(())
    }
}

fn validate(entry: &TransactionEntry) -> ::std::result::Result<(), String> {
    if entry.canonical.external_id.trim().is_empty() {
        return Err("external id is empty".to_string());
    }
    if entry.canonical.merchant.trim().is_empty() {
        return Err("merchant is empty".to_string());
    }

    Ok(())
}

/// SQLite unique-constraint failures surface as `AlreadyExists`.
pub(crate) fn map_insert_error(e: SqlxError) -> Error {
    match e {
        SqlxError::Database(e) => {
            let code = e.code();
            if code == Some(std::borrow::Cow::Borrowed("1555"))
                || code == Some(std::borrow::Cow::Borrowed("2067"))
            {
                return Error::AlreadyExists;
            }

            Error::from(SqlxError::Database(e))
        }
        _ => Error::from(e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::NaiveDate;
    use rusty_money::{iso, Money};
    use ulid::Ulid;

    use crate::core::{CanonicalTransaction, LineItem, SourceType, TaxCategory};

    use super::*;

    pub(crate) async fn test_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    pub(crate) fn entry(external_id: &str) -> TransactionEntry {
        TransactionEntry {
            canonical: CanonicalTransaction {
                id: Ulid::new(),
                date: NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(),
                merchant: "Uber".to_string(),
                amount: Money::from_str("25.50", iso::AUD).unwrap(),
                tax_category: TaxCategory::Personal,
                source: SourceType::Email,
                external_id: external_id.to_string(),
                note: "Your trip with Uber | noreply@uber.com".to_string(),
            },
            items: vec![LineItem {
                description: "Trip fare".to_string(),
                quantity: 1,
                unit_price: Money::from_str("23.18", iso::AUD).unwrap(),
            }],
            source_payload: serde_json::json!({"emailId": external_id}),
        }
    }

    #[tokio::test]
    async fn batch_commits_transactions_with_line_items() {
        let store = test_store().await;
        let entries = vec![entry("m-1"), entry("m-2")];

        store.save_batch("mailbox", &entries).await.unwrap();

        let ids = store.txns().external_ids("mailbox").await.unwrap();
        assert_eq!(ids.len(), 2);
        let items = store
            .txns()
            .line_items(&entries[0].canonical.id.to_string())
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].description, "Trip fare");
    }

    #[tokio::test]
    async fn validation_failure_rolls_back_the_whole_batch() {
        let store = test_store().await;
        let mut entries: Vec<TransactionEntry> = (0..50).map(|i| entry(&format!("m-{}", i))).collect();
        entries[37].canonical.external_id = "".to_string();

        let err = store.save_batch("mailbox", &entries).await.unwrap_err();

        match err {
            Error::Validation { index, last, .. } => {
                assert_eq!(index, 37);
                assert_eq!(last, 49);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
        assert!(store.txns().external_ids("mailbox").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_external_id_rolls_back_and_reports_conflict() {
        let store = test_store().await;
        store.save_batch("mailbox", &[entry("m-1")]).await.unwrap();

        let err = store
            .save_batch("mailbox", &[entry("m-9"), entry("m-1")])
            .await
            .unwrap_err();

        assert_eq!(err, Error::AlreadyExists);
        // The conflicting batch's fresh record must not survive the rollback.
        let ids = store.txns().external_ids("mailbox").await.unwrap();
        assert!(!ids.contains("m-9"));
    }

    #[tokio::test]
    async fn file_backed_store_round_trips() {
        let path = std::env::temp_dir().join(format!("bursar-test-{}.db", Ulid::new()));
        let uri = format!("sqlite://{}?mode=rwc", path.display());

        let store = SqliteStore::new(&uri).await.unwrap();
        store.save_batch("mailbox", &[entry("m-1")]).await.unwrap();

        let ids = store.txns().external_ids("mailbox").await.unwrap();
        assert!(ids.contains("m-1"));

        drop(store);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn same_external_id_under_different_source_is_allowed() {
        let store = test_store().await;

        store.save_batch("mailbox", &[entry("m-1")]).await.unwrap();
        store.save_batch("conn-2", &[entry("m-1")]).await.unwrap();
    }
}
