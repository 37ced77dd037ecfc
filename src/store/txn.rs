use std::collections::HashSet;

use sea_query::{Expr, Iden, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{FromRow, Row};
use ulid::Ulid;

use crate::core::{LineItem, TransactionEntry};

use super::{map_insert_error, Result, SqliteStore};

#[derive(Iden)]
enum Transactions {
    Table,
    Id,
    SourceId,
    ExternalId,
    Date,
    Merchant,
    Amount,
    Currency,
    TaxCategory,
    SourceType,
    Note,
    Source,
}

#[derive(Iden)]
enum LineItems {
    Table,
    Id,
    TxnId,
    Description,
    Quantity,
    UnitPrice,
}

/// Committed transaction row as read back from the ledger.
#[derive(Debug, Clone)]
pub struct StoredTransaction {
    pub id: String,
    pub source_id: String,
    pub external_id: String,
    pub date: String,
    pub merchant: String,
    pub amount: String,
    pub currency: String,
    pub tax_category: String,
    pub source_type: String,
    pub note: String,
}

impl FromRow<'_, sqlx::sqlite::SqliteRow> for StoredTransaction {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> ::std::result::Result<Self, sqlx::Error> {
        Ok(StoredTransaction {
            id: row.try_get("id")?,
            source_id: row.try_get("source_id")?,
            external_id: row.try_get("external_id")?,
            date: row.try_get("date")?,
            merchant: row.try_get("merchant")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            tax_category: row.try_get("tax_category")?,
            source_type: row.try_get("source_type")?,
            note: row.try_get("note")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StoredLineItem {
    pub description: String,
    pub quantity: i64,
    pub unit_price: String,
}

pub struct Store<'a>(&'a SqliteStore);

impl<'a> Store<'a> {
    pub fn new(store: &'a SqliteStore) -> Self {
        Self(store)
    }

    /// All persisted external IDs for one source, fetched in a single query.
    /// The duplicate filter builds its membership set from this.
    pub async fn external_ids(&self, source_id: &str) -> Result<HashSet<String>> {
        let (query, values) = Query::select()
            .column(Transactions::ExternalId)
            .from(Transactions::Table)
            .and_where(Expr::col(Transactions::SourceId).eq(source_id))
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&query, values)
            .fetch_all(self.0.pool())
            .await?;

        let mut ids = HashSet::with_capacity(rows.len());
        for row in rows {
            ids.insert(row.try_get("external_id")?);
        }

        Ok(ids)
    }

    pub async fn by_external_id(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<StoredTransaction>> {
        let (query, values) = Query::select()
            .columns([
                Transactions::Id,
                Transactions::SourceId,
                Transactions::ExternalId,
                Transactions::Date,
                Transactions::Merchant,
                Transactions::Amount,
                Transactions::Currency,
                Transactions::TaxCategory,
                Transactions::SourceType,
                Transactions::Note,
            ])
            .from(Transactions::Table)
            .and_where(Expr::col(Transactions::SourceId).eq(source_id))
            .and_where(Expr::col(Transactions::ExternalId).eq(external_id))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&query, values)
            .fetch_optional(self.0.pool())
            .await?;

        Ok(match row {
            Some(row) => Some(StoredTransaction::from_row(&row)?),
            None => None,
        })
    }

    pub async fn list(&self, source_id: &str) -> Result<Vec<StoredTransaction>> {
        let (query, values) = Query::select()
            .columns([
                Transactions::Id,
                Transactions::SourceId,
                Transactions::ExternalId,
                Transactions::Date,
                Transactions::Merchant,
                Transactions::Amount,
                Transactions::Currency,
                Transactions::TaxCategory,
                Transactions::SourceType,
                Transactions::Note,
            ])
            .from(Transactions::Table)
            .and_where(Expr::col(Transactions::SourceId).eq(source_id))
            .order_by(Transactions::Date, Order::Asc)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&query, values)
            .fetch_all(self.0.pool())
            .await?;

        let mut txns = Vec::with_capacity(rows.len());
        for row in rows {
            txns.push(StoredTransaction::from_row(&row)?);
        }

        Ok(txns)
    }

    pub async fn line_items(&self, txn_id: &str) -> Result<Vec<StoredLineItem>> {
        let (query, values) = Query::select()
            .columns([LineItems::Description, LineItems::Quantity, LineItems::UnitPrice])
            .from(LineItems::Table)
            .and_where(Expr::col(LineItems::TxnId).eq(txn_id))
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&query, values)
            .fetch_all(self.0.pool())
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(StoredLineItem {
                description: row.try_get("description")?,
                quantity: row.try_get("quantity")?,
                unit_price: row.try_get("unit_price")?,
            });
        }

        Ok(items)
    }
}

pub(super) async fn insert_transaction(
    tx: &mut sqlx::Transaction<'_, sqlx::sqlite::Sqlite>,
    source_id: &str,
    entry: &TransactionEntry,
) -> Result<()> {
    let canonical = &entry.canonical;
    let (query, values) = Query::insert()
        .into_table(Transactions::Table)
        .columns([
            Transactions::Id,
            Transactions::SourceId,
            Transactions::ExternalId,
            Transactions::Date,
            Transactions::Merchant,
            Transactions::Amount,
            Transactions::Currency,
            Transactions::TaxCategory,
            Transactions::SourceType,
            Transactions::Note,
            Transactions::Source,
        ])
        .values_panic([
            canonical.id.to_string().into(),
            source_id.into(),
            canonical.external_id.as_str().into(),
            canonical.date.format("%Y-%m-%d").to_string().into(),
            canonical.merchant.as_str().into(),
            canonical.amount.amount().to_string().into(),
            canonical.amount.currency().to_string().into(),
            canonical.tax_category.to_string().into(),
            canonical.source.to_string().into(),
            canonical.note.as_str().into(),
            serde_json::to_string(&entry.source_payload)?.into(),
        ])
        .build_sqlx(SqliteQueryBuilder);

    sqlx::query_with(&query, values)
        .execute(&mut **tx)
        .await
        .map_err(map_insert_error)?;

    Ok(())
}

pub(super) async fn insert_line_item(
    tx: &mut sqlx::Transaction<'_, sqlx::sqlite::Sqlite>,
    txn_id: &str,
    item: &LineItem,
) -> Result<()> {
    let (query, values) = Query::insert()
        .into_table(LineItems::Table)
        .columns([
            LineItems::Id,
            LineItems::TxnId,
            LineItems::Description,
            LineItems::Quantity,
            LineItems::UnitPrice,
        ])
        .values_panic([
            Ulid::new().to_string().into(),
            txn_id.into(),
            item.description.as_str().into(),
            item.quantity.into(),
            item.unit_price.amount().to_string().into(),
        ])
        .build_sqlx(SqliteQueryBuilder);

    sqlx::query_with(&query, values).execute(&mut **tx).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::store::tests::{entry, test_store};

    #[tokio::test]
    async fn by_external_id_finds_the_committed_row() {
        let store = test_store().await;
        store.save_batch("conn-1", &[entry("tx-1")]).await.unwrap();

        let found = store
            .txns()
            .by_external_id("conn-1", "tx-1")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(found.merchant, "Uber");
        assert_eq!(found.amount, "25.50");
        assert_eq!(found.source_type, "EMAIL");
    }

    #[tokio::test]
    async fn by_external_id_is_scoped_to_the_source() {
        let store = test_store().await;
        store.save_batch("conn-1", &[entry("tx-1")]).await.unwrap();

        assert!(store
            .txns()
            .by_external_id("conn-1", "tx-9")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .txns()
            .by_external_id("conn-2", "tx-1")
            .await
            .unwrap()
            .is_none());
    }
}
