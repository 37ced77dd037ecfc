use chrono::{DateTime, Utc};
use sea_query::{Expr, Func, Iden, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::Row;

use crate::catalog::Institution;

use super::{Result, SqliteStore};

#[derive(Iden)]
enum Institutions {
    Table,
    Id,
    Name,
    Country,
    FetchedAt,
}

pub struct Store<'a>(&'a SqliteStore);

impl<'a> Store<'a> {
    pub fn new(store: &'a SqliteStore) -> Self {
        Self(store)
    }

    pub async fn list(&self) -> Result<Vec<Institution>> {
        let (query, values) = Query::select()
            .columns([Institutions::Id, Institutions::Name, Institutions::Country])
            .from(Institutions::Table)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&query, values)
            .fetch_all(self.0.pool())
            .await?;

        let mut institutions = Vec::with_capacity(rows.len());
        for row in rows {
            institutions.push(Institution {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                country: row.try_get("country")?,
            });
        }

        Ok(institutions)
    }

    /// Timestamp of the last catalog refresh, for the TTL check.
    pub async fn fetched_at(&self) -> Result<Option<DateTime<Utc>>> {
        let (query, values) = Query::select()
            .expr(Func::max(Expr::col(Institutions::FetchedAt)))
            .from(Institutions::Table)
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&query, values)
            .fetch_one(self.0.pool())
            .await?;
        let raw: Option<String> = row.try_get(0)?;

        Ok(raw.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }))
    }

    /// Swaps the cached catalog for a fresh one in a single transaction.
    pub async fn replace_all(
        &self,
        institutions: &[Institution],
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.0.pool().begin().await?;

        let (query, values) = Query::delete()
            .from_table(Institutions::Table)
            .build_sqlx(SqliteQueryBuilder);
        sqlx::query_with(&query, values).execute(&mut *tx).await?;

        for ins in institutions {
            let (query, values) = Query::insert()
                .into_table(Institutions::Table)
                .columns([
                    Institutions::Id,
                    Institutions::Name,
                    Institutions::Country,
                    Institutions::FetchedAt,
                ])
                .values_panic([
                    ins.id.as_str().into(),
                    ins.name.as_str().into(),
                    ins.country.as_str().into(),
                    fetched_at.to_rfc3339().into(),
                ])
                .build_sqlx(SqliteQueryBuilder);
            sqlx::query_with(&query, values).execute(&mut *tx).await?;
        }

        tx.commit().await?;

        Ok(())
    }
}
