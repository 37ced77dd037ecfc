use sea_query::{Expr, Iden, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{FromRow, Row};

use crate::connections::{Connection, ConnectionStatus};

use super::{Result, SqliteStore};

#[derive(Iden)]
enum Connections {
    Table,
    Id,
    InstitutionId,
    ExternalId,
    Status,
    CreatedAt,
}

const COLUMNS: [Connections; 5] = [
    Connections::Id,
    Connections::InstitutionId,
    Connections::ExternalId,
    Connections::Status,
    Connections::CreatedAt,
];

pub struct Store<'a>(&'a SqliteStore);

impl<'a> Store<'a> {
    pub fn new(store: &'a SqliteStore) -> Self {
        Self(store)
    }

    pub async fn save(&self, conn: &Connection) -> Result<()> {
        let (query, values) = Query::insert()
            .into_table(Connections::Table)
            .columns(COLUMNS)
            .values_panic([
                conn.id.as_str().into(),
                conn.institution_id.as_str().into(),
                conn.external_id.as_str().into(),
                conn.status.to_string().into(),
                conn.created_at.to_rfc3339().into(),
            ])
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(self.0.pool())
            .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Connection> {
        let (query, values) = Query::select()
            .columns(COLUMNS)
            .from(Connections::Table)
            .and_where(Expr::col(Connections::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&query, values)
            .fetch_one(self.0.pool())
            .await?;

        Ok(Connection::from_row(&row)?)
    }

    pub async fn list(&self) -> Result<Vec<Connection>> {
        let (query, values) = Query::select()
            .columns(COLUMNS)
            .from(Connections::Table)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&query, values)
            .fetch_all(self.0.pool())
            .await?;

        let mut connections = Vec::with_capacity(rows.len());
        for row in rows {
            connections.push(Connection::from_row(&row)?);
        }

        Ok(connections)
    }

    pub async fn update_status(&self, id: &str, status: ConnectionStatus) -> Result<()> {
        let (query, values) = Query::update()
            .table(Connections::Table)
            .values([(Connections::Status, status.to_string().into())])
            .and_where(Expr::col(Connections::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(self.0.pool())
            .await?;

        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let (query, values) = Query::delete()
            .from_table(Connections::Table)
            .and_where(Expr::col(Connections::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(self.0.pool())
            .await?;

        Ok(())
    }
}

impl FromRow<'_, sqlx::sqlite::SqliteRow> for Connection {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> ::std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(Connection {
            id: row.try_get("id")?,
            institution_id: row.try_get("institution_id")?,
            external_id: row.try_get("external_id")?,
            status: ConnectionStatus::try_from(status.as_str())
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| sqlx::Error::Decode(e.into()))?
                .with_timezone(&chrono::Utc),
        })
    }
}
