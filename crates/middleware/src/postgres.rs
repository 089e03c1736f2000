//! PostgreSQL document store: one JSONB row per telemetry document.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, PoolError, Runtime};
use serde_json::Value;
use tokio_postgres::NoTls;
use tracing::info;

use crate::error::StoreError;
use crate::store::{Document, DocumentStore, PersistedRecord, RecordId};

pub struct PostgresStore {
    pool: Pool,
    table: String,
}

impl PostgresStore {
    /// Build the pool. No connection is made until [`DocumentStore::connect`].
    pub fn new(database_url: &str, table: &str) -> Result<Self, StoreError> {
        if !is_valid_identifier(table) {
            return Err(StoreError::Config(format!("invalid table name: {}", table)));
        }
        Ok(Self {
            pool: create_pool(database_url)?,
            table: table.to_string(),
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, StoreError> {
        self.pool.get().await.map_err(classify_pool_error)
    }
}

/// Create a connection pool from a database URL
fn create_pool(database_url: &str) -> Result<Pool, StoreError> {
    // Parse the URL into deadpool config
    let pg_config: tokio_postgres::Config = database_url
        .parse()
        .map_err(|e: tokio_postgres::Error| StoreError::Config(format!("invalid database URL: {}", e)))?;

    let mut cfg = Config::new();
    if let Some(host) = pg_config.get_hosts().first() {
        match host {
            tokio_postgres::config::Host::Tcp(h) => cfg.host = Some(h.clone()),
            #[cfg(unix)]
            tokio_postgres::config::Host::Unix(p) => {
                cfg.host = Some(p.to_string_lossy().to_string())
            }
        }
    }
    if let Some(port) = pg_config.get_ports().first() {
        cfg.port = Some(*port);
    }
    if let Some(user) = pg_config.get_user() {
        cfg.user = Some(user.to_string());
    }
    if let Some(password) = pg_config.get_password() {
        cfg.password = Some(String::from_utf8_lossy(password).to_string());
    }
    if let Some(dbname) = pg_config.get_dbname() {
        cfg.dbname = Some(dbname.to_string());
    }
    cfg.connect_timeout = Some(Duration::from_secs(30));

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| StoreError::Config(format!("failed to create pool: {}", e)))
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Errors carrying a SQLSTATE came from a live server that rejected us
/// (bad credentials, missing database): not worth retrying.
fn classify_pool_error(e: PoolError) -> StoreError {
    match e {
        PoolError::Backend(pg) if pg.code().is_some() => StoreError::Config(pg.to_string()),
        PoolError::Backend(pg) => StoreError::Unavailable(pg.to_string()),
        PoolError::Timeout(t) => StoreError::Unavailable(format!("pool timeout: {:?}", t)),
        other => StoreError::Config(other.to_string()),
    }
}

fn classify_query_error(e: tokio_postgres::Error) -> StoreError {
    if e.code().is_some() {
        StoreError::Operation(e.to_string())
    } else {
        StoreError::Unavailable(e.to_string())
    }
}

fn to_record(row: &tokio_postgres::Row) -> Result<PersistedRecord, StoreError> {
    let id: i64 = row.get("id");
    match row.get::<_, Value>("document") {
        Value::Object(document) => Ok(PersistedRecord {
            id: RecordId::new(id),
            document,
        }),
        other => Err(StoreError::InvalidDocument(format!(
            "row {} holds a non-object document: {}",
            id, other
        ))),
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn connect(&self) -> Result<(), StoreError> {
        let client = self.client().await?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                 id BIGSERIAL PRIMARY KEY, \
                 document JSONB NOT NULL, \
                 received_at TIMESTAMPTZ NOT NULL DEFAULT now())",
            table = self.table
        );
        client.batch_execute(&ddl).await.map_err(classify_query_error)?;
        info!(table = %self.table, "PostgreSQL document table ready");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let client = self.client().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| StoreError::Unavailable(format!("ping failed: {}", e)))?;
        Ok(())
    }

    async fn insert(&self, document: &Document) -> Result<RecordId, StoreError> {
        let client = self.client().await?;
        let sql = format!("INSERT INTO {} (document) VALUES ($1) RETURNING id", self.table);
        let value = Value::Object(document.clone());
        let row = client
            .query_one(sql.as_str(), &[&value])
            .await
            .map_err(classify_query_error)?;
        Ok(RecordId::new(row.get(0)))
    }

    async fn latest(&self, limit: usize) -> Result<Vec<PersistedRecord>, StoreError> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT id, document FROM {} ORDER BY id DESC LIMIT $1",
            self.table
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = client
            .query(sql.as_str(), &[&limit])
            .await
            .map_err(classify_query_error)?;
        rows.iter().map(to_record).collect()
    }

    async fn latest_matching(
        &self,
        field: &str,
        values: &[String],
        limit: usize,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT id, document FROM {} \
             WHERE document->>$1 = ANY($2) \
             ORDER BY id DESC LIMIT $3",
            self.table
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = client
            .query(sql.as_str(), &[&field, &values, &limit])
            .await
            .map_err(classify_query_error)?;
        rows.iter().map(to_record).collect()
    }
}
