// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL document backend for the durable store.
//!
//! Every payload collection shares one table; documents are JSON text and
//! filters are evaluated with the database's JSON functions:
//!
//! ```sql
//! CREATE TABLE payload_documents (
//!   collection VARCHAR(191) NOT NULL,
//!   doc_id     VARCHAR(191) NOT NULL,
//!   body       LONGTEXT NOT NULL,     -- JSON as text (sqlx Any driver limitation)
//!   updated_at BIGINT NOT NULL,
//!   PRIMARY KEY (collection, doc_id)
//! )
//!
//! SELECT body FROM payload_documents
//!  WHERE collection = 'Account'
//!    AND JSON_UNQUOTE(JSON_EXTRACT(body, '$.uniqueId')) = 'abc';
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL LONGTEXT comes back as bytes through the `Any` driver, so bodies are
//! read as `String` first and fall back to `Vec<u8>`.
//!
//! Query failures are returned to the caller immediately; the cache layer
//! reports them and degrades. Only connecting and schema creation retry.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::info;

use super::filter::{Filter, SqlDialect, SqlParam};
use super::traits::{DocumentBackend, RawDocument, StorageError};
use crate::payload::now_millis;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const TABLE: &str = "payload_documents";

pub struct SqlDocumentBackend {
    pool: AnyPool,
    dialect: SqlDialect,
}

type AnyQuery<'q> = sqlx::query::Query<'q, sqlx::Any, AnyArguments<'q>>;

impl SqlDocumentBackend {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the table if needed.
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let dialect = if connection_string.starts_with("sqlite:") {
            SqlDialect::Sqlite
        } else {
            SqlDialect::Mysql
        };

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let backend = Self { pool, dialect };
        if dialect == SqlDialect::Sqlite {
            backend.enable_wal_mode().await?;
        }
        backend.init_schema().await?;
        info!(dialect = ?dialect, "SQL document backend ready");
        Ok(backend)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = match self.dialect {
            SqlDialect::Sqlite => {
                r#"
                CREATE TABLE IF NOT EXISTS payload_documents (
                    collection TEXT NOT NULL,
                    doc_id TEXT NOT NULL,
                    body TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (collection, doc_id)
                )
                "#
            }
            SqlDialect::Mysql => {
                r#"
                CREATE TABLE IF NOT EXISTS payload_documents (
                    collection VARCHAR(191) NOT NULL,
                    doc_id VARCHAR(191) NOT NULL,
                    body LONGTEXT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    PRIMARY KEY (collection, doc_id),
                    INDEX idx_updated_at (updated_at)
                )
                "#
            }
        };

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;
        Ok(())
    }

    fn bind_params<'q>(mut query: AnyQuery<'q>, params: Vec<SqlParam>) -> AnyQuery<'q> {
        for param in params {
            query = match param {
                SqlParam::Text(s) => query.bind(s),
                SqlParam::Numeric(n) => query.bind(n),
                SqlParam::Integer(i) => query.bind(i),
            };
        }
        query
    }

    // Try String first (SQLite TEXT), then bytes (MySQL LONGTEXT)
    fn read_text(row: &AnyRow, column: &str) -> Option<String> {
        row.try_get::<String, _>(column).ok().or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }
}

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait]
impl DocumentBackend for SqlDocumentBackend {
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StorageError> {
        let where_clause = filter.to_sql("body", self.dialect)?;
        let sql = format!(
            "SELECT body FROM {} WHERE collection = ? AND {}",
            TABLE, where_clause.clause
        );
        let query = sqlx::query(&sql).bind(collection.to_string());
        let rows = Self::bind_params(query, where_clause.params)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(body) = Self::read_text(&row, "body") {
                docs.push(serde_json::from_str(&body)?);
            }
        }
        Ok(docs)
    }

    async fn upsert(&self, collection: &str, id: &str, doc: &Value) -> Result<(), StorageError> {
        let body = serde_json::to_string(doc)?;
        let sql = match self.dialect {
            SqlDialect::Sqlite => {
                "INSERT INTO payload_documents (collection, doc_id, body, updated_at) VALUES (?, ?, ?, ?)
                 ON CONFLICT(collection, doc_id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at"
            }
            SqlDialect::Mysql => {
                "INSERT INTO payload_documents (collection, doc_id, body, updated_at) VALUES (?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE body = VALUES(body), updated_at = VALUES(updated_at)"
            }
        };
        sqlx::query(sql)
            .bind(collection.to_string())
            .bind(id.to_string())
            .bind(body)
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError> {
        let where_clause = filter.to_sql("body", self.dialect)?;
        let sql = format!(
            "DELETE FROM {} WHERE collection = ? AND {}",
            TABLE, where_clause.clause
        );
        let query = sqlx::query(&sql).bind(collection.to_string());
        let result = Self::bind_params(query, where_clause.params)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError> {
        let where_clause = filter.to_sql("body", self.dialect)?;
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE collection = ? AND {}",
            TABLE, where_clause.clause
        );
        let query = sqlx::query(&sql).bind(collection.to_string());
        let row = Self::bind_params(query, where_clause.params)
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let n: i64 = row.try_get("n").map_err(backend_err)?;
        Ok(n.max(0) as u64)
    }

    async fn scan_raw(&self, collection: &str) -> Result<Vec<RawDocument>, StorageError> {
        let rows = sqlx::query("SELECT doc_id, body FROM payload_documents WHERE collection = ?")
            .bind(collection.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(RawDocument {
                    id: Self::read_text(row, "doc_id")?,
                    body: Self::read_text(row, "body").unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM payload_documents WHERE collection = ? AND doc_id = ?")
            .bind(collection.to_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected() > 0)
    }

    fn backend_name(&self) -> &'static str {
        match self.dialect {
            SqlDialect::Sqlite => "sqlite",
            SqlDialect::Mysql => "mysql",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn temp_backend() -> (SqlDocumentBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        (SqlDocumentBackend::connect(&url).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn test_sqlite_upsert_find_count() {
        let (backend, _dir) = temp_backend().await;
        backend.upsert("Account", "a", &json!({"uniqueId": "a", "balance": 5})).await.unwrap();
        backend.upsert("Account", "a", &json!({"uniqueId": "a", "balance": 9})).await.unwrap();
        backend.upsert("Account", "b", &json!({"uniqueId": "b", "balance": 1})).await.unwrap();
        backend.upsert("Guild", "a", &json!({"id": "a"})).await.unwrap();

        let found = backend.find("Account", &Filter::eq("uniqueId", "a")).await.unwrap();
        assert_eq!(found, vec![json!({"uniqueId": "a", "balance": 9})]);
        assert_eq!(backend.count("Account", &Filter::All).await.unwrap(), 2);
        assert_eq!(backend.backend_name(), "sqlite");
    }

    #[tokio::test]
    async fn test_sqlite_ignore_case_and_delete() {
        let (backend, _dir) = temp_backend().await;
        backend.upsert("A", "1", &json!({"id": "1", "payloadNode": "Hub"})).await.unwrap();
        backend.upsert("A", "2", &json!({"id": "2", "payloadNode": "lobby"})).await.unwrap();

        let hub = Filter::eq_ignore_case("payloadNode", "hub");
        assert_eq!(backend.find("A", &hub).await.unwrap().len(), 1);
        assert_eq!(backend.delete_many("A", &hub).await.unwrap(), 1);
        assert!(backend.delete_by_id("A", "2").await.unwrap());
        assert!(backend.scan_raw("A").await.unwrap().is_empty());
    }
}
