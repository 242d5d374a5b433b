//! PostgreSQL-backed document store (JSONB)

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;

use super::{collection_of, parent_of, Document, DocumentStore, WriteMode};
use crate::error::ReconcileResult;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> ReconcileResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Apply the embedded schema migrations
pub async fn run_migrations(pool: &PgPool) -> ReconcileResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

/// Documents stored in a single `documents` table
///
/// `parent` and `collection` are derived from the path on write so that
/// child listing and collection-group queries stay index lookups.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, path: &str) -> ReconcileResult<Option<Value>> {
        let row: Option<(Json<Value>,)> =
            sqlx::query_as("SELECT data FROM documents WHERE path = $1")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(Json(data),)| data))
    }

    async fn set(&self, path: &str, data: Value, mode: WriteMode) -> ReconcileResult<()> {
        let query = match mode {
            WriteMode::Overwrite => {
                r#"
                INSERT INTO documents (path, parent, collection, data, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (path) DO UPDATE SET
                    data = EXCLUDED.data,
                    updated_at = NOW()
                "#
            }
            WriteMode::Merge => {
                r#"
                INSERT INTO documents (path, parent, collection, data, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (path) DO UPDATE SET
                    data = documents.data || EXCLUDED.data,
                    updated_at = NOW()
                "#
            }
        };

        sqlx::query(query)
            .bind(path)
            .bind(parent_of(path))
            .bind(collection_of(path))
            .bind(Json(data))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete(&self, path: &str) -> ReconcileResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE path = $1")
            .bind(path)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_children(&self, collection_path: &str) -> ReconcileResult<Vec<Document>> {
        let rows: Vec<(String, Json<Value>)> =
            sqlx::query_as("SELECT path, data FROM documents WHERE parent = $1 ORDER BY path")
                .bind(collection_path)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(path, Json(data))| Document { path, data })
            .collect())
    }

    async fn list_collection_group(&self, collection: &str) -> ReconcileResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT path FROM documents WHERE collection = $1 ORDER BY path")
                .bind(collection)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(path,)| path).collect())
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> ReconcileResult<Vec<Document>> {
        let rows: Vec<(String, Json<Value>)> = sqlx::query_as(
            r#"
            SELECT path, data
            FROM documents
            WHERE collection = $1
              AND data ->> $2 = $3
            ORDER BY path
            "#,
        )
        .bind(collection)
        .bind(field)
        .bind(value)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(path, Json(data))| Document { path, data })
            .collect())
    }
}
