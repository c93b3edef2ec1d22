use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use super::{DocPath, Document, DocumentStore, Filter, Lease, WriteBatch, WriteOp};
use crate::error::StoreError;

#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT data FROM documents WHERE collection = $1 AND doc_id = $2")
            .bind(&path.collection)
            .bind(&path.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;

        row.map(|r| {
            r.try_get::<Json<Value>, _>("data")
                .map(|json| json.0)
                .map_err(classify)
        })
        .transpose()
    }

    async fn scan(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT doc_id, data
            FROM documents
            WHERE collection = $1 AND data @> $2
            ORDER BY doc_id
            "#,
        )
        .bind(collection)
        .bind(Json(filter.to_json()))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            documents.push(Document {
                id: row.try_get("doc_id").map_err(classify)?,
                data: row.try_get::<Json<Value>, _>("data").map_err(classify)?.0,
            });
        }
        Ok(documents)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(classify)?;
        for op in batch.into_ops() {
            match op {
                WriteOp::Set { path, data } => {
                    sqlx::query(
                        r#"
                        INSERT INTO documents (collection, doc_id, data, updated_at)
                        VALUES ($1, $2, $3, now())
                        ON CONFLICT (collection, doc_id) DO UPDATE
                        SET data = EXCLUDED.data, updated_at = now()
                        "#,
                    )
                    .bind(&path.collection)
                    .bind(&path.id)
                    .bind(Json(data))
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;
                }
                WriteOp::Merge { path, data } => {
                    sqlx::query(
                        r#"
                        INSERT INTO documents (collection, doc_id, data, updated_at)
                        VALUES ($1, $2, $3, now())
                        ON CONFLICT (collection, doc_id) DO UPDATE
                        SET data = documents.data || EXCLUDED.data, updated_at = now()
                        "#,
                    )
                    .bind(&path.collection)
                    .bind(&path.id)
                    .bind(Json(data))
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;
                }
                WriteOp::Delete { path } => {
                    sqlx::query("DELETE FROM documents WHERE collection = $1 AND doc_id = $2")
                        .bind(&path.collection)
                        .bind(&path.id)
                        .execute(&mut *tx)
                        .await
                        .map_err(classify)?;
                }
            }
        }
        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn lock(&self, key: &str) -> Result<Lease, StoreError> {
        // released when the transaction rolls back on drop
        let mut tx = self.pool.begin().await.map_err(classify)?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        Ok(Lease::new(tx))
    }
}

fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // class 53: insufficient resources
            Some(code) if code.starts_with("53") => StoreError::QuotaExceeded(err.to_string()),
            Some("57P03") => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Backend(err.to_string()),
        },
        _ => StoreError::Backend(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_transient() {
        assert!(matches!(
            classify(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            classify(sqlx::Error::RowNotFound),
            StoreError::Backend(_)
        ));
    }
}
