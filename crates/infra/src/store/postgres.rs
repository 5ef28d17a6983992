//! Postgres-backed document store.
//!
//! Documents live in a single JSONB table keyed by the full document id:
//!
//! ```sql
//! documents (id TEXT PK, collection TEXT, body JSONB, etag BIGINT,
//!            sequence BIGSERIAL, expires_at TIMESTAMPTZ NULL)
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Concurrency` | Concurrent create of the same id |
//! | Database (serialization failure) | `40001` | `Concurrency` | Concurrent write under stricter isolation |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolClosed / Io / other | N/A | `Backend` | Connection failures |
//!
//! Etag mismatches are detected through `rows_affected() == 0` on conditional
//! `UPDATE`/`DELETE` statements and reported as `Concurrency`.
//!
//! ## Threading
//!
//! The store owns a small Tokio runtime and blocks on it, so it must be called
//! from plain threads (worker threads, the reaper), not from inside an async
//! task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::instrument;

use jobdoc_core::DocumentId;

use super::query::{DocumentQuery, FieldFilter, Order};
use super::r#trait::{DocumentStore, ExpectedEtag, StoreError, StoredDocument, WriteBatch, WriteOp};

/// Postgres-backed document store.
#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl PostgresDocumentStore {
    /// Connect a pool of `max_connections` to `database_url`.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("jobdoc-pg")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Backend(format!("failed to build runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    async fn setup_async(&self) -> Result<(), StoreError> {
        const STATEMENTS: [&str; 3] = [
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                body JSONB NOT NULL,
                etag BIGINT NOT NULL,
                sequence BIGSERIAL NOT NULL,
                expires_at TIMESTAMPTZ NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS documents_collection_sequence_idx
                ON documents (collection, sequence)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS documents_expires_at_idx
                ON documents (expires_at) WHERE expires_at IS NOT NULL
            "#,
        ];

        for statement in STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("setup", e))?;
        }
        Ok(())
    }

    async fn load_async(
        &self,
        ids: &[DocumentId],
    ) -> Result<Vec<Option<StoredDocument>>, StoreError> {
        let keys: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, body, etag, sequence, expires_at
            FROM documents
            WHERE id = ANY($1)
            "#,
        )
        .bind(&keys)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        let mut found: HashMap<DocumentId, StoredDocument> = HashMap::with_capacity(rows.len());
        for row in rows {
            let doc = decode_row(&row)?;
            found.insert(doc.id.clone(), doc);
        }

        Ok(ids.iter().map(|id| found.remove(id)).collect())
    }

    async fn query_async(&self, query: &DocumentQuery) -> Result<Vec<StoredDocument>, StoreError> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT id, body, etag, sequence, expires_at FROM documents");
        push_filters(&mut qb, query);

        qb.push(match query.order {
            Order::Arrival => " ORDER BY sequence ASC",
            Order::ArrivalDesc => " ORDER BY sequence DESC",
        });
        if let Some(take) = query.take {
            qb.push(" LIMIT ");
            qb.push_bind(take as i64);
        }
        if query.skip > 0 {
            qb.push(" OFFSET ");
            qb.push_bind(query.skip as i64);
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("query", e))?;

        rows.iter().map(decode_row).collect()
    }

    async fn count_async(&self, query: &DocumentQuery) -> Result<usize, StoreError> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM documents");
        push_filters(&mut qb, query);

        let row = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| StoreError::Backend(format!("failed to read count: {e}")))?;
        Ok(total.max(0) as usize)
    }

    async fn commit_async(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Dropping `tx` on an early return rolls the whole batch back.
        for op in batch.into_ops() {
            apply_op(&mut tx, op).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn purge_expired_async(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM documents
            WHERE id IN (
                SELECT id FROM documents
                WHERE expires_at IS NOT NULL AND expires_at <= $1
                LIMIT $2
            )
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_expired", e))?;

        Ok(result.rows_affected() as usize)
    }
}

impl DocumentStore for PostgresDocumentStore {
    #[instrument(skip(self), err)]
    fn setup(&self) -> Result<(), StoreError> {
        self.runtime.block_on(self.setup_async())
    }

    #[instrument(skip(self), err)]
    fn destroy(&self) -> Result<(), StoreError> {
        self.runtime.block_on(async {
            sqlx::query("TRUNCATE TABLE documents")
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(|e| map_sqlx_error("destroy", e))
        })
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    fn load(&self, ids: &[DocumentId]) -> Result<Vec<Option<StoredDocument>>, StoreError> {
        self.runtime.block_on(self.load_async(ids))
    }

    #[instrument(skip(self, query), fields(collection = %query.collection), err)]
    fn query(&self, query: &DocumentQuery) -> Result<Vec<StoredDocument>, StoreError> {
        query.validate()?;
        self.runtime.block_on(self.query_async(query))
    }

    #[instrument(skip(self, query), fields(collection = %query.collection), err)]
    fn count(&self, query: &DocumentQuery) -> Result<usize, StoreError> {
        query.validate()?;
        self.runtime.block_on(self.count_async(query))
    }

    #[instrument(skip(self, batch), fields(ops = batch.len()), err)]
    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.runtime.block_on(self.commit_async(batch))
    }

    #[instrument(skip(self), err)]
    fn purge_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<usize, StoreError> {
        self.runtime.block_on(self.purge_expired_async(now, limit))
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &DocumentQuery) {
    qb.push(" WHERE collection = ");
    qb.push_bind(query.collection.clone());

    for filter in &query.filters {
        let path = filter.path().to_vec();
        match filter {
            FieldFilter::Eq { value, .. } => {
                qb.push(" AND body #> ");
                qb.push_bind(path);
                qb.push(" = ");
                qb.push_bind(value.clone());
            }
            FieldFilter::OneOf { values, .. } if values.is_empty() => {
                qb.push(" AND FALSE");
            }
            FieldFilter::OneOf { values, .. } => {
                qb.push(" AND (");
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        qb.push(" OR ");
                    }
                    qb.push("body #> ");
                    qb.push_bind(path.clone());
                    qb.push(" = ");
                    qb.push_bind(value.clone());
                }
                qb.push(")");
            }
            FieldFilter::IsNull { .. } => {
                qb.push(" AND COALESCE(body #> ");
                qb.push_bind(path);
                qb.push(", 'null'::jsonb) = 'null'::jsonb");
            }
            FieldFilter::NotNull { .. } => {
                qb.push(" AND COALESCE(body #> ");
                qb.push_bind(path);
                qb.push(", 'null'::jsonb) <> 'null'::jsonb");
            }
            FieldFilter::Before { at, .. } => {
                // Filtered paths hold RFC 3339 strings; a null casts to NULL
                // and never matches.
                qb.push(" AND (body #>> ");
                qb.push_bind(path);
                qb.push(")::timestamptz < ");
                qb.push_bind(*at);
            }
        }
    }
}

async fn apply_op(tx: &mut Transaction<'_, Postgres>, op: WriteOp) -> Result<(), StoreError> {
    match op {
        WriteOp::Put {
            id,
            body,
            expires_at,
            expected,
        } => put(tx, &id, body, expires_at, expected).await,
        WriteOp::Delete { id, expected } => delete(tx, &id, expected).await,
        WriteOp::Increment {
            id,
            field,
            delta,
            expires_at,
        } => {
            sqlx::query(
                r#"
                INSERT INTO documents (id, collection, body, etag, expires_at)
                VALUES ($1, $2, jsonb_build_object($3::text, $4::bigint), 1, $5)
                ON CONFLICT (id) DO UPDATE SET
                    body = jsonb_set(
                        documents.body,
                        ARRAY[$3::text],
                        to_jsonb(COALESCE((documents.body ->> $3::text)::bigint, 0) + $4::bigint)
                    ),
                    etag = documents.etag + 1,
                    expires_at = COALESCE($5, documents.expires_at)
                "#,
            )
            .bind(id.to_string())
            .bind(id.collection())
            .bind(&field)
            .bind(delta)
            .bind(expires_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("increment", e))?;
            Ok(())
        }
    }
}

async fn put(
    tx: &mut Transaction<'_, Postgres>,
    id: &DocumentId,
    body: JsonValue,
    expires_at: Option<DateTime<Utc>>,
    expected: ExpectedEtag,
) -> Result<(), StoreError> {
    let result = match expected {
        ExpectedEtag::Absent => sqlx::query(
            r#"
            INSERT INTO documents (id, collection, body, etag, expires_at)
            VALUES ($1, $2, $3, 1, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id.to_string())
        .bind(id.collection())
        .bind(&body)
        .bind(expires_at)
        .execute(&mut **tx)
        .await,
        ExpectedEtag::Exact(etag) => sqlx::query(
            r#"
            UPDATE documents
            SET body = $2, etag = etag + 1, expires_at = $3
            WHERE id = $1 AND etag = $4
            "#,
        )
        .bind(id.to_string())
        .bind(&body)
        .bind(expires_at)
        .bind(etag as i64)
        .execute(&mut **tx)
        .await,
        ExpectedEtag::Any => sqlx::query(
            r#"
            INSERT INTO documents (id, collection, body, etag, expires_at)
            VALUES ($1, $2, $3, 1, $4)
            ON CONFLICT (id) DO UPDATE SET
                body = EXCLUDED.body,
                etag = documents.etag + 1,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(id.to_string())
        .bind(id.collection())
        .bind(&body)
        .bind(expires_at)
        .execute(&mut **tx)
        .await,
    }
    .map_err(|e| map_sqlx_error("put", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Concurrency(format!(
            "put '{id}': expected {expected:?}"
        )));
    }
    Ok(())
}

async fn delete(
    tx: &mut Transaction<'_, Postgres>,
    id: &DocumentId,
    expected: ExpectedEtag,
) -> Result<(), StoreError> {
    match expected {
        ExpectedEtag::Any => {
            sqlx::query("DELETE FROM documents WHERE id = $1")
                .bind(id.to_string())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("delete", e))?;
            Ok(())
        }
        ExpectedEtag::Exact(etag) => {
            let result = sqlx::query("DELETE FROM documents WHERE id = $1 AND etag = $2")
                .bind(id.to_string())
                .bind(etag as i64)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("delete", e))?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Concurrency(format!(
                    "delete '{id}': expected etag {etag}"
                )));
            }
            Ok(())
        }
        ExpectedEtag::Absent => {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM documents WHERE id = $1)")
                    .bind(id.to_string())
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(|e| map_sqlx_error("delete", e))?;
            if exists {
                return Err(StoreError::Concurrency(format!(
                    "delete '{id}': expected document to be absent"
                )));
            }
            Ok(())
        }
    }
}

fn decode_row(row: &PgRow) -> Result<StoredDocument, StoreError> {
    let read = |e: sqlx::Error| StoreError::Backend(format!("failed to decode document row: {e}"));

    let id: String = row.try_get("id").map_err(read)?;
    let body: JsonValue = row.try_get("body").map_err(read)?;
    let etag: i64 = row.try_get("etag").map_err(read)?;
    let sequence: i64 = row.try_get("sequence").map_err(read)?;
    let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at").map_err(read)?;

    Ok(StoredDocument {
        id: id.parse()?,
        body,
        etag: etag as u64,
        sequence: sequence as u64,
        expires_at,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") => StoreError::Concurrency(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
