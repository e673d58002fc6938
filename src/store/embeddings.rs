//! Transaction embedding index for similarity search.
//!
//! Cosine-distance nearest-neighbor search over a `pgvector` column,
//! filtered by age. Similarity is `1 - distance`; the minimum-similarity
//! floor is applied by the caller's settings.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{PgPool, Row};

use crate::error::StoreError;

/// One nearest-neighbor hit.
#[derive(Debug, Clone)]
pub struct NeighborHit {
    /// Matched transaction identifier.
    pub transaction_id: String,
    /// Cosine similarity in [0, 1].
    pub similarity: f64,
    /// Age of the stored embedding, in days.
    pub age_days: f64,
}

/// Vector index over transaction summaries.
#[async_trait]
pub trait EmbeddingIndex: Send + Sync {
    /// Insert or replace the embedding for a transaction.
    async fn upsert(
        &self,
        transaction_id: &str,
        summary: &str,
        embedding: &[f32],
    ) -> Result<(), StoreError>;

    /// Nearest neighbors by cosine distance, excluding the probe
    /// transaction itself and anything older than `max_age_days`.
    async fn search(
        &self,
        embedding: &[f32],
        limit: u32,
        max_age_days: u32,
        min_similarity: f64,
        exclude_transaction_id: &str,
    ) -> Result<Vec<NeighborHit>, StoreError>;
}

/// Postgres `pgvector` implementation.
#[derive(Debug, Clone)]
pub struct PgEmbeddingIndex {
    pool: PgPool,
}

impl PgEmbeddingIndex {
    /// Create an index over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmbeddingIndex for PgEmbeddingIndex {
    async fn upsert(
        &self,
        transaction_id: &str,
        summary: &str,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ops_agent.transaction_embeddings \
             (transaction_id, summary, embedding, created_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (transaction_id) DO UPDATE SET \
                 summary = EXCLUDED.summary, \
                 embedding = EXCLUDED.embedding",
        )
        .bind(transaction_id)
        .bind(summary)
        .bind(Vector::from(embedding.to_vec()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        limit: u32,
        max_age_days: u32,
        min_similarity: f64,
        exclude_transaction_id: &str,
    ) -> Result<Vec<NeighborHit>, StoreError> {
        let probe = Vector::from(embedding.to_vec());
        let rows = sqlx::query(
            "SELECT transaction_id, \
                    (1 - (embedding <=> $1))::float8 AS similarity, \
                    (EXTRACT(EPOCH FROM (now() - created_at)))::float8 / 86400.0 AS age_days \
             FROM ops_agent.transaction_embeddings \
             WHERE created_at >= now() - make_interval(days => $2) \
               AND transaction_id <> $3 \
             ORDER BY embedding <=> $1 \
             LIMIT $4",
        )
        .bind(probe)
        .bind(i32::try_from(max_age_days).unwrap_or(i32::MAX))
        .bind(exclude_transaction_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::new();
        for row in &rows {
            let similarity: f64 = row.try_get("similarity")?;
            if similarity < min_similarity {
                continue;
            }
            hits.push(NeighborHit {
                transaction_id: row.try_get("transaction_id")?,
                similarity,
                age_days: row.try_get("age_days")?,
            });
        }
        Ok(hits)
    }
}
