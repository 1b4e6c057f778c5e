//! SQLite-backed [`VectorIndex`].
//!
//! Opens (and creates if missing) the database at `[index] path` in WAL
//! mode and runs idempotent migrations on open:
//!
//! - `documents`: one row per ingested document
//! - `chunks`: positioned passages with their character spans and hash
//! - `chunk_vectors`: one embedding BLOB per chunk
//!
//! Vectors are stored as little-endian `f32` bytes (see
//! [`vec_to_blob`](crate::embedding::vec_to_blob)); search loads every
//! vector and ranks by cosine similarity in Rust.

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::config::IndexConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{Chunk, Document, EmbeddingRecord, IndexStats, RetrievedCandidate};

use super::{rank, VectorIndex};

pub struct SqliteIndex {
    name: String,
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Connect to the database and apply migrations.
    pub async fn open(config: &IndexConfig) -> Result<Self> {
        let db_path = &config.path;

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create index directory: {}", parent.display())
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open index: {}", db_path.display()))?;

        run_migrations(&pool).await?;

        Ok(Self {
            name: config.name.clone(),
            pool,
        })
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            source TEXT NOT NULL,
            body TEXT NOT NULL,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            token_count INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            UNIQUE(document_id, position),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_document_id ON chunk_vectors(document_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        position: row.get::<i64, _>("position") as usize,
        start: row.get::<i64, _>("start_offset") as usize,
        end: row.get::<i64, _>("end_offset") as usize,
        token_count: row.get::<i64, _>("token_count") as usize,
        title: row.get("title"),
        source: row.get("source"),
        text: row.get("text"),
        hash: row.get("hash"),
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn upsert(&self, doc: &Document, records: &[EmbeddingRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Cascades to chunks and chunk_vectors.
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO documents (id, title, source, body, ingested_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&doc.id)
        .bind(&doc.title)
        .bind(&doc.source)
        .bind(&doc.text)
        .bind(doc.ingested_at.timestamp())
        .execute(&mut *tx)
        .await?;

        for record in records {
            let chunk = &record.chunk;
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (id, document_id, position, start_offset, end_offset, token_count, text, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.position as i64)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .bind(chunk.token_count as i64)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, document_id, dims, embedding) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(record.vector.len() as i64)
            .bind(vec_to_blob(&record.vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<RetrievedCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.position, c.start_offset, c.end_offset,
                   c.token_count, c.text, c.hash, d.title, d.source, cv.embedding
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            JOIN documents d ON d.id = c.document_id
            ORDER BY d.ingested_at, c.document_id, c.position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let candidates = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                RetrievedCandidate {
                    chunk: row_to_chunk(row),
                    similarity: cosine_similarity(query, &vector) as f64,
                }
            })
            .collect();

        Ok(rank(candidates, top_k))
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn document_count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn list_chunks(&self, limit: usize) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.position, c.start_offset, c.end_offset,
                   c.token_count, c.text, c.hash, d.title, d.source
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            ORDER BY d.ingested_at, c.document_id, c.position
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM documents").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM chunk_vectors LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(IndexStats {
            index_name: self.name.clone(),
            backend: self.backend().to_string(),
            total_vectors: self.count().await?,
            total_documents: self.document_count().await?,
            dimensions: dims.map(|d| d as usize),
        })
    }
}
