//! Postgres + pgvector implementation of the indexed tier.
//!
//! The embedding column carries an IVFFlat cosine index for the ANN leg of
//! candidate retrieval; the Hamming window leg is served by the
//! `(tenant, simhash)` btree plus `bit_count` over the XOR (Postgres 14+).
//! Vectors are bound as pgvector text literals (`[x,y,...]::vector`).

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    PgPool, Row,
    postgres::{PgConnectOptions, PgPoolOptions, PgRow},
};
use tracing::info;
use uuid::Uuid;

use super::{
    CacheEntry, Candidate, CandidateQuery, IndexStats, IndexStore, ModelFilter, NewCacheEntry,
};
use crate::{
    cache::error::{CacheError, CacheResult},
    config::PostgresIndexConfig,
    fingerprint::{RequestMode, TemperatureBucket},
};

pub struct PostgresIndexStore {
    pool: PgPool,
    table: String,
    dimensions: usize,
}

impl PostgresIndexStore {
    /// Connect and ensure schema. `dimensions` fixes the vector column width
    /// and must match the embedder for the life of the table.
    pub async fn connect(config: &PostgresIndexConfig, dimensions: usize) -> CacheResult<Self> {
        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| CacheError::Connection(e.to_string()))?
            .options([(
                "statement_timeout",
                format!("{}s", config.statement_timeout_secs),
            )]);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let store = Self {
            pool,
            table: config.table_name.clone(),
            dimensions,
        };
        store.initialize(config.ivf_lists).await?;
        Ok(store)
    }

    async fn initialize(&self, ivf_lists: u32) -> CacheResult<()> {
        info!(table = %self.table, dimensions = self.dimensions, "initializing indexed tier");

        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                tenant TEXT NOT NULL,
                exact_key TEXT NOT NULL,
                simhash BIGINT NOT NULL,
                embedding vector({dims}) NOT NULL,
                canonical_prompt TEXT NOT NULL,
                raw_prompt_hmac TEXT NOT NULL,
                request_blob JSONB NOT NULL,
                response_blob JSONB NOT NULL,
                model TEXT NOT NULL,
                temperature_bucket TEXT NOT NULL,
                mode TEXT NOT NULL,
                tool_schema_hash TEXT NOT NULL,
                hit_count BIGINT NOT NULL DEFAULT 0,
                last_hit_at TIMESTAMPTZ,
                is_golden BOOLEAN NOT NULL DEFAULT FALSE,
                pii_present BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                expires_at TIMESTAMPTZ,
                UNIQUE (tenant, exact_key)
            )
            "#,
            table = self.table,
            dims = self.dimensions,
        );
        sqlx::query(&create_table).execute(&self.pool).await.map_err(db_err)?;

        for ddl in [
            format!(
                "CREATE INDEX IF NOT EXISTS {t}_simhash_idx ON {t} (tenant, simhash)",
                t = self.table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {t}_model_mode_idx ON {t} (tenant, model, mode)",
                t = self.table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {t}_expires_idx ON {t} (expires_at) \
                 WHERE expires_at IS NOT NULL",
                t = self.table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {t}_embedding_idx ON {t} \
                 USING ivfflat (embedding vector_cosine_ops) WITH (lists = {lists})",
                t = self.table,
                lists = ivf_lists
            ),
        ] {
            sqlx::query(&ddl).execute(&self.pool).await.map_err(db_err)?;
        }

        Ok(())
    }

    fn vector_literal(embedding: &[f32]) -> String {
        let mut out = String::with_capacity(embedding.len() * 10 + 2);
        out.push('[');
        for (i, v) in embedding.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!("{v}"));
        }
        out.push(']');
        out
    }

    /// How many rows the Hamming-window leg may claim. When an embedding is
    /// supplied, headroom is reserved so a saturated window cannot starve
    /// the ANN leg's neighbours out of the combined candidate set.
    fn window_limit(limit: u32, ann_top_k: u32, has_embedding: bool) -> u32 {
        if has_embedding {
            limit.saturating_sub(ann_top_k)
        } else {
            limit
        }
    }

    /// Build the model restriction clause. `next_param` is the 1-based index
    /// the clause's bind placeholder should use; the returned bind value is
    /// None when no placeholder was emitted.
    fn model_clause(filter: ModelFilter<'_>, next_param: usize) -> (String, Option<String>) {
        match filter {
            ModelFilter::Exact(model) => {
                (format!("AND model = ${next_param}"), Some(model.to_string()))
            }
            ModelFilter::FamilyPrefix(prefix) => (
                format!("AND model LIKE ${next_param}"),
                Some(format!("{}%", escape_like(prefix))),
            ),
            ModelFilter::Any => (String::new(), None),
        }
    }

    const ENTRY_COLUMNS: &'static str = "id, tenant, exact_key, simhash, canonical_prompt, \
        raw_prompt_hmac, request_blob, response_blob, model, temperature_bucket, mode, \
        tool_schema_hash, hit_count, last_hit_at, is_golden, pii_present, created_at, expires_at";

    fn entry_from_row(row: &PgRow) -> CacheResult<CacheEntry> {
        let bucket: String = row.try_get("temperature_bucket").map_err(db_err)?;
        let mode: String = row.try_get("mode").map_err(db_err)?;
        Ok(CacheEntry {
            id: row.try_get("id").map_err(db_err)?,
            tenant: row.try_get("tenant").map_err(db_err)?,
            exact_key: row.try_get("exact_key").map_err(db_err)?,
            simhash: row.try_get("simhash").map_err(db_err)?,
            canonical_prompt: row.try_get("canonical_prompt").map_err(db_err)?,
            raw_prompt_hmac: row.try_get("raw_prompt_hmac").map_err(db_err)?,
            request_blob: row.try_get("request_blob").map_err(db_err)?,
            response_blob: row.try_get("response_blob").map_err(db_err)?,
            model: row.try_get("model").map_err(db_err)?,
            temperature_bucket: TemperatureBucket::parse(&bucket)
                .ok_or_else(|| CacheError::Deserialization(format!("bad bucket '{bucket}'")))?,
            mode: RequestMode::parse(&mode)
                .ok_or_else(|| CacheError::Deserialization(format!("bad mode '{mode}'")))?,
            tool_schema_hash: row.try_get("tool_schema_hash").map_err(db_err)?,
            hit_count: row.try_get("hit_count").map_err(db_err)?,
            last_hit_at: row.try_get("last_hit_at").map_err(db_err)?,
            is_golden: row.try_get("is_golden").map_err(db_err)?,
            pii_present: row.try_get("pii_present").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            expires_at: row.try_get("expires_at").map_err(db_err)?,
        })
    }

    fn candidate_from_row(row: &PgRow) -> CacheResult<Candidate> {
        let hamming: i64 = row.try_get("hamming").map_err(db_err)?;
        let cosine: Option<f64> = row.try_get("cosine_similarity").map_err(db_err)?;
        Ok(Candidate {
            entry: Self::entry_from_row(row)?,
            hamming: hamming.clamp(0, 64) as u32,
            cosine_similarity: cosine,
        })
    }
}

fn db_err(e: sqlx::Error) -> CacheError {
    CacheError::Database(e.to_string())
}

fn escape_like(value: &str) -> String {
    value.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[async_trait]
impl IndexStore for PostgresIndexStore {
    async fn insert(&self, entry: NewCacheEntry) -> CacheResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {table} (
                id, tenant, exact_key, simhash, embedding, canonical_prompt,
                raw_prompt_hmac, request_blob, response_blob, model,
                temperature_bucket, mode, tool_schema_hash, pii_present, expires_at
            )
            VALUES ($1, $2, $3, $4, $5::vector, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (tenant, exact_key) DO NOTHING
            "#,
            table = self.table,
        );

        sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&entry.tenant)
            .bind(&entry.exact_key)
            .bind(entry.simhash)
            .bind(Self::vector_literal(&entry.embedding))
            .bind(&entry.canonical_prompt)
            .bind(&entry.raw_prompt_hmac)
            .bind(&entry.request_blob)
            .bind(&entry.response_blob)
            .bind(&entry.model)
            .bind(entry.temperature_bucket.as_str())
            .bind(entry.mode.as_str())
            .bind(&entry.tool_schema_hash)
            .bind(entry.pii_present)
            .bind(entry.expires_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn fetch_candidates(&self, query: CandidateQuery<'_>) -> CacheResult<Vec<Candidate>> {
        // Placeholders are numbered sequentially so that no bound parameter
        // goes unreferenced: $1 tenant, $2 mode, optional model, simhash,
        // max hamming, optional embedding.
        let (model_clause, model_bind) = Self::model_clause(query.model_filter, 3);
        let base = if model_bind.is_some() { 3 } else { 2 };
        let sim_param = base + 1;
        let ham_param = base + 2;
        let emb_param = base + 3;
        let embedding_literal = query.embedding.map(Self::vector_literal);

        // Leg 1: the Hamming window, ordered by distance then popularity.
        let cosine_select = if embedding_literal.is_some() {
            format!("1 - (embedding <=> ${emb_param}::vector)")
        } else {
            "NULL::float8".to_string()
        };
        let window_sql = format!(
            r#"
            SELECT {columns},
                   bit_count((simhash # ${sim_param})::bit(64)) AS hamming,
                   {cosine} AS cosine_similarity
            FROM {table}
            WHERE tenant = $1
              AND mode = $2
              {model_clause}
              AND (expires_at IS NULL OR expires_at > now())
              AND bit_count((simhash # ${sim_param})::bit(64)) <= ${ham_param}
            ORDER BY hamming ASC, hit_count DESC
            LIMIT {limit}
            "#,
            columns = Self::ENTRY_COLUMNS,
            cosine = cosine_select,
            table = self.table,
            model_clause = model_clause,
            limit = Self::window_limit(query.limit, query.ann_top_k, embedding_literal.is_some()),
        );

        let mut window_query = sqlx::query(&window_sql)
            .bind(query.tenant)
            .bind(query.mode.as_str());
        if let Some(model) = &model_bind {
            window_query = window_query.bind(model);
        }
        window_query = window_query
            .bind(query.simhash)
            .bind(i64::from(query.max_hamming));
        if let Some(literal) = &embedding_literal {
            window_query = window_query.bind(literal);
        }
        let rows = window_query.fetch_all(&self.pool).await.map_err(db_err)?;
        let mut candidates: Vec<Candidate> = rows
            .iter()
            .map(Self::candidate_from_row)
            .collect::<CacheResult<_>>()?;

        // Leg 2: ANN neighbours by cosine distance, beyond the window.
        if let Some(literal) = &embedding_literal {
            let ann_emb_param = base + 2;
            let ann_sql = format!(
                r#"
                SELECT {columns},
                       bit_count((simhash # ${sim_param})::bit(64)) AS hamming,
                       1 - (embedding <=> ${ann_emb_param}::vector) AS cosine_similarity
                FROM {table}
                WHERE tenant = $1
                  AND mode = $2
                  {model_clause}
                  AND (expires_at IS NULL OR expires_at > now())
                ORDER BY embedding <=> ${ann_emb_param}::vector
                LIMIT {top_k}
                "#,
                columns = Self::ENTRY_COLUMNS,
                table = self.table,
                model_clause = model_clause,
                top_k = query.ann_top_k,
            );
            let mut ann_query = sqlx::query(&ann_sql)
                .bind(query.tenant)
                .bind(query.mode.as_str());
            if let Some(model) = &model_bind {
                ann_query = ann_query.bind(model);
            }
            let rows = ann_query
                .bind(query.simhash)
                .bind(literal)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
            for row in &rows {
                let candidate = Self::candidate_from_row(row)?;
                if !candidates.iter().any(|c| c.entry.id == candidate.entry.id) {
                    candidates.push(candidate);
                }
            }
        }

        candidates.truncate(query.limit as usize);
        Ok(candidates)
    }

    async fn record_hit(&self, id: Uuid) -> CacheResult<()> {
        let sql = format!(
            "UPDATE {table} SET hit_count = hit_count + 1, last_hit_at = now() WHERE id = $1",
            table = self.table,
        );
        sqlx::query(&sql).bind(id).execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    async fn record_hit_by_exact(&self, tenant: &str, exact_key: &str) -> CacheResult<()> {
        let sql = format!(
            "UPDATE {table} SET hit_count = hit_count + 1, last_hit_at = now() \
             WHERE tenant = $1 AND exact_key = $2",
            table = self.table,
        );
        sqlx::query(&sql)
            .bind(tenant)
            .bind(exact_key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_golden(
        &self,
        id: Uuid,
        golden: bool,
        restored_expiry: Option<DateTime<Utc>>,
    ) -> CacheResult<bool> {
        let sql = format!(
            "UPDATE {table} SET is_golden = $2, expires_at = $3 WHERE id = $1",
            table = self.table,
        );
        let expires_at = if golden { None } else { restored_expiry };
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(golden)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, batch: u32) -> CacheResult<u64> {
        let sql = format!(
            r#"
            DELETE FROM {table}
            WHERE id IN (
                SELECT id FROM {table}
                WHERE expires_at IS NOT NULL AND expires_at < now() AND NOT is_golden
                LIMIT {batch}
            )
            "#,
            table = self.table,
        );
        let result = sqlx::query(&sql).execute(&self.pool).await.map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn clear(&self, tenant: Option<&str>) -> CacheResult<u64> {
        let result = match tenant {
            Some(tenant) => {
                let sql = format!("DELETE FROM {table} WHERE tenant = $1", table = self.table);
                sqlx::query(&sql).bind(tenant).execute(&self.pool).await
            }
            None => {
                let sql = format!("DELETE FROM {table}", table = self.table);
                sqlx::query(&sql).execute(&self.pool).await
            }
        }
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> CacheResult<IndexStats> {
        let sql = format!(
            "SELECT count(*) AS entries, count(*) FILTER (WHERE is_golden) AS golden \
             FROM {table}",
            table = self.table,
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await.map_err(db_err)?;
        let entries: i64 = row.try_get("entries").map_err(db_err)?;
        let golden: i64 = row.try_get("golden").map_err(db_err)?;
        Ok(IndexStats {
            entries: entries.max(0) as u64,
            golden_entries: golden.max(0) as u64,
        })
    }

    async fn ping(&self) -> CacheResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_literal_formats_pgvector_syntax() {
        assert_eq!(PostgresIndexStore::vector_literal(&[1.0, -0.5, 0.25]), "[1,-0.5,0.25]");
        assert_eq!(PostgresIndexStore::vector_literal(&[]), "[]");
    }

    #[test]
    fn like_escape_neutralizes_wildcards() {
        assert_eq!(escape_like("gpt_4%"), "gpt\\_4\\%");
    }

    #[test]
    fn window_limit_reserves_ann_headroom() {
        assert_eq!(PostgresIndexStore::window_limit(100, 8, true), 92);
        assert_eq!(PostgresIndexStore::window_limit(100, 8, false), 100);
        // top_k larger than the limit must not underflow.
        assert_eq!(PostgresIndexStore::window_limit(4, 8, true), 0);
    }
}
