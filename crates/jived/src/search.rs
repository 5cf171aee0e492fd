//! Semantic, keyword, and hybrid search over work items.
//!
//! The vector index is an in-memory snapshot over the stored embedding
//! column: built lazily once the table crosses a size threshold, rebuilt
//! after enough churn, and swapped atomically so readers are always served
//! from a complete snapshot. Keyword search uses an FTS5 shadow table when
//! available and degrades to LIKE scans when it is not.

use crate::embedding::{EmbeddingError, EmbeddingService};
use crate::storage::{ListFilter, Storage, StorageError};
use jive_core::{VectorMetric, WorkItem};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

/// Vector index is built lazily on the first vector-mode search once the
/// table holds at least this many rows; below it a direct scan is cheaper.
const INDEX_BUILD_THRESHOLD: usize = 16;

/// Rebuild once writes since the last build exceed this fraction of the
/// indexed row count.
const INDEX_REBUILD_FRACTION: f64 = 0.25;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("no usable search index: {0}")]
    IndexUnavailable(String),
}

pub type Result<T> = std::result::Result<T, SearchError>;

/// Requested search mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Vector,
    Keyword,
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Keyword => "keyword",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vector" => Some(Self::Vector),
            "keyword" => Some(Self::Keyword),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

/// One scored search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub item: WorkItem,
    pub score: f64,
}

/// A ranked result set, with a marker when the requested mode was
/// substituted by its sibling.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub fallback_used: bool,
}

struct IndexSnapshot {
    entries: Vec<(String, Vec<f32>)>,
    rows_at_build: usize,
}

/// Search engine state shared across handlers.
pub struct SearchEngine {
    metric: VectorMetric,
    hybrid_alpha: f64,
    fts_enabled: bool,
    fts_available: AtomicBool,
    index: RwLock<Option<IndexSnapshot>>,
    writes_since_build: AtomicUsize,
}

impl SearchEngine {
    pub fn new(metric: VectorMetric, hybrid_alpha: f64, fts_enabled: bool) -> Self {
        Self {
            metric,
            hybrid_alpha,
            fts_enabled,
            fts_available: AtomicBool::new(false),
            index: RwLock::new(None),
            writes_since_build: AtomicUsize::new(0),
        }
    }

    /// Create the FTS table (with replace) and populate it from the store.
    /// Failure downgrades keyword search to LIKE scans instead of aborting
    /// startup.
    pub async fn init_fts(&self, storage: &Storage) -> Result<()> {
        if !self.fts_enabled {
            return Ok(());
        }

        let create = async {
            sqlx::query("DROP TABLE IF EXISTS work_items_fts")
                .execute(storage.pool())
                .await?;
            sqlx::query(
                "CREATE VIRTUAL TABLE work_items_fts USING fts5(\
                 id UNINDEXED, title, description, acceptance_criteria, status, priority, \
                 item_type, tokenize = 'porter unicode61')",
            )
            .execute(storage.pool())
            .await?;
            Ok::<(), sqlx::Error>(())
        };

        match create.await {
            Ok(()) => {
                self.fts_available.store(true, Ordering::SeqCst);
                let items = storage.list_work_items(&ListFilter::default()).await?;
                for item in &items {
                    self.fts_upsert(storage, item).await?;
                }
                tracing::info!(rows = items.len(), "fts index ready");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "fts unavailable, keyword search will use scans");
                self.fts_available.store(false, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Record a row write: keeps the FTS shadow current and ages the vector
    /// index snapshot.
    pub async fn note_write(&self, storage: &Storage, item: &WorkItem) {
        self.writes_since_build.fetch_add(1, Ordering::SeqCst);
        if self.fts_available.load(Ordering::SeqCst) {
            if let Err(e) = self.fts_upsert(storage, item).await {
                tracing::warn!(id = %item.id, error = %e, "fts upsert failed");
                self.fts_available.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Record row deletions.
    pub async fn note_delete(&self, storage: &Storage, ids: &[String]) {
        self.writes_since_build
            .fetch_add(ids.len(), Ordering::SeqCst);
        if self.fts_available.load(Ordering::SeqCst) {
            for id in ids {
                let result = sqlx::query("DELETE FROM work_items_fts WHERE id = ?1")
                    .bind(id)
                    .execute(storage.pool())
                    .await;
                if let Err(e) = result {
                    tracing::warn!(id = %id, error = %e, "fts delete failed");
                }
            }
        }
    }

    async fn fts_upsert(&self, storage: &Storage, item: &WorkItem) -> Result<()> {
        sqlx::query("DELETE FROM work_items_fts WHERE id = ?1")
            .bind(&item.id)
            .execute(storage.pool())
            .await
            .map_err(StorageError::from)?;
        sqlx::query(
            "INSERT INTO work_items_fts (id, title, description, acceptance_criteria, status, \
             priority, item_type) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&item.id)
        .bind(&item.title)
        .bind(&item.description)
        .bind(item.acceptance_criteria.join(" "))
        .bind(item.status.as_str())
        .bind(item.priority.as_str())
        .bind(item.item_type.as_str())
        .execute(storage.pool())
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    /// Run a search in the requested mode, falling back to the sibling mode
    /// when the primary is unusable.
    pub async fn search(
        &self,
        storage: &Storage,
        embedding: &EmbeddingService,
        query: &str,
        mode: SearchMode,
        filter: &ListFilter,
        limit: usize,
    ) -> Result<SearchResponse> {
        match mode {
            SearchMode::Vector => match self.vector_scores(storage, embedding, query).await {
                Ok(scores) => Ok(SearchResponse {
                    hits: self.materialise(storage, scores, filter, limit).await?,
                    fallback_used: false,
                }),
                Err(primary) => {
                    tracing::warn!(error = %primary, "vector search failed, trying keyword");
                    let scores = self
                        .keyword_scores(storage, query)
                        .await
                        .map_err(|_| sibling_failure(&primary))?;
                    Ok(SearchResponse {
                        hits: self.materialise(storage, scores, filter, limit).await?,
                        fallback_used: true,
                    })
                }
            },
            SearchMode::Keyword => match self.keyword_scores(storage, query).await {
                Ok(scores) => Ok(SearchResponse {
                    hits: self.materialise(storage, scores, filter, limit).await?,
                    fallback_used: false,
                }),
                Err(primary) => {
                    tracing::warn!(error = %primary, "keyword search failed, trying vector");
                    let scores = self
                        .vector_scores(storage, embedding, query)
                        .await
                        .map_err(|_| sibling_failure(&primary))?;
                    Ok(SearchResponse {
                        hits: self.materialise(storage, scores, filter, limit).await?,
                        fallback_used: true,
                    })
                }
            },
            SearchMode::Hybrid => {
                // Hybrid combines the two indexes; when the FTS index is off
                // or broken the keyword half drops out and the response is
                // marked as degraded. The LIKE scan only backs pure keyword
                // searches.
                let keyword_side = async {
                    if self.fts_available.load(Ordering::SeqCst) {
                        self.fts_scores(storage, query).await
                    } else {
                        Err(SearchError::IndexUnavailable(
                            "fts index disabled".to_string(),
                        ))
                    }
                };
                let (vector, keyword) = tokio::join!(
                    self.vector_scores(storage, embedding, query),
                    keyword_side
                );

                let (scores, fallback_used) = match (vector, keyword) {
                    (Ok(v), Ok(k)) => (self.combine(v, k), false),
                    (Ok(v), Err(e)) => {
                        tracing::warn!(error = %e, "hybrid search degraded to vector only");
                        (v, true)
                    }
                    (Err(e), Ok(k)) => {
                        tracing::warn!(error = %e, "hybrid search degraded to keyword only");
                        (k, true)
                    }
                    (Err(v), Err(_)) => return Err(sibling_failure(&v)),
                };

                Ok(SearchResponse {
                    hits: self.materialise(storage, scores, filter, limit).await?,
                    fallback_used,
                })
            }
        }
    }

    /// Weighted merge of the two score maps, deduplicating by id.
    fn combine(
        &self,
        vector: Vec<(String, f64)>,
        keyword: Vec<(String, f64)>,
    ) -> Vec<(String, f64)> {
        let alpha = self.hybrid_alpha;
        // Duplicate ids within one mode keep their best score; ids present
        // in both modes get the weighted sum.
        let mut vector_best: HashMap<String, f64> = HashMap::new();
        for (id, score) in vector {
            let entry = vector_best.entry(id).or_insert(0.0);
            *entry = entry.max(score);
        }
        let mut keyword_best: HashMap<String, f64> = HashMap::new();
        for (id, score) in keyword {
            let entry = keyword_best.entry(id).or_insert(0.0);
            *entry = entry.max(score);
        }

        let mut merged: HashMap<String, f64> = HashMap::new();
        for (id, score) in vector_best {
            *merged.entry(id).or_insert(0.0) += alpha * score;
        }
        for (id, score) in keyword_best {
            *merged.entry(id).or_insert(0.0) += (1.0 - alpha) * score;
        }
        let mut out: Vec<(String, f64)> = merged.into_iter().collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// Load rows for scored ids, apply filters, and cut to `limit`.
    async fn materialise(
        &self,
        storage: &Storage,
        scores: Vec<(String, f64)>,
        filter: &ListFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let ids: Vec<String> = scores.iter().map(|(id, _)| id.clone()).collect();
        let items = storage.get_work_items(&ids).await?;
        let by_id: HashMap<String, WorkItem> =
            items.into_iter().map(|item| (item.id.clone(), item)).collect();

        let mut hits = Vec::new();
        for (id, score) in scores {
            if hits.len() >= limit {
                break;
            }
            if let Some(item) = by_id.get(&id) {
                if filter.matches(item) {
                    hits.push(SearchHit {
                        item: item.clone(),
                        score,
                    });
                }
            }
        }
        Ok(hits)
    }

    // --- Vector mode ---

    async fn vector_scores(
        &self,
        storage: &Storage,
        embedding: &EmbeddingService,
        query: &str,
    ) -> Result<Vec<(String, f64)>> {
        let query_vector = embedding.embed(query).await?;
        let rows = storage.row_count().await? as usize;

        let entries = if rows >= INDEX_BUILD_THRESHOLD {
            self.ensure_index(storage, rows).await?;
            let guard = self.index.read().await;
            let snapshot = guard
                .as_ref()
                .ok_or_else(|| SearchError::IndexUnavailable("vector index missing".into()))?;
            snapshot
                .entries
                .iter()
                .map(|(id, v)| (id.clone(), self.score_vectors(&query_vector, v)))
                .collect::<Vec<_>>()
        } else {
            // Small table: score directly against stored vectors.
            storage
                .all_vectors()
                .await?
                .into_iter()
                .map(|(id, v)| (id, self.score_vectors(&query_vector, &v)))
                .collect()
        };

        let mut scores = entries;
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scores)
    }

    /// Build or rebuild the snapshot when absent or sufficiently stale.
    /// Readers keep using the previous snapshot until the swap.
    async fn ensure_index(&self, storage: &Storage, rows: usize) -> Result<()> {
        let needs_build = {
            let guard = self.index.read().await;
            match guard.as_ref() {
                None => true,
                Some(snapshot) => {
                    let churn = self.writes_since_build.load(Ordering::SeqCst) as f64;
                    churn > (snapshot.rows_at_build.max(1) as f64) * INDEX_REBUILD_FRACTION
                }
            }
        };
        if !needs_build {
            return Ok(());
        }

        let entries = storage.all_vectors().await?;
        let snapshot = IndexSnapshot {
            rows_at_build: rows,
            entries,
        };
        let mut guard = self.index.write().await;
        *guard = Some(snapshot);
        self.writes_since_build.store(0, Ordering::SeqCst);
        tracing::debug!(rows, "vector index rebuilt");
        Ok(())
    }

    /// Similarity score in [0, 1]; 1 means identical.
    fn score_vectors(&self, a: &[f32], b: &[f32]) -> f64 {
        if a.is_empty() || b.is_empty() || a.len() != b.len() {
            return 0.0;
        }
        match self.metric {
            VectorMetric::Cosine => {
                let mut dot = 0.0_f64;
                let mut norm_a = 0.0_f64;
                let mut norm_b = 0.0_f64;
                for (x, y) in a.iter().zip(b) {
                    dot += f64::from(*x) * f64::from(*y);
                    norm_a += f64::from(*x) * f64::from(*x);
                    norm_b += f64::from(*y) * f64::from(*y);
                }
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 0.0;
                }
                let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
                ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
            }
            VectorMetric::L2 => {
                let dist: f64 = a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| {
                        let d = f64::from(*x) - f64::from(*y);
                        d * d
                    })
                    .sum::<f64>()
                    .sqrt();
                1.0 / (1.0 + dist)
            }
        }
    }

    // --- Keyword mode ---

    async fn keyword_scores(&self, storage: &Storage, query: &str) -> Result<Vec<(String, f64)>> {
        if self.fts_available.load(Ordering::SeqCst) {
            match self.fts_scores(storage, query).await {
                Ok(scores) => return Ok(scores),
                Err(e) => {
                    tracing::warn!(error = %e, "fts query failed, falling back to scans");
                }
            }
        }
        self.like_scores(storage, query).await
    }

    async fn fts_scores(&self, storage: &Storage, query: &str) -> Result<Vec<(String, f64)>> {
        let Some(expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };

        let rows: Vec<(String, f64)> = sqlx::query_as(
            "SELECT id, rank FROM work_items_fts WHERE work_items_fts MATCH ?1 ORDER BY rank",
        )
        .bind(&expr)
        .fetch_all(storage.pool())
        .await
        .map_err(StorageError::from)?;

        // bm25 rank is negative with better matches more negative; flip and
        // normalise by the best raw score.
        let best = rows.iter().map(|(_, rank)| -rank).fold(0.0_f64, f64::max);
        if best <= 0.0 {
            return Ok(rows.into_iter().map(|(id, _)| (id, 0.0)).collect());
        }
        Ok(rows
            .into_iter()
            .map(|(id, rank)| (id, ((-rank) / best).clamp(0.0, 1.0)))
            .collect())
    }

    /// Substring-scan fallback over the indexed columns.
    async fn like_scores(&self, storage: &Storage, query: &str) -> Result<Vec<(String, f64)>> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let items = storage.list_work_items(&ListFilter::default()).await?;
        let mut raw: Vec<(String, f64)> = Vec::new();
        for item in &items {
            let title = item.title.to_lowercase();
            let description = item.description.to_lowercase();
            let criteria = item.acceptance_criteria.join(" ").to_lowercase();
            let mut score = 0.0_f64;
            for term in &terms {
                // Title matches weigh heaviest.
                score += 3.0 * count_occurrences(&title, term) as f64;
                score += count_occurrences(&description, term) as f64;
                score += count_occurrences(&criteria, term) as f64;
                if item.status.as_str() == term
                    || item.priority.as_str() == term
                    || item.item_type.as_str() == term
                {
                    score += 1.0;
                }
            }
            if score > 0.0 {
                raw.push((item.id.clone(), score));
            }
        }

        let best = raw.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);
        if best > 0.0 {
            for (_, score) in &mut raw {
                *score = (*score / best).clamp(0.0, 1.0);
            }
        }
        raw.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(raw)
    }
}

fn sibling_failure(primary: &SearchError) -> SearchError {
    SearchError::IndexUnavailable(format!("both search modes failed; first error: {primary}"))
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    haystack.matches(needle).count()
}

/// Build an FTS5 MATCH expression from free text. Double-quoted segments
/// are preserved as phrases; remaining tokens are OR-ed for recall.
fn fts_match_expr(query: &str) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut rest = query;

    while let Some(start) = rest.find('"') {
        let before = &rest[..start];
        push_tokens(&mut parts, before);
        let after = &rest[start + 1..];
        if let Some(end) = after.find('"') {
            let phrase = sanitize_phrase(&after[..end]);
            if !phrase.is_empty() {
                parts.push(format!("\"{phrase}\""));
            }
            rest = &after[end + 1..];
        } else {
            rest = after;
            break;
        }
    }
    push_tokens(&mut parts, rest);

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" OR "))
    }
}

fn push_tokens(parts: &mut Vec<String>, text: &str) {
    for token in text.split(|c: char| !c.is_alphanumeric()) {
        if !token.is_empty() {
            parts.push(format!("\"{token}\""));
        }
    }
}

fn sanitize_phrase(phrase: &str) -> String {
    phrase
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
