//! SQLite persistence for work items, execution records, and sync state.
//!
//! This layer speaks rows and SQL only; invariants, the status machine, and
//! the embedding pipeline are enforced by the store above it. Array-valued
//! columns are JSON text at rest and are always materialised into `Vec`s
//! before a row leaves this module.

use chrono::{DateTime, Utc};
use jive_core::{
    ExecutionLogEntry, ExecutionMode, ExecutionRecord, ExecutionStatus, ItemType, LogLevel,
    Priority, Status, SyncDirection, SyncState, ValidationCheck, WorkItem,
};
use serde::Deserialize;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;

/// Explicit column list for work_items queries. Explicit columns keep row
/// mapping correct regardless of column order after ALTER TABLE migrations.
const WORK_ITEM_COLUMNS: &str = "id, item_id, item_type, title, description, status, priority, \
    parent_id, dependencies, assignee, tags, acceptance_criteria, estimated_hours, actual_hours, \
    progress, autonomous_executable, execution_instructions, metadata, created_at, updated_at, \
    vector";

const EXECUTION_COLUMNS: &str = "execution_id, work_item_id, mode, status, plan, agent_context, \
    started_at, finished_at, cancel_reason, rollback_requested, artifacts, validation_results";

/// Transient back-end errors are retried with exponential backoff before
/// being surfaced: 1 s initial delay, doubling, three attempts, jittered.
const MAX_WRITE_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("work item not found: {0}")]
    WorkItemNotFound(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("corrupt row {id}: {detail}")]
    CorruptRow { id: String, detail: String },
}

impl StorageError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => {
                let msg = db.message().to_ascii_lowercase();
                msg.contains("locked") || msg.contains("busy")
            }
            Self::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Retry an awaited storage expression on transient failures.
macro_rules! with_retry {
    ($body:expr) => {{
        let mut delay = std::time::Duration::from_secs(1);
        let mut attempt = 1u32;
        loop {
            match $body {
                Ok(value) => break Ok(value),
                Err(e) => {
                    let err: StorageError = e;
                    if err.is_transient() && attempt < MAX_WRITE_ATTEMPTS {
                        let jitter =
                            std::time::Duration::from_millis(rand::random::<u64>() % 250);
                        tracing::warn!(attempt, error = %err, "transient storage error, retrying");
                        tokio::time::sleep(delay + jitter).await;
                        delay *= 2;
                        attempt += 1;
                    } else {
                        break Err(err);
                    }
                }
            }
        }
    }};
}

/// Sort key for work-item listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Title,
    Priority,
}

impl SortField {
    fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Title => "title COLLATE NOCASE",
            // Stored as text; explicit ordinal ordering.
            Self::Priority => {
                "CASE priority WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 \
                 WHEN 'medium' THEN 2 ELSE 3 END"
            }
        }
    }
}

/// Filters for list/count/search operations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListFilter {
    pub item_type: Option<Vec<ItemType>>,
    pub status: Option<Vec<Status>>,
    pub priority: Option<Vec<Priority>>,
    pub parent_id: Option<String>,
    pub assignee: Option<String>,
    pub tag: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub sort_by: Option<SortField>,
    pub descending: bool,
}

impl ListFilter {
    /// Whether a loaded item passes the non-SQL parts of the filter.
    /// Used by search, which filters candidates after retrieval.
    pub fn matches(&self, item: &WorkItem) -> bool {
        if let Some(types) = &self.item_type {
            if !types.is_empty() && !types.contains(&item.item_type) {
                return false;
            }
        }
        if let Some(statuses) = &self.status {
            if !statuses.is_empty() && !statuses.contains(&item.status) {
                return false;
            }
        }
        if let Some(priorities) = &self.priority {
            if !priorities.is_empty() && !priorities.contains(&item.priority) {
                return false;
            }
        }
        if let Some(parent) = &self.parent_id {
            if item.parent_id.as_deref() != Some(parent.as_str()) {
                return false;
            }
        }
        if let Some(assignee) = &self.assignee {
            if item.assignee.as_deref() != Some(assignee.as_str()) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !item.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        true
    }
}

/// Per-key async write locks. Writers to the same key are serialised for
/// the whole read-validate-write-index sequence; readers never take these.
#[derive(Default)]
struct LockRegistry {
    inner: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockRegistry {
    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().expect("lock registry poisoned");
        Arc::clone(
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

/// Storage backend for the engine.
pub struct Storage {
    pool: Pool<Sqlite>,
    item_locks: LockRegistry,
    sync_locks: LockRegistry,
}

impl Storage {
    /// Open (or create) the database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // WAL keeps readers unblocked during writes.
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            item_locks: LockRegistry::default(),
            sync_locks: LockRegistry::default(),
        })
    }

    /// Run embedded migrations.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    match sqlx::query(trimmed).execute(&self.pool).await {
                        Ok(_) => {}
                        Err(e) => {
                            let msg = e.to_string();
                            if !msg.contains("duplicate column") && !msg.contains("already exists")
                            {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Close the pool, flushing pending writes.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Acquire the write lock for a work item id. Held for the duration of
    /// read-validate-write-index sequences.
    pub async fn item_write_guard(&self, id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        self.item_locks.lock_for(id).lock_owned().await
    }

    /// Acquire the write lock for a sync pair.
    pub async fn sync_write_guard(
        &self,
        file_path: &str,
        work_item_id: &str,
    ) -> tokio::sync::OwnedMutexGuard<()> {
        let key = format!("{file_path}\u{1f}{work_item_id}");
        self.sync_locks.lock_for(&key).lock_owned().await
    }

    // --- Work item rows ---

    /// Insert a new work item row.
    pub async fn insert_work_item(&self, item: &WorkItem) -> Result<()> {
        with_retry!(self.try_insert_work_item(item).await)
    }

    async fn try_insert_work_item(&self, item: &WorkItem) -> Result<()> {
        let dependencies = serde_json::to_string(&item.dependencies)?;
        let tags = serde_json::to_string(&item.tags)?;
        let criteria = serde_json::to_string(&item.acceptance_criteria)?;
        let metadata = item
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO work_items (id, item_id, item_type, title, description, status, priority,
                                    parent_id, dependencies, assignee, tags, acceptance_criteria,
                                    estimated_hours, actual_hours, progress, autonomous_executable,
                                    execution_instructions, metadata, created_at, updated_at, vector)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                    ?18, ?19, ?20, ?21)
            "#,
        )
        .bind(&item.id)
        .bind(&item.item_id)
        .bind(item.item_type.as_str())
        .bind(&item.title)
        .bind(&item.description)
        .bind(item.status.as_str())
        .bind(item.priority.as_str())
        .bind(&item.parent_id)
        .bind(&dependencies)
        .bind(&item.assignee)
        .bind(&tags)
        .bind(&criteria)
        .bind(item.estimated_hours)
        .bind(item.actual_hours)
        .bind(item.progress)
        .bind(i64::from(item.autonomous_executable))
        .bind(&item.execution_instructions)
        .bind(&metadata)
        .bind(item.created_at.timestamp_millis())
        .bind(item.updated_at.timestamp_millis())
        .bind(vector_to_blob(&item.vector))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a work item by id.
    pub async fn get_work_item(&self, id: &str) -> Result<Option<WorkItem>> {
        let query = format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = ?1");
        let row = sqlx::query_as::<_, WorkItemRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(WorkItemRow::into_work_item).transpose()
    }

    /// Replace a work item row in full.
    pub async fn update_work_item(&self, item: &WorkItem) -> Result<()> {
        with_retry!(self.try_update_work_item(item).await)
    }

    async fn try_update_work_item(&self, item: &WorkItem) -> Result<()> {
        let dependencies = serde_json::to_string(&item.dependencies)?;
        let tags = serde_json::to_string(&item.tags)?;
        let criteria = serde_json::to_string(&item.acceptance_criteria)?;
        let metadata = item
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET item_id = ?1, item_type = ?2, title = ?3, description = ?4, status = ?5,
                priority = ?6, parent_id = ?7, dependencies = ?8, assignee = ?9, tags = ?10,
                acceptance_criteria = ?11, estimated_hours = ?12, actual_hours = ?13,
                progress = ?14, autonomous_executable = ?15, execution_instructions = ?16,
                metadata = ?17, updated_at = ?18, vector = ?19
            WHERE id = ?20
            "#,
        )
        .bind(&item.item_id)
        .bind(item.item_type.as_str())
        .bind(&item.title)
        .bind(&item.description)
        .bind(item.status.as_str())
        .bind(item.priority.as_str())
        .bind(&item.parent_id)
        .bind(&dependencies)
        .bind(&item.assignee)
        .bind(&tags)
        .bind(&criteria)
        .bind(item.estimated_hours)
        .bind(item.actual_hours)
        .bind(item.progress)
        .bind(i64::from(item.autonomous_executable))
        .bind(&item.execution_instructions)
        .bind(&metadata)
        .bind(item.updated_at.timestamp_millis())
        .bind(vector_to_blob(&item.vector))
        .bind(&item.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::WorkItemNotFound(item.id.clone()));
        }
        Ok(())
    }

    /// Delete a batch of work items; returns the number of rows removed.
    pub async fn delete_work_items(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = placeholders(ids.len());
        let sql = format!("DELETE FROM work_items WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Load several work items at once. Missing ids are skipped.
    pub async fn get_work_items(&self, ids: &[String]) -> Result<Vec<WorkItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = placeholders(ids.len());
        let sql =
            format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id IN ({placeholders})");
        let mut query = sqlx::query_as::<_, WorkItemRow>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(WorkItemRow::into_work_item).collect()
    }

    /// Direct children of a work item.
    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<WorkItem>> {
        let sql = format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE parent_id = ?1 ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, WorkItemRow>(&sql)
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(WorkItemRow::into_work_item).collect()
    }

    /// Whether the item has at least one child.
    pub async fn has_children(&self, id: &str) -> Result<bool> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM work_items WHERE parent_id = ?1")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0 > 0)
    }

    /// Exact case-insensitive title matches.
    pub async fn find_by_title(&self, title: &str) -> Result<Vec<WorkItem>> {
        let sql = format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE title = ?1 COLLATE NOCASE"
        );
        let rows = sqlx::query_as::<_, WorkItemRow>(&sql)
            .bind(title)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(WorkItemRow::into_work_item).collect()
    }

    /// List work items with filters, sorting, and paging.
    pub async fn list_work_items(&self, filter: &ListFilter) -> Result<Vec<WorkItem>> {
        let (where_sql, binds) = build_where(filter);
        let sort = filter.sort_by.unwrap_or_default().column();
        let direction = if filter.descending { "DESC" } else { "ASC" };
        let mut sql = format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items{where_sql} ORDER BY {sort} {direction}"
        );
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = filter.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }

        let mut query = sqlx::query_as::<_, WorkItemRow>(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(WorkItemRow::into_work_item).collect()
    }

    /// Count work items matching a filter.
    pub async fn count_work_items(&self, filter: &ListFilter) -> Result<i64> {
        let (where_sql, binds) = build_where(filter);
        let sql = format!("SELECT COUNT(*) FROM work_items{where_sql}");
        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let count = query.fetch_one(&self.pool).await?;
        Ok(count.0)
    }

    /// Total number of work items.
    pub async fn row_count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM work_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    /// All (id, vector) pairs, for index builds.
    pub async fn all_vectors(&self) -> Result<Vec<(String, Vec<f32>)>> {
        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT id, vector FROM work_items")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, blob)| (id, blob_to_vector(&blob)))
            .collect())
    }

    // --- Execution records ---

    /// Insert a new execution record.
    pub async fn insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        with_retry!(self.try_insert_execution(record).await)
    }

    async fn try_insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let plan = serde_json::to_string(&record.plan)?;
        let agent_context = record
            .agent_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let artifacts = serde_json::to_string(&record.artifacts)?;
        let validation = serde_json::to_string(&record.validation_results)?;

        sqlx::query(
            r#"
            INSERT INTO execution_records (execution_id, work_item_id, mode, status, plan,
                                           agent_context, started_at, finished_at, cancel_reason,
                                           rollback_requested, artifacts, validation_results)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&record.execution_id)
        .bind(&record.work_item_id)
        .bind(record.mode.as_str())
        .bind(record.status.as_str())
        .bind(&plan)
        .bind(&agent_context)
        .bind(record.started_at.timestamp_millis())
        .bind(record.finished_at.map(|t| t.timestamp_millis()))
        .bind(&record.cancel_reason)
        .bind(i64::from(record.rollback_requested))
        .bind(&artifacts)
        .bind(&validation)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get an execution record by id.
    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM execution_records WHERE execution_id = ?1"
        );
        let row = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ExecutionRow::into_record).transpose()
    }

    /// Replace mutable fields of an execution record.
    pub async fn update_execution(&self, record: &ExecutionRecord) -> Result<()> {
        with_retry!(self.try_update_execution(record).await)
    }

    async fn try_update_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let plan = serde_json::to_string(&record.plan)?;
        let artifacts = serde_json::to_string(&record.artifacts)?;
        let validation = serde_json::to_string(&record.validation_results)?;

        let result = sqlx::query(
            r#"
            UPDATE execution_records
            SET status = ?1, plan = ?2, finished_at = ?3, cancel_reason = ?4,
                rollback_requested = ?5, artifacts = ?6, validation_results = ?7
            WHERE execution_id = ?8
            "#,
        )
        .bind(record.status.as_str())
        .bind(&plan)
        .bind(record.finished_at.map(|t| t.timestamp_millis()))
        .bind(&record.cancel_reason)
        .bind(i64::from(record.rollback_requested))
        .bind(&artifacts)
        .bind(&validation)
        .bind(&record.execution_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ExecutionNotFound(record.execution_id.clone()));
        }
        Ok(())
    }

    /// Append a line to an execution's log stream.
    pub async fn append_execution_log(
        &self,
        execution_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO execution_logs (execution_id, ts, level, message) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(execution_id)
        .bind(Utc::now().timestamp_millis())
        .bind(level.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All log lines for an execution, oldest first.
    pub async fn list_execution_logs(&self, execution_id: &str) -> Result<Vec<ExecutionLogEntry>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT ts, level, message FROM execution_logs WHERE execution_id = ?1 ORDER BY ts, id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(ts, level, message)| {
                Ok(ExecutionLogEntry {
                    timestamp: millis_to_datetime(ts, execution_id)?,
                    level: LogLevel::parse(&level).ok_or_else(|| StorageError::CorruptRow {
                        id: execution_id.to_string(),
                        detail: format!("unknown log level: {level}"),
                    })?,
                    message,
                })
            })
            .collect()
    }

    // --- Sync state ---

    /// Insert or replace a sync-state entry.
    pub async fn upsert_sync_state(&self, state: &SyncState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (file_path, work_item_id, content_checksum, last_sync_at, direction)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (file_path, work_item_id)
            DO UPDATE SET content_checksum = excluded.content_checksum,
                          last_sync_at = excluded.last_sync_at,
                          direction = excluded.direction
            "#,
        )
        .bind(&state.file_path)
        .bind(&state.work_item_id)
        .bind(&state.content_checksum)
        .bind(state.last_sync_at.timestamp_millis())
        .bind(state.direction.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get the sync state for an exact pair.
    pub async fn get_sync_state(
        &self,
        file_path: &str,
        work_item_id: &str,
    ) -> Result<Option<SyncState>> {
        let row = sqlx::query_as::<_, SyncStateRow>(
            "SELECT file_path, work_item_id, content_checksum, last_sync_at, direction \
             FROM sync_state WHERE file_path = ?1 AND work_item_id = ?2",
        )
        .bind(file_path)
        .bind(work_item_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SyncStateRow::into_state).transpose()
    }

    /// All sync states referencing a work item.
    pub async fn sync_states_for_item(&self, work_item_id: &str) -> Result<Vec<SyncState>> {
        let rows = sqlx::query_as::<_, SyncStateRow>(
            "SELECT file_path, work_item_id, content_checksum, last_sync_at, direction \
             FROM sync_state WHERE work_item_id = ?1",
        )
        .bind(work_item_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncStateRow::into_state).collect()
    }

    /// All sync states referencing a file path.
    pub async fn sync_states_for_path(&self, file_path: &str) -> Result<Vec<SyncState>> {
        let rows = sqlx::query_as::<_, SyncStateRow>(
            "SELECT file_path, work_item_id, content_checksum, last_sync_at, direction \
             FROM sync_state WHERE file_path = ?1",
        )
        .bind(file_path)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncStateRow::into_state).collect()
    }

    /// Remove sync states for deleted work items.
    pub async fn delete_sync_states_for_items(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = placeholders(ids.len());
        let sql = format!("DELETE FROM sync_state WHERE work_item_id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

fn placeholders(n: usize) -> String {
    let mut out = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}

fn build_where(filter: &ListFilter) -> (String, Vec<String>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();

    if let Some(types) = &filter.item_type {
        if !types.is_empty() {
            clauses.push(format!("item_type IN ({})", placeholders(types.len())));
            binds.extend(types.iter().map(|t| t.as_str().to_string()));
        }
    }
    if let Some(statuses) = &filter.status {
        if !statuses.is_empty() {
            clauses.push(format!("status IN ({})", placeholders(statuses.len())));
            binds.extend(statuses.iter().map(|s| s.as_str().to_string()));
        }
    }
    if let Some(priorities) = &filter.priority {
        if !priorities.is_empty() {
            clauses.push(format!("priority IN ({})", placeholders(priorities.len())));
            binds.extend(priorities.iter().map(|p| p.as_str().to_string()));
        }
    }
    if let Some(parent_id) = &filter.parent_id {
        clauses.push("parent_id = ?".to_string());
        binds.push(parent_id.clone());
    }
    if let Some(assignee) = &filter.assignee {
        clauses.push("assignee = ?".to_string());
        binds.push(assignee.clone());
    }
    if let Some(tag) = &filter.tag {
        // Tags are a JSON array of strings; match the quoted element.
        clauses.push("tags LIKE ?".to_string());
        binds.push(format!("%\"{}\"%", tag.replace('"', "")));
    }

    if clauses.is_empty() {
        (String::new(), binds)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), binds)
    }
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn millis_to_datetime(millis: i64, id: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StorageError::CorruptRow {
        id: id.to_string(),
        detail: format!("timestamp out of range: {millis}"),
    })
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: String,
    item_id: Option<String>,
    item_type: String,
    title: String,
    description: String,
    status: String,
    priority: String,
    parent_id: Option<String>,
    dependencies: String,
    assignee: Option<String>,
    tags: String,
    acceptance_criteria: String,
    estimated_hours: Option<f64>,
    actual_hours: Option<f64>,
    progress: f64,
    autonomous_executable: i64,
    execution_instructions: Option<String>,
    metadata: Option<String>,
    created_at: i64,
    updated_at: i64,
    vector: Vec<u8>,
}

impl WorkItemRow {
    fn into_work_item(self) -> Result<WorkItem> {
        let corrupt = |detail: String| StorageError::CorruptRow {
            id: self.id.clone(),
            detail,
        };

        let item_type = ItemType::parse(&self.item_type)
            .ok_or_else(|| corrupt(format!("unknown item_type: {}", self.item_type)))?;
        // Legacy status strings go through the explicit migration table;
        // anything unrecognised is corruption, not something to coerce.
        let status = Status::from_stored(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status: {}", self.status)))?;
        let priority = Priority::parse(&self.priority)
            .ok_or_else(|| corrupt(format!("unknown priority: {}", self.priority)))?;

        let dependencies: Vec<String> = serde_json::from_str(&self.dependencies)?;
        let tags: Vec<String> = serde_json::from_str(&self.tags)?;
        let acceptance_criteria: Vec<String> = serde_json::from_str(&self.acceptance_criteria)?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(WorkItem {
            created_at: millis_to_datetime(self.created_at, &self.id)?,
            updated_at: millis_to_datetime(self.updated_at, &self.id)?,
            id: self.id,
            item_id: self.item_id,
            item_type,
            title: self.title,
            description: self.description,
            status,
            priority,
            parent_id: self.parent_id,
            dependencies,
            assignee: self.assignee,
            tags,
            acceptance_criteria,
            estimated_hours: self.estimated_hours,
            actual_hours: self.actual_hours,
            progress: self.progress,
            autonomous_executable: self.autonomous_executable != 0,
            execution_instructions: self.execution_instructions,
            metadata,
            vector: blob_to_vector(&self.vector),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    execution_id: String,
    work_item_id: String,
    mode: String,
    status: String,
    plan: String,
    agent_context: Option<String>,
    started_at: i64,
    finished_at: Option<i64>,
    cancel_reason: Option<String>,
    rollback_requested: i64,
    artifacts: String,
    validation_results: String,
}

impl ExecutionRow {
    fn into_record(self) -> Result<ExecutionRecord> {
        let corrupt = |detail: String| StorageError::CorruptRow {
            id: self.execution_id.clone(),
            detail,
        };

        let mode = ExecutionMode::parse(&self.mode)
            .ok_or_else(|| corrupt(format!("unknown mode: {}", self.mode)))?;
        let status = ExecutionStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status: {}", self.status)))?;

        let plan: Vec<String> = serde_json::from_str(&self.plan)?;
        let agent_context = self
            .agent_context
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let artifacts = serde_json::from_str(&self.artifacts)?;
        let validation_results: Vec<ValidationCheck> =
            serde_json::from_str(&self.validation_results)?;

        Ok(ExecutionRecord {
            started_at: millis_to_datetime(self.started_at, &self.execution_id)?,
            finished_at: self
                .finished_at
                .map(|t| millis_to_datetime(t, &self.execution_id))
                .transpose()?,
            execution_id: self.execution_id,
            work_item_id: self.work_item_id,
            mode,
            status,
            plan,
            agent_context,
            cancel_reason: self.cancel_reason,
            rollback_requested: self.rollback_requested != 0,
            artifacts,
            validation_results,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SyncStateRow {
    file_path: String,
    work_item_id: String,
    content_checksum: String,
    last_sync_at: i64,
    direction: String,
}

impl SyncStateRow {
    fn into_state(self) -> Result<SyncState> {
        let direction =
            SyncDirection::parse(&self.direction).ok_or_else(|| StorageError::CorruptRow {
                id: self.work_item_id.clone(),
                detail: format!("unknown sync direction: {}", self.direction),
            })?;
        Ok(SyncState {
            last_sync_at: millis_to_datetime(self.last_sync_at, &self.work_item_id)?,
            file_path: self.file_path,
            work_item_id: self.work_item_id,
            content_checksum: self.content_checksum,
            direction,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::tests_support::{create_test_storage, sample_item};
    use super::*;
    use jive_core::new_id;

    #[tokio::test]
    async fn insert_and_get_work_item() {
        let ts = create_test_storage().await;
        let item = sample_item("Implement login");

        ts.storage.insert_work_item(&item).await.unwrap();
        let loaded = ts.storage.get_work_item(&item.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, item.id);
        assert_eq!(loaded.title, "Implement login");
        assert_eq!(loaded.status, Status::Backlog);
        assert_eq!(loaded.vector, item.vector);
        // Array columns come back as materialised vectors, never raw JSON.
        assert!(loaded.dependencies.is_empty());
        assert!(loaded.tags.is_empty());
    }

    #[tokio::test]
    async fn get_missing_work_item_returns_none() {
        let ts = create_test_storage().await;
        assert!(ts.storage.get_work_item(&new_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_missing_work_item_errors() {
        let ts = create_test_storage().await;
        let item = sample_item("ghost");
        let result = ts.storage.update_work_item(&item).await;
        assert!(matches!(result, Err(StorageError::WorkItemNotFound(_))));
    }

    #[tokio::test]
    async fn update_replaces_fields() {
        let ts = create_test_storage().await;
        let mut item = sample_item("before");
        ts.storage.insert_work_item(&item).await.unwrap();

        item.title = "after".to_string();
        item.status = Status::InProgress;
        item.tags = vec!["auth".to_string()];
        item.metadata = Some(serde_json::json!({"sprint": 2}));
        item.updated_at = Utc::now();
        ts.storage.update_work_item(&item).await.unwrap();

        let loaded = ts.storage.get_work_item(&item.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "after");
        assert_eq!(loaded.status, Status::InProgress);
        assert_eq!(loaded.tags, vec!["auth"]);
        assert_eq!(loaded.metadata, Some(serde_json::json!({"sprint": 2})));
    }

    #[tokio::test]
    async fn legacy_status_strings_map_on_read() {
        let ts = create_test_storage().await;
        let item = sample_item("legacy");
        ts.storage.insert_work_item(&item).await.unwrap();

        sqlx::query("UPDATE work_items SET status = 'not_started' WHERE id = ?1")
            .bind(&item.id)
            .execute(ts.storage.pool())
            .await
            .unwrap();

        let loaded = ts.storage.get_work_item(&item.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, Status::Backlog);
    }

    #[tokio::test]
    async fn unknown_status_string_is_corrupt_not_coerced() {
        let ts = create_test_storage().await;
        let item = sample_item("corrupt");
        ts.storage.insert_work_item(&item).await.unwrap();

        sqlx::query("UPDATE work_items SET status = 'wip' WHERE id = ?1")
            .bind(&item.id)
            .execute(ts.storage.pool())
            .await
            .unwrap();

        let result = ts.storage.get_work_item(&item.id).await;
        assert!(matches!(result, Err(StorageError::CorruptRow { .. })));
    }

    #[tokio::test]
    async fn delete_removes_batch_and_counts() {
        let ts = create_test_storage().await;
        let a = sample_item("a");
        let b = sample_item("b");
        ts.storage.insert_work_item(&a).await.unwrap();
        ts.storage.insert_work_item(&b).await.unwrap();

        let deleted = ts
            .storage
            .delete_work_items(&[a.id.clone(), b.id.clone(), new_id()])
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(ts.storage.get_work_item(&a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_status_and_type() {
        let ts = create_test_storage().await;
        let mut story = sample_item("story");
        story.item_type = ItemType::Story;
        story.status = Status::InProgress;
        let task = sample_item("task");
        ts.storage.insert_work_item(&story).await.unwrap();
        ts.storage.insert_work_item(&task).await.unwrap();

        let filter = ListFilter {
            status: Some(vec![Status::InProgress]),
            ..Default::default()
        };
        let items = ts.storage.list_work_items(&filter).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, story.id);

        let filter = ListFilter {
            item_type: Some(vec![ItemType::Task]),
            ..Default::default()
        };
        assert_eq!(ts.storage.count_work_items(&filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_filters_by_tag() {
        let ts = create_test_storage().await;
        let mut tagged = sample_item("tagged");
        tagged.tags = vec!["auth".to_string(), "backend".to_string()];
        let untagged = sample_item("untagged");
        ts.storage.insert_work_item(&tagged).await.unwrap();
        ts.storage.insert_work_item(&untagged).await.unwrap();

        let filter = ListFilter {
            tag: Some("auth".to_string()),
            ..Default::default()
        };
        let items = ts.storage.list_work_items(&filter).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, tagged.id);
    }

    #[tokio::test]
    async fn list_respects_limit_and_offset() {
        let ts = create_test_storage().await;
        for i in 0..5 {
            let mut item = sample_item(&format!("item-{i}"));
            item.created_at = DateTime::from_timestamp(1_700_000_000 + i, 0).unwrap();
            item.updated_at = item.created_at;
            ts.storage.insert_work_item(&item).await.unwrap();
        }

        let filter = ListFilter {
            limit: Some(2),
            offset: Some(1),
            ..Default::default()
        };
        let items = ts.storage.list_work_items(&filter).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "item-1");
        assert_eq!(items[1].title, "item-2");
    }

    #[tokio::test]
    async fn children_and_has_children() {
        let ts = create_test_storage().await;
        let mut parent = sample_item("parent");
        parent.item_type = ItemType::Story;
        let mut child = sample_item("child");
        child.parent_id = Some(parent.id.clone());
        ts.storage.insert_work_item(&parent).await.unwrap();
        ts.storage.insert_work_item(&child).await.unwrap();

        assert!(ts.storage.has_children(&parent.id).await.unwrap());
        assert!(!ts.storage.has_children(&child.id).await.unwrap());

        let children = ts.storage.list_children(&parent.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);
    }

    #[tokio::test]
    async fn find_by_title_is_case_insensitive() {
        let ts = create_test_storage().await;
        let item = sample_item("Implement Login");
        ts.storage.insert_work_item(&item).await.unwrap();

        let hits = ts.storage.find_by_title("implement login").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, item.id);
    }

    #[tokio::test]
    async fn execution_record_round_trip() {
        let ts = create_test_storage().await;
        let record = ExecutionRecord {
            execution_id: new_id(),
            work_item_id: new_id(),
            mode: ExecutionMode::DependencyBased,
            status: ExecutionStatus::Queued,
            plan: vec![new_id(), new_id()],
            agent_context: Some(serde_json::json!({"branch": "main"})),
            started_at: Utc::now(),
            finished_at: None,
            cancel_reason: None,
            rollback_requested: false,
            artifacts: Vec::new(),
            validation_results: Vec::new(),
        };

        ts.storage.insert_execution(&record).await.unwrap();
        let loaded = ts
            .storage
            .get_execution(&record.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.plan, record.plan);
        assert_eq!(loaded.status, ExecutionStatus::Queued);
        assert_eq!(loaded.agent_context, record.agent_context);

        let mut updated = loaded;
        updated.status = ExecutionStatus::Completed;
        updated.finished_at = Some(Utc::now());
        ts.storage.update_execution(&updated).await.unwrap();

        let loaded = ts
            .storage
            .get_execution(&record.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn execution_logs_preserve_order() {
        let ts = create_test_storage().await;
        let execution_id = new_id();
        ts.storage
            .append_execution_log(&execution_id, LogLevel::Info, "started")
            .await
            .unwrap();
        ts.storage
            .append_execution_log(&execution_id, LogLevel::Error, "boom")
            .await
            .unwrap();

        let logs = ts.storage.list_execution_logs(&execution_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "started");
        assert_eq!(logs[1].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn sync_state_upsert_and_lookup() {
        let ts = create_test_storage().await;
        let state = SyncState {
            file_path: ".jivedev/tasks/auth-1-login.md".to_string(),
            work_item_id: new_id(),
            content_checksum: "abc123".to_string(),
            last_sync_at: Utc::now(),
            direction: SyncDirection::Bidirectional,
        };

        ts.storage.upsert_sync_state(&state).await.unwrap();
        let loaded = ts
            .storage
            .get_sync_state(&state.file_path, &state.work_item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.content_checksum, "abc123");

        let mut replaced = state.clone();
        replaced.content_checksum = "def456".to_string();
        ts.storage.upsert_sync_state(&replaced).await.unwrap();

        let loaded = ts
            .storage
            .get_sync_state(&state.file_path, &state.work_item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.content_checksum, "def456");

        let by_item = ts
            .storage
            .sync_states_for_item(&state.work_item_id)
            .await
            .unwrap();
        assert_eq!(by_item.len(), 1);
    }

    #[tokio::test]
    async fn vector_blob_round_trip() {
        let vector = vec![0.5_f32, -1.25, 3.0];
        assert_eq!(blob_to_vector(&vector_to_blob(&vector)), vector);
        assert!(blob_to_vector(&[]).is_empty());
    }

    #[tokio::test]
    async fn item_write_guard_serialises_same_id() {
        let ts = create_test_storage().await;
        let guard = ts.storage.item_write_guard("item-1").await;
        // A second lock on the same id must wait until the first drops.
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            ts.storage.item_write_guard("item-1"),
        )
        .await;
        assert!(second.is_err());
        drop(guard);
        let second = ts.storage.item_write_guard("item-1").await;
        drop(second);

        // Different ids are independent.
        let _a = ts.storage.item_write_guard("item-a").await;
        let _b = ts.storage.item_write_guard("item-b").await;
    }
}
