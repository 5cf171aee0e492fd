//! Bidirectional file <-> DB sync engine.
//!
//! Reconciles the on-disk task files under `.jivedev/tasks/` with the
//! store, using SHA-256 checksums for change detection and pluggable
//! conflict resolution. Each direction touches only its target store;
//! SyncState is written last and only on success, mirrored to a state
//! file under `.jivedev/sync/`.

use crate::storage::{Storage, StorageError};
use crate::store::{StoreError, WorkItemStore};
use chrono::{DateTime, Utc};
use jive_core::{
    checksum, parse_work_item, render_work_item, sync_state_file_name, task_file_name,
    ConflictStrategy, ErrorCode, FileFormat, FormatError, SyncDirection, SyncState, WorkItem,
};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Fields compared for conflict detection; everything an author can edit.
const DIFF_FIELDS: &[&str] = &[
    "item_id",
    "title",
    "description",
    "status",
    "priority",
    "parent_id",
    "dependencies",
    "assignee",
    "tags",
    "acceptance_criteria",
    "estimated_hours",
    "actual_hours",
    "progress",
    "autonomous_executable",
    "execution_instructions",
    "metadata",
];

/// One diverging field, with both sides' values.
#[derive(Debug, Clone, Serialize)]
pub struct FieldDiff {
    pub field: String,
    pub file: Value,
    pub db: Value,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("parse error: {0}")]
    Parse(#[from] FormatError),
    #[error("manual resolution required; {} fields differ", .fields.len())]
    Conflict { fields: Vec<FieldDiff> },
    #[error("work item not found: {0}")]
    NotFound(String),
    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(_) => ErrorCode::InvalidArgument,
            Self::Conflict { .. } => ErrorCode::Conflict,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Io { .. } => ErrorCode::Internal,
            Self::Store(e) => e.code(),
            Self::Storage(_) => ErrorCode::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// What a sync call did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SyncOutcome {
    /// The target store now holds the winning representation.
    Applied { work_item_id: String },
    /// Nothing had changed since the last reconciliation.
    NoOp { work_item_id: String },
    /// The resolution kept the target store as it was.
    Kept { work_item_id: String },
}

impl SyncOutcome {
    pub fn work_item_id(&self) -> &str {
        match self {
            Self::Applied { work_item_id }
            | Self::NoOp { work_item_id }
            | Self::Kept { work_item_id } => work_item_id,
        }
    }
}

/// Per-pair status for `sync_status`.
#[derive(Debug, Clone, Serialize)]
pub struct PairStatus {
    pub file_path: String,
    pub file_exists: bool,
    pub file_changed: bool,
    pub db_changed: bool,
    pub in_sync: bool,
    pub last_sync_at: DateTime<Utc>,
    pub direction: SyncDirection,
}

/// Summary of a directory-wide reconciliation sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub synced: usize,
    pub unchanged: usize,
    pub kept: usize,
    pub conflicts: Vec<String>,
    pub errors: Vec<ReconcileError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileError {
    pub file_path: String,
    pub error: String,
}

pub struct SyncEngine {
    store: Arc<WorkItemStore>,
    storage: Arc<Storage>,
    tasks_dir: PathBuf,
    sync_state_dir: PathBuf,
}

impl SyncEngine {
    pub fn new(
        store: Arc<WorkItemStore>,
        storage: Arc<Storage>,
        tasks_dir: PathBuf,
        sync_state_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            storage,
            tasks_dir,
            sync_state_dir,
        }
    }

    /// Sync file content into the DB. The file is never modified.
    pub async fn sync_file_to_db(
        &self,
        path: &Path,
        content: &str,
        resolution: ConflictStrategy,
    ) -> Result<SyncOutcome> {
        let format = FileFormat::from_path(path)?;
        let file_item = parse_work_item(content, format)?;
        let path_str = path.to_string_lossy().to_string();
        let file_checksum = checksum(content.as_bytes());

        let _guard = self
            .storage
            .sync_write_guard(&path_str, &file_item.id)
            .await;

        let state = self.storage.get_sync_state(&path_str, &file_item.id).await?;
        let db_item = self.storage.get_work_item(&file_item.id).await?;

        // Unchanged on both sides since the last reconciliation: no-op.
        if let (Some(state), Some(db_item)) = (&state, &db_item) {
            if state.content_checksum == file_checksum
                && db_item.updated_at == state.last_sync_at
            {
                return Ok(SyncOutcome::NoOp {
                    work_item_id: file_item.id,
                });
            }
        }

        let winner = match &db_item {
            None => Some(file_item.clone()),
            Some(db_item) => {
                let diffs = diff_items(&file_item, db_item)?;
                if diffs.is_empty() {
                    // Same content, possibly reformatted; refresh tracking.
                    self.write_state(&path_str, db_item.id.clone(), &file_checksum, db_item.updated_at)
                        .await?;
                    return Ok(SyncOutcome::NoOp {
                        work_item_id: file_item.id,
                    });
                }
                match resolution {
                    ConflictStrategy::FileWins => Some(file_item.clone()),
                    ConflictStrategy::DbWins => None,
                    ConflictStrategy::NewestWins => {
                        // Ties go to the DB.
                        if file_item.updated_at > db_item.updated_at {
                            Some(file_item.clone())
                        } else {
                            None
                        }
                    }
                    ConflictStrategy::AutoMerge => {
                        Some(merge_items(&file_item, db_item))
                    }
                    ConflictStrategy::Manual => {
                        return Err(SyncError::Conflict { fields: diffs });
                    }
                }
            }
        };

        match winner {
            Some(item) => {
                let applied = self.store.apply_synced(item).await?;
                // Timestamps in SyncState come from the stored row so the
                // no-op sentinel compares within one clock domain.
                let stored = self
                    .storage
                    .get_work_item(&applied.id)
                    .await?
                    .ok_or_else(|| SyncError::NotFound(applied.id.clone()))?;
                self.write_state(&path_str, stored.id.clone(), &file_checksum, stored.updated_at)
                    .await?;
                Ok(SyncOutcome::Applied {
                    work_item_id: stored.id,
                })
            }
            None => {
                // DB kept; the pair is still divergent, so tracking state
                // is left alone for a later db_to_file pass.
                Ok(SyncOutcome::Kept {
                    work_item_id: file_item.id,
                })
            }
        }
    }

    /// Render a DB record to its task file. The DB is never modified.
    /// Returns the file path alongside the outcome.
    pub async fn sync_db_to_file(
        &self,
        work_item_id: &str,
        format: FileFormat,
        resolution: ConflictStrategy,
    ) -> Result<(PathBuf, SyncOutcome)> {
        let db_item = self
            .storage
            .get_work_item(work_item_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(work_item_id.to_string()))?;

        // Prefer the already-tracked path for this item.
        let tracked = self.storage.sync_states_for_item(&db_item.id).await?;
        let path = tracked
            .first()
            .map(|s| PathBuf::from(&s.file_path))
            .unwrap_or_else(|| self.tasks_dir.join(task_file_name(&db_item, format)));
        let path_str = path.to_string_lossy().to_string();

        let _guard = self.storage.sync_write_guard(&path_str, &db_item.id).await;
        let state = self.storage.get_sync_state(&path_str, &db_item.id).await?;

        let existing = match std::fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(SyncError::Io { path, source }),
        };

        if let (Some(state), Some(content)) = (&state, &existing) {
            if state.content_checksum == checksum(content.as_bytes())
                && db_item.updated_at == state.last_sync_at
            {
                return Ok((
                    path,
                    SyncOutcome::NoOp {
                        work_item_id: db_item.id,
                    },
                ));
            }
        }

        let winner = match &existing {
            None => Some(db_item.clone()),
            Some(content) => {
                let file_format = FileFormat::from_path(&path)?;
                let file_item = parse_work_item(content, file_format)?;
                let diffs = diff_items(&file_item, &db_item)?;
                if diffs.is_empty() {
                    Some(db_item.clone())
                } else {
                    match resolution {
                        ConflictStrategy::DbWins => Some(db_item.clone()),
                        ConflictStrategy::FileWins => None,
                        ConflictStrategy::NewestWins => {
                            if file_item.updated_at > db_item.updated_at {
                                None
                            } else {
                                Some(db_item.clone())
                            }
                        }
                        ConflictStrategy::AutoMerge => {
                            Some(merge_items(&file_item, &db_item))
                        }
                        ConflictStrategy::Manual => {
                            return Err(SyncError::Conflict { fields: diffs });
                        }
                    }
                }
            }
        };

        match winner {
            Some(item) => {
                let file_format = FileFormat::from_path(&path)?;
                let rendered = render_work_item(&item, file_format)?;
                write_atomic(&path, rendered.as_bytes())?;
                self.write_state(
                    &path_str,
                    db_item.id.clone(),
                    &checksum(rendered.as_bytes()),
                    db_item.updated_at,
                )
                .await?;
                Ok((
                    path,
                    SyncOutcome::Applied {
                        work_item_id: db_item.id,
                    },
                ))
            }
            None => Ok((
                path,
                SyncOutcome::Kept {
                    work_item_id: db_item.id,
                },
            )),
        }
    }

    /// Sync status for a work item across its tracked files.
    pub async fn sync_status(&self, work_item_id: &str) -> Result<Vec<PairStatus>> {
        let db_item = self.storage.get_work_item(work_item_id).await?;
        let states = self.storage.sync_states_for_item(work_item_id).await?;

        let mut out = Vec::with_capacity(states.len());
        for state in states {
            let path = PathBuf::from(&state.file_path);
            let (file_exists, file_changed) = match std::fs::read(&path) {
                Ok(bytes) => (true, checksum(&bytes) != state.content_checksum),
                Err(_) => (false, true),
            };
            let db_changed = db_item
                .as_ref()
                .map(|item| item.updated_at != state.last_sync_at)
                .unwrap_or(true);
            out.push(PairStatus {
                file_path: state.file_path,
                file_exists,
                file_changed,
                db_changed,
                in_sync: file_exists && !file_changed && !db_changed,
                last_sync_at: state.last_sync_at,
                direction: state.direction,
            });
        }
        Ok(out)
    }

    /// Reconcile every task file under the given root (or the configured
    /// tasks directory) into the DB. Unparseable files are reported and
    /// skipped, never fatal.
    pub async fn reconcile_all(
        &self,
        root_dir: Option<&Path>,
        resolution: ConflictStrategy,
    ) -> Result<ReconcileSummary> {
        let root = root_dir.unwrap_or(&self.tasks_dir);
        let mut summary = ReconcileSummary::default();

        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(summary),
            Err(source) => {
                return Err(SyncError::Io {
                    path: root.to_path_buf(),
                    source,
                })
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let path = entry.path();
            if !path.is_file() || FileFormat::from_path(&path).is_err() {
                continue;
            }
            let display = path.to_string_lossy().to_string();

            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    summary.errors.push(ReconcileError {
                        file_path: display,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            match self.sync_file_to_db(&path, &content, resolution).await {
                Ok(SyncOutcome::Applied { .. }) => summary.synced += 1,
                Ok(SyncOutcome::NoOp { .. }) => summary.unchanged += 1,
                Ok(SyncOutcome::Kept { .. }) => summary.kept += 1,
                Err(SyncError::Conflict { .. }) => summary.conflicts.push(display),
                Err(e) => summary.errors.push(ReconcileError {
                    file_path: display,
                    error: e.to_string(),
                }),
            }
        }

        tracing::info!(
            synced = summary.synced,
            unchanged = summary.unchanged,
            kept = summary.kept,
            conflicts = summary.conflicts.len(),
            errors = summary.errors.len(),
            "reconcile sweep finished"
        );
        Ok(summary)
    }

    /// Persist SyncState: DB row first, then the mirror state file.
    async fn write_state(
        &self,
        file_path: &str,
        work_item_id: String,
        content_checksum: &str,
        last_sync_at: DateTime<Utc>,
    ) -> Result<()> {
        let state = SyncState {
            file_path: file_path.to_string(),
            work_item_id,
            content_checksum: content_checksum.to_string(),
            last_sync_at,
            direction: SyncDirection::Bidirectional,
        };
        self.storage.upsert_sync_state(&state).await?;

        let mirror = self
            .sync_state_dir
            .join(sync_state_file_name(&state.work_item_id));
        let body = serde_json::to_string_pretty(&state)
            .map_err(|e| StorageError::Serialization(e))?;
        write_atomic(&mirror, body.as_bytes())?;
        Ok(())
    }
}

/// Compare the authored fields of both representations.
fn diff_items(file_item: &WorkItem, db_item: &WorkItem) -> Result<Vec<FieldDiff>> {
    let file_value =
        serde_json::to_value(file_item).map_err(|e| StorageError::Serialization(e))?;
    let db_value = serde_json::to_value(db_item).map_err(|e| StorageError::Serialization(e))?;

    let mut diffs = Vec::new();
    for field in DIFF_FIELDS {
        let a = file_value.get(field).cloned().unwrap_or(Value::Null);
        let b = db_value.get(field).cloned().unwrap_or(Value::Null);
        if a != b {
            diffs.push(FieldDiff {
                field: (*field).to_string(),
                file: a,
                db: b,
            });
        }
    }
    Ok(diffs)
}

/// Merge strategy: start from the newer record, union the set-valued
/// fields with the older one, stamp a fresh `updated_at`.
fn merge_items(file_item: &WorkItem, db_item: &WorkItem) -> WorkItem {
    let (newer, older) = if file_item.updated_at > db_item.updated_at {
        (file_item, db_item)
    } else {
        (db_item, file_item)
    };

    let mut merged = newer.clone();
    merged.tags = union_preserving_order(&newer.tags, &older.tags);
    merged.dependencies = union_preserving_order(&newer.dependencies, &older.dependencies);
    merged.acceptance_criteria =
        union_preserving_order(&newer.acceptance_criteria, &older.acceptance_criteria);
    merged.updated_at = Utc::now();
    merged
}

fn union_preserving_order(first: &[String], second: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    first
        .iter()
        .chain(second.iter())
        .filter(|v| seen.insert((*v).clone()))
        .cloned()
        .collect()
}

/// Write a file atomically: temp file in the same directory, then rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let io_err = |source: std::io::Error| SyncError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests_support::{create_test_store, draft, TestStore};
    use jive_core::{ItemType, Status, WorkItemPatch};

    struct TestSync {
        engine: SyncEngine,
        ts: TestStore,
        tasks_dir: PathBuf,
    }

    async fn create_test_sync() -> TestSync {
        let ts = create_test_store().await;
        let tasks_dir = ts._dir.path().join("tasks");
        let sync_dir = ts._dir.path().join("sync");
        let engine = SyncEngine::new(
            Arc::clone(&ts.store),
            Arc::clone(&ts.storage),
            tasks_dir.clone(),
            sync_dir,
        );
        TestSync {
            engine,
            ts,
            tasks_dir,
        }
    }

    async fn seeded_item(tsync: &TestSync, title: &str) -> WorkItem {
        tsync
            .ts
            .store
            .create_work_item(draft(ItemType::Task, title))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn db_to_file_then_file_to_db_round_trips() {
        let tsync = create_test_sync().await;
        let item = seeded_item(&tsync, "Round trip").await;

        let (path, outcome) = tsync
            .engine
            .sync_db_to_file(&item.id, FileFormat::Markdown, ConflictStrategy::NewestWins)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Applied { .. }));
        assert!(path.exists());

        // Re-running either direction with nothing changed is a no-op.
        let (_, outcome) = tsync
            .engine
            .sync_db_to_file(&item.id, FileFormat::Markdown, ConflictStrategy::NewestWins)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::NoOp { .. }));

        let content = std::fs::read_to_string(&path).unwrap();
        let outcome = tsync
            .engine
            .sync_file_to_db(&path, &content, ConflictStrategy::NewestWins)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::NoOp { .. }));
    }

    #[tokio::test]
    async fn newest_file_wins_and_repeat_is_noop() {
        let tsync = create_test_sync().await;
        let item = seeded_item(&tsync, "Old").await;

        let (path, _) = tsync
            .engine
            .sync_db_to_file(&item.id, FileFormat::Markdown, ConflictStrategy::DbWins)
            .await
            .unwrap();

        // Edit the file with a newer timestamp.
        let mut file_item = tsync.ts.store.get_work_item(&item.id).await.unwrap().unwrap();
        file_item.title = "New".to_string();
        file_item.updated_at = Utc::now() + chrono::Duration::seconds(5);
        let content = render_work_item(&file_item, FileFormat::Markdown).unwrap();
        std::fs::write(&path, &content).unwrap();

        let outcome = tsync
            .engine
            .sync_file_to_db(&path, &content, ConflictStrategy::NewestWins)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Applied { .. }));

        let db_item = tsync.ts.store.get_work_item(&item.id).await.unwrap().unwrap();
        assert_eq!(db_item.title, "New");

        // Checksum and sentinel now match: the repeat is a no-op.
        let outcome = tsync
            .engine
            .sync_file_to_db(&path, &content, ConflictStrategy::NewestWins)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::NoOp { .. }));
    }

    #[tokio::test]
    async fn newest_wins_keeps_db_when_db_is_newer() {
        let tsync = create_test_sync().await;
        let item = seeded_item(&tsync, "Original").await;

        let (path, _) = tsync
            .engine
            .sync_db_to_file(&item.id, FileFormat::Json, ConflictStrategy::DbWins)
            .await
            .unwrap();

        // Stale file edit, then a newer DB edit.
        let mut file_item = tsync.ts.store.get_work_item(&item.id).await.unwrap().unwrap();
        file_item.title = "Stale file edit".to_string();
        file_item.updated_at = file_item.updated_at - chrono::Duration::seconds(60);
        let content = render_work_item(&file_item, FileFormat::Json).unwrap();
        std::fs::write(&path, &content).unwrap();

        let patch = WorkItemPatch {
            title: Some("Fresh db edit".to_string()),
            ..Default::default()
        };
        tsync.ts.store.update_work_item(&item.id, patch).await.unwrap();

        let outcome = tsync
            .engine
            .sync_file_to_db(&path, &content, ConflictStrategy::NewestWins)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Kept { .. }));

        let db_item = tsync.ts.store.get_work_item(&item.id).await.unwrap().unwrap();
        assert_eq!(db_item.title, "Fresh db edit");
    }

    #[tokio::test]
    async fn manual_resolution_surfaces_conflict_and_leaves_db_alone() {
        let tsync = create_test_sync().await;
        let item = seeded_item(&tsync, "Old").await;

        let mut file_item = tsync.ts.store.get_work_item(&item.id).await.unwrap().unwrap();
        file_item.title = "New".to_string();
        file_item.updated_at = Utc::now() + chrono::Duration::seconds(5);
        let content = render_work_item(&file_item, FileFormat::Markdown).unwrap();
        let path = tsync.tasks_dir.join("manual-test.md");

        let err = tsync
            .engine
            .sync_file_to_db(&path, &content, ConflictStrategy::Manual)
            .await
            .unwrap_err();
        let SyncError::Conflict { fields } = &err else {
            panic!("expected conflict, got {err:?}");
        };
        assert_eq!(err.code(), ErrorCode::Conflict);
        let title_diff = fields.iter().find(|d| d.field == "title").unwrap();
        assert_eq!(title_diff.file, Value::String("New".to_string()));
        assert_eq!(title_diff.db, Value::String("Old".to_string()));

        // DB unchanged, no sync state written.
        let db_item = tsync.ts.store.get_work_item(&item.id).await.unwrap().unwrap();
        assert_eq!(db_item.title, "Old");
        let state = tsync
            .ts
            .storage
            .get_sync_state(&path.to_string_lossy(), &item.id)
            .await
            .unwrap();
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn file_to_db_creates_missing_items() {
        let tsync = create_test_sync().await;

        let mut item = crate::storage::tests_support::sample_item("Imported from disk");
        item.vector = Vec::new();
        let content = render_work_item(&item, FileFormat::Yaml).unwrap();
        let path = tsync.tasks_dir.join("imported.yaml");

        let outcome = tsync
            .engine
            .sync_file_to_db(&path, &content, ConflictStrategy::FileWins)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Applied { .. }));

        let stored = tsync.ts.store.get_work_item(&item.id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Imported from disk");
        // The mirror write re-derived the embedding.
        assert!(!stored.vector.is_empty());
    }

    #[tokio::test]
    async fn unknown_extension_is_rejected() {
        let tsync = create_test_sync().await;
        let path = tsync.tasks_dir.join("item.toml");
        let err = tsync
            .engine
            .sync_file_to_db(&path, "whatever", ConflictStrategy::FileWins)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn markdown_without_frontmatter_is_a_parse_error() {
        let tsync = create_test_sync().await;
        let path = tsync.tasks_dir.join("broken.md");
        let err = tsync
            .engine
            .sync_file_to_db(&path, "# no frontmatter here", ConflictStrategy::FileWins)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Parse(_)));
    }

    #[tokio::test]
    async fn auto_merge_unions_set_fields() {
        let tsync = create_test_sync().await;
        let mut d = draft(ItemType::Task, "Merge target");
        d.tags = vec!["db-tag".to_string()];
        let item = tsync.ts.store.create_work_item(d).await.unwrap();

        let mut file_item = tsync.ts.store.get_work_item(&item.id).await.unwrap().unwrap();
        file_item.tags = vec!["file-tag".to_string()];
        file_item.updated_at = Utc::now() + chrono::Duration::seconds(5);
        let content = render_work_item(&file_item, FileFormat::Json).unwrap();
        let path = tsync.tasks_dir.join("merge.json");

        let outcome = tsync
            .engine
            .sync_file_to_db(&path, &content, ConflictStrategy::AutoMerge)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Applied { .. }));

        let merged = tsync.ts.store.get_work_item(&item.id).await.unwrap().unwrap();
        assert!(merged.tags.contains(&"file-tag".to_string()));
        assert!(merged.tags.contains(&"db-tag".to_string()));
    }

    #[tokio::test]
    async fn sync_status_reports_divergence() {
        let tsync = create_test_sync().await;
        let item = seeded_item(&tsync, "Tracked").await;

        let (path, _) = tsync
            .engine
            .sync_db_to_file(&item.id, FileFormat::Markdown, ConflictStrategy::DbWins)
            .await
            .unwrap();

        let status = tsync.engine.sync_status(&item.id).await.unwrap();
        assert_eq!(status.len(), 1);
        assert!(status[0].in_sync);

        // Touch the file: now it reads as changed.
        std::fs::write(&path, "---\nid: x\n---\n").unwrap();
        let status = tsync.engine.sync_status(&item.id).await.unwrap();
        assert!(status[0].file_changed);
        assert!(!status[0].in_sync);
    }

    #[tokio::test]
    async fn reconcile_all_sweeps_directory() {
        let tsync = create_test_sync().await;
        let a = seeded_item(&tsync, "First").await;
        let b = seeded_item(&tsync, "Second").await;

        tsync
            .engine
            .sync_db_to_file(&a.id, FileFormat::Markdown, ConflictStrategy::DbWins)
            .await
            .unwrap();
        tsync
            .engine
            .sync_db_to_file(&b.id, FileFormat::Json, ConflictStrategy::DbWins)
            .await
            .unwrap();
        // A file that cannot be parsed is reported, not fatal.
        std::fs::write(tsync.tasks_dir.join("broken.md"), "no frontmatter").unwrap();

        let summary = tsync
            .engine
            .reconcile_all(None, ConflictStrategy::NewestWins)
            .await
            .unwrap();
        assert_eq!(summary.unchanged, 2);
        assert_eq!(summary.errors.len(), 1);

        // Edit one file; the next sweep applies exactly that change.
        let mut edited = tsync.ts.store.get_work_item(&a.id).await.unwrap().unwrap();
        edited.title = "First, edited".to_string();
        edited.updated_at = Utc::now() + chrono::Duration::seconds(5);
        let tracked = tsync
            .ts
            .storage
            .sync_states_for_item(&a.id)
            .await
            .unwrap();
        let content = render_work_item(&edited, FileFormat::Markdown).unwrap();
        std::fs::write(&tracked[0].file_path, &content).unwrap();

        let summary = tsync
            .engine
            .reconcile_all(None, ConflictStrategy::NewestWins)
            .await
            .unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.unchanged, 1);

        let reloaded = tsync.ts.store.get_work_item(&a.id).await.unwrap().unwrap();
        assert_eq!(reloaded.title, "First, edited");
    }

    #[tokio::test]
    async fn state_mirror_file_is_written() {
        let tsync = create_test_sync().await;
        let item = seeded_item(&tsync, "Mirrored").await;

        tsync
            .engine
            .sync_db_to_file(&item.id, FileFormat::Markdown, ConflictStrategy::DbWins)
            .await
            .unwrap();

        let mirror = tsync
            .ts
            ._dir
            .path()
            .join("sync")
            .join(sync_state_file_name(&item.id));
        assert!(mirror.exists());
        let body: SyncState =
            serde_json::from_str(&std::fs::read_to_string(&mirror).unwrap()).unwrap();
        assert_eq!(body.work_item_id, item.id);
    }
}
