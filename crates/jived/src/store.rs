//! Storage-core operations for work items.
//!
//! Composes field validation, the status machine, structural invariants,
//! the embedding pipeline, and index upkeep over the raw storage layer.
//! Every mutation holds the per-item write lock for the whole
//! read-validate-write-index sequence; readers never take it.

use crate::embedding::{EmbeddingError, EmbeddingService};
use crate::hierarchy::{HierarchyEngine, HierarchyError};
use crate::search::{SearchEngine, SearchError, SearchMode, SearchResponse};
use crate::storage::{ListFilter, Storage, StorageError};
use chrono::Utc;
use jive_core::{
    is_canonical_uuid, new_id, validate_work_item, ErrorCode, Status, ValidationError, WorkItem,
    WorkItemDraft, WorkItemPatch,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const MAX_SEARCH_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("work item not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("invalid status transition from {} to {}", .from.as_str(), .to.as_str())]
    InvalidTransition {
        from: Status,
        to: Status,
        allowed: Vec<Status>,
    },
    #[error("work item {id} has {children} children; delete requires cascade")]
    HasChildren { id: String, children: usize },
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error("no usable search index: {0}")]
    IndexUnavailable(String),
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl StoreError {
    /// The stable wire code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Invariant(_) | Self::Cycle { .. } => ErrorCode::InvariantViolation,
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::HasChildren { .. } => ErrorCode::HasChildren,
            Self::Embedding(EmbeddingError::Timeout(_)) => ErrorCode::Timeout,
            Self::Embedding(_) => ErrorCode::EmbeddingUnavailable,
            Self::IndexUnavailable(_) => ErrorCode::IndexUnavailable,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Storage(_) => ErrorCode::Internal,
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::WorkItemNotFound(id) => Self::NotFound(id),
            other => Self::Storage(other),
        }
    }
}

impl From<SearchError> for StoreError {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::Storage(s) => s.into(),
            SearchError::Embedding(e) => Self::Embedding(e),
            SearchError::IndexUnavailable(msg) => Self::IndexUnavailable(msg),
        }
    }
}

impl From<ValidationError> for StoreError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::SelfDependency
            | ValidationError::ProgressRange(_)
            | ValidationError::MissingExecutionInstructions => Self::Invariant(e.to_string()),
            other => Self::InvalidArgument(other.to_string()),
        }
    }
}

impl From<HierarchyError> for StoreError {
    fn from(e: HierarchyError) -> Self {
        match e {
            HierarchyError::NotFound(id) => Self::NotFound(id),
            HierarchyError::Cycle { path } => Self::Cycle { path },
            HierarchyError::Invariant(msg) => Self::Invariant(msg),
            HierarchyError::Storage(s) => s.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The storage core: one of the three process-wide singletons.
pub struct WorkItemStore {
    storage: Arc<Storage>,
    embedding: Arc<EmbeddingService>,
    search: Arc<SearchEngine>,
    hierarchy: HierarchyEngine,
    search_timeout_sec: u64,
}

impl WorkItemStore {
    pub fn new(
        storage: Arc<Storage>,
        embedding: Arc<EmbeddingService>,
        search: Arc<SearchEngine>,
        search_timeout_sec: u64,
    ) -> Self {
        Self {
            hierarchy: HierarchyEngine::new(Arc::clone(&storage)),
            storage,
            embedding,
            search,
            search_timeout_sec,
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Create a work item from a draft. Generates the id when absent,
    /// enforces every local invariant, derives the embedding, and writes
    /// the row atomically; an embedding failure persists nothing.
    pub async fn create_work_item(&self, draft: WorkItemDraft) -> Result<WorkItem> {
        let id = match draft.id {
            Some(raw) => {
                let id = raw.to_lowercase();
                if !is_canonical_uuid(&id) {
                    return Err(StoreError::InvalidArgument(format!(
                        "id is not a canonical UUIDv4: {raw}"
                    )));
                }
                id
            }
            None => new_id(),
        };

        let now = Utc::now();
        let mut item = WorkItem {
            id,
            item_id: draft.item_id,
            item_type: draft.item_type,
            title: draft.title,
            description: draft.description,
            status: draft.status.unwrap_or_default(),
            priority: draft.priority.unwrap_or_default(),
            parent_id: draft.parent_id.map(|p| p.to_lowercase()),
            dependencies: dedup_preserving_order(draft.dependencies),
            assignee: draft.assignee,
            tags: draft.tags,
            acceptance_criteria: draft.acceptance_criteria,
            estimated_hours: draft.estimated_hours,
            actual_hours: draft.actual_hours,
            progress: draft.progress.unwrap_or(0.0),
            autonomous_executable: draft.autonomous_executable,
            execution_instructions: draft.execution_instructions,
            metadata: draft.metadata,
            created_at: now,
            updated_at: now,
            vector: Vec::new(),
        };

        validate_work_item(&item)?;

        let _guard = self.storage.item_write_guard(&item.id).await;

        if self.storage.get_work_item(&item.id).await?.is_some() {
            return Err(StoreError::InvalidArgument(format!(
                "work item already exists: {}",
                item.id
            )));
        }

        self.check_parent(&item).await?;
        self.check_dependencies_exist(&item).await?;

        item.vector = self.embedding.embed(&item.embedding_input()).await?;

        self.storage.insert_work_item(&item).await?;
        self.search.note_write(&self.storage, &item).await;

        tracing::info!(id = %item.id, item_type = item.item_type.as_str(), "work item created");
        Ok(item)
    }

    /// Get a work item by canonical id.
    pub async fn get_work_item(&self, id: &str) -> Result<Option<WorkItem>> {
        Ok(self.storage.get_work_item(id).await?)
    }

    /// Apply a partial update. Re-derives the embedding and bumps
    /// `updated_at` on every call, including no-op patches.
    pub async fn update_work_item(&self, id: &str, patch: WorkItemPatch) -> Result<WorkItem> {
        let _guard = self.storage.item_write_guard(id).await;

        let existing = self
            .storage
            .get_work_item(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut item = existing.clone();

        if let Some(status) = patch.status {
            if status != existing.status {
                if !existing.status.can_transition_to(status) {
                    return Err(StoreError::InvalidTransition {
                        from: existing.status,
                        to: status,
                        allowed: existing.status.allowed_transitions().to_vec(),
                    });
                }
                if existing.status.is_terminal() {
                    tracing::warn!(
                        id = %id,
                        from = existing.status.as_str(),
                        to = status.as_str(),
                        "reopening a terminal work item"
                    );
                }
                item.status = status;
            }
        }

        if let Some(item_id) = patch.item_id {
            item.item_id = item_id;
        }
        if let Some(title) = patch.title {
            item.title = title;
        }
        if let Some(description) = patch.description {
            item.description = description;
        }
        if let Some(priority) = patch.priority {
            item.priority = priority;
        }
        if let Some(parent_id) = patch.parent_id {
            item.parent_id = parent_id.map(|p| p.to_lowercase());
        }
        if let Some(dependencies) = patch.dependencies {
            item.dependencies = dedup_preserving_order(dependencies);
        }
        if let Some(assignee) = patch.assignee {
            item.assignee = assignee;
        }
        if let Some(tags) = patch.tags {
            item.tags = tags;
        }
        if let Some(acceptance_criteria) = patch.acceptance_criteria {
            item.acceptance_criteria = acceptance_criteria;
        }
        if let Some(estimated_hours) = patch.estimated_hours {
            item.estimated_hours = estimated_hours;
        }
        if let Some(actual_hours) = patch.actual_hours {
            item.actual_hours = actual_hours;
        }
        if let Some(progress) = patch.progress {
            item.progress = progress;
        }
        if let Some(autonomous_executable) = patch.autonomous_executable {
            item.autonomous_executable = autonomous_executable;
        }
        if let Some(execution_instructions) = patch.execution_instructions {
            item.execution_instructions = execution_instructions;
        }
        if let Some(metadata) = patch.metadata {
            item.metadata = metadata;
        }

        validate_work_item(&item)?;

        if item.parent_id != existing.parent_id {
            self.check_parent(&item).await?;
        }
        if item.dependencies != existing.dependencies {
            self.check_dependencies_exist(&item).await?;
            for dep in &item.dependencies {
                if existing.dependencies.contains(dep) {
                    continue;
                }
                if let Some(path) = self.hierarchy.dependency_cycle_path(&item.id, dep).await? {
                    return Err(StoreError::Cycle { path });
                }
            }
        }

        item.updated_at = Utc::now().max(existing.updated_at);
        item.vector = self.embedding.embed(&item.embedding_input()).await?;

        self.storage.update_work_item(&item).await?;
        self.search.note_write(&self.storage, &item).await;

        Ok(item)
    }

    /// Write a complete item produced by the sync engine. Field values are
    /// validated, but the status edge check does not apply to mirror
    /// writes; the file is an authoritative snapshot.
    pub async fn apply_synced(&self, mut item: WorkItem) -> Result<WorkItem> {
        item.id = item.id.to_lowercase();
        validate_work_item(&item)?;

        let _guard = self.storage.item_write_guard(&item.id).await;

        self.check_parent(&item).await?;
        self.check_dependencies_exist(&item).await?;

        item.vector = self.embedding.embed(&item.embedding_input()).await?;

        match self.storage.get_work_item(&item.id).await? {
            Some(existing) => {
                // The stored creation time wins over whatever the file says.
                item.created_at = existing.created_at;
                self.storage.update_work_item(&item).await?;
            }
            None => {
                self.storage.insert_work_item(&item).await?;
            }
        }
        self.search.note_write(&self.storage, &item).await;
        Ok(item)
    }

    /// Delete a work item. With `cascade` the whole subtree goes in one
    /// batch and dependencies pointing into it are severed and logged;
    /// without it, children block the delete.
    pub async fn delete_work_item(&self, id: &str, cascade: bool) -> Result<u64> {
        let _guard = self.storage.item_write_guard(id).await;

        if self.storage.get_work_item(id).await?.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }

        let children = self.storage.list_children(id).await?;
        if !cascade && !children.is_empty() {
            return Err(StoreError::HasChildren {
                id: id.to_string(),
                children: children.len(),
            });
        }

        // Collect the whole subtree breadth-first.
        let mut doomed: Vec<String> = vec![id.to_string()];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let current = doomed[cursor].clone();
            cursor += 1;
            for child in self.storage.list_children(&current).await? {
                doomed.push(child.id);
            }
        }
        let doomed_set: HashSet<&str> = doomed.iter().map(String::as_str).collect();

        let deleted = self.storage.delete_work_items(&doomed).await?;

        // Sever dependencies pointing into the removed subtree.
        let survivors = self.storage.list_work_items(&ListFilter::default()).await?;
        for survivor in survivors {
            let severed: Vec<&String> = survivor
                .dependencies
                .iter()
                .filter(|d| doomed_set.contains(d.as_str()))
                .collect();
            if severed.is_empty() {
                continue;
            }
            tracing::info!(
                id = %survivor.id,
                severed = ?severed,
                "severing dependencies into deleted subtree"
            );
            let mut updated = survivor.clone();
            updated
                .dependencies
                .retain(|d| !doomed_set.contains(d.as_str()));
            updated.updated_at = Utc::now().max(updated.updated_at);
            let _dep_guard = self.storage.item_write_guard(&updated.id).await;
            self.storage.update_work_item(&updated).await?;
            self.search.note_write(&self.storage, &updated).await;
        }

        self.storage.delete_sync_states_for_items(&doomed).await?;
        self.search.note_delete(&self.storage, &doomed).await;

        tracing::info!(id = %id, deleted, cascade, "work items deleted");
        Ok(deleted)
    }

    /// List work items with filters, sort, and paging.
    pub async fn list_work_items(&self, filter: &ListFilter) -> Result<Vec<WorkItem>> {
        Ok(self.storage.list_work_items(filter).await?)
    }

    /// Count work items matching a filter.
    pub async fn count_work_items(&self, filter: &ListFilter) -> Result<i64> {
        Ok(self.storage.count_work_items(filter).await?)
    }

    /// Ranked search with the requested mode and automatic fallback.
    pub async fn search_work_items(
        &self,
        query: &str,
        mode: SearchMode,
        filter: &ListFilter,
        limit: usize,
    ) -> Result<SearchResponse> {
        if limit == 0 || limit > MAX_SEARCH_LIMIT {
            return Err(StoreError::InvalidArgument(format!(
                "limit must be within 1..={MAX_SEARCH_LIMIT}, got {limit}"
            )));
        }

        let deadline = Duration::from_secs(self.search_timeout_sec);
        let result = tokio::time::timeout(
            deadline,
            self.search
                .search(&self.storage, &self.embedding, query, mode, filter, limit),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.search_timeout_sec))?;
        Ok(result?)
    }

    async fn check_parent(&self, item: &WorkItem) -> Result<()> {
        let Some(parent_id) = &item.parent_id else {
            return Ok(());
        };
        if *parent_id == item.id {
            return Err(StoreError::Invariant(
                "work item cannot be its own parent".to_string(),
            ));
        }
        let parent = self
            .storage
            .get_work_item(parent_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(parent_id.clone()))?;
        if !item.item_type.is_valid_parent(parent.item_type) {
            return Err(StoreError::Invariant(format!(
                "a {} cannot be the parent of a {}",
                parent.item_type.as_str(),
                item.item_type.as_str()
            )));
        }
        Ok(())
    }

    async fn check_dependencies_exist(&self, item: &WorkItem) -> Result<()> {
        for dep in &item.dependencies {
            if self.storage.get_work_item(dep).await?.is_none() {
                return Err(StoreError::NotFound(dep.clone()));
            }
        }
        Ok(())
    }
}

fn dedup_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(|id| id.to_lowercase())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}
