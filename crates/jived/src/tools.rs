//! Transport-agnostic tool dispatch.
//!
//! Every tool takes a JSON object of arguments and returns a JSON object of
//! the shape `{success, ...payload, error?, error_code?, resolved_from?}`.
//! Work-item-addressing tools accept any identifier the resolver
//! understands; the canonical id is echoed under `resolved_from` when the
//! input was not already a UUID.

use crate::executor::{Executor, ExecutorError};
use crate::hierarchy::HierarchyEngine;
use crate::resolver::Resolver;
use crate::search::SearchMode;
use crate::storage::ListFilter;
use crate::store::{StoreError, WorkItemStore};
use crate::sync::{SyncEngine, SyncError};
use jive_core::{
    ConflictStrategy, ErrorCode, ExecutionMode, FileFormat, WorkItemDraft, WorkItemPatch,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The registered tool surface.
pub const TOOL_NAMES: &[&str] = &[
    "jive_create_work_item",
    "jive_get_work_item",
    "jive_update_work_item",
    "jive_delete_work_item",
    "jive_list_work_items",
    "jive_count_work_items",
    "jive_search_work_items",
    "jive_get_children",
    "jive_get_parent_chain",
    "jive_get_dependencies",
    "jive_add_dependency",
    "jive_remove_dependency",
    "jive_validate_dependencies",
    "jive_recalculate_progress",
    "jive_sync_file_to_db",
    "jive_sync_db_to_file",
    "jive_sync_status",
    "jive_reconcile_sync",
    "jive_execute_work_item",
    "jive_get_execution_status",
    "jive_cancel_execution",
];

/// Response-size shaping options.
#[derive(Debug, Clone)]
pub struct TruncationPolicy {
    pub enabled: bool,
    pub max_response_size: usize,
    pub threshold: usize,
}

/// A failed tool call, carrying the stable code and optional extra payload.
struct ToolFailure {
    code: ErrorCode,
    message: String,
    extras: Map<String, Value>,
}

impl ToolFailure {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            extras: Map::new(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    fn not_found(identifier: &str) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("no work item matches identifier: {identifier}"),
        )
    }
}

impl From<StoreError> for ToolFailure {
    fn from(e: StoreError) -> Self {
        let mut failure = ToolFailure::new(e.code(), e.to_string());
        match e {
            StoreError::Cycle { path } => {
                failure.extras.insert("cycle".to_string(), json!(path));
            }
            StoreError::InvalidTransition { allowed, .. } => {
                let allowed: Vec<&str> = allowed.iter().map(|s| s.as_str()).collect();
                failure
                    .extras
                    .insert("allowed_transitions".to_string(), json!(allowed));
            }
            _ => {}
        }
        failure
    }
}

impl From<crate::hierarchy::HierarchyError> for ToolFailure {
    fn from(e: crate::hierarchy::HierarchyError) -> Self {
        StoreError::from(e).into()
    }
}

impl From<SyncError> for ToolFailure {
    fn from(e: SyncError) -> Self {
        let mut failure = ToolFailure::new(e.code(), e.to_string());
        if let SyncError::Conflict { fields } = e {
            failure
                .extras
                .insert("conflicts".to_string(), json!(fields));
        }
        failure
    }
}

impl From<ExecutorError> for ToolFailure {
    fn from(e: ExecutorError) -> Self {
        let mut failure = ToolFailure::new(e.code(), e.to_string());
        if let ExecutorError::ValidationFailed {
            execution_id,
            report,
        } = e
        {
            failure
                .extras
                .insert("execution_id".to_string(), json!(execution_id));
            failure
                .extras
                .insert("validation".to_string(), json!(report));
        }
        failure
    }
}

type ToolResult = std::result::Result<Map<String, Value>, ToolFailure>;

pub struct ToolDispatcher {
    store: Arc<WorkItemStore>,
    resolver: Resolver,
    hierarchy: Arc<HierarchyEngine>,
    sync: Arc<SyncEngine>,
    executor: Arc<Executor>,
    truncation: TruncationPolicy,
}

impl ToolDispatcher {
    pub fn new(
        store: Arc<WorkItemStore>,
        hierarchy: Arc<HierarchyEngine>,
        sync: Arc<SyncEngine>,
        executor: Arc<Executor>,
        truncation: TruncationPolicy,
    ) -> Self {
        Self {
            resolver: Resolver::new(Arc::clone(&store)),
            store,
            hierarchy,
            sync,
            executor,
            truncation,
        }
    }

    /// Dispatch one tool call. The response is always a valid JSON object.
    pub async fn dispatch(&self, name: &str, args: Value) -> Value {
        let result = match name {
            "jive_create_work_item" => self.create_work_item(args).await,
            "jive_get_work_item" => self.get_work_item(args).await,
            "jive_update_work_item" => self.update_work_item(args).await,
            "jive_delete_work_item" => self.delete_work_item(args).await,
            "jive_list_work_items" => self.list_work_items(args).await,
            "jive_count_work_items" => self.count_work_items(args).await,
            "jive_search_work_items" => self.search_work_items(args).await,
            "jive_get_children" => self.get_children(args).await,
            "jive_get_parent_chain" => self.get_parent_chain(args).await,
            "jive_get_dependencies" => self.get_dependencies(args).await,
            "jive_add_dependency" => self.add_dependency(args).await,
            "jive_remove_dependency" => self.remove_dependency(args).await,
            "jive_validate_dependencies" => self.validate_dependencies(args).await,
            "jive_recalculate_progress" => self.recalculate_progress(args).await,
            "jive_sync_file_to_db" => self.sync_file_to_db(args).await,
            "jive_sync_db_to_file" => self.sync_db_to_file(args).await,
            "jive_sync_status" => self.sync_status(args).await,
            "jive_reconcile_sync" => self.reconcile_sync(args).await,
            "jive_execute_work_item" => self.execute_work_item(args).await,
            "jive_get_execution_status" => self.get_execution_status(args).await,
            "jive_cancel_execution" => self.cancel_execution(args).await,
            unknown => Err(ToolFailure::invalid(format!("unknown tool: {unknown}"))),
        };

        let response = match result {
            Ok(mut payload) => {
                payload.insert("success".to_string(), Value::Bool(true));
                Value::Object(payload)
            }
            Err(failure) => {
                let mut payload = failure.extras;
                payload.insert("success".to_string(), Value::Bool(false));
                payload.insert("error".to_string(), Value::String(failure.message));
                payload.insert(
                    "error_code".to_string(),
                    Value::String(failure.code.as_str().to_string()),
                );
                Value::Object(payload)
            }
        };

        self.shape_response(response)
    }

    /// Resolve a work-item identifier; failures are NotFound responses.
    /// Returns the id plus the original input when it needed resolving.
    async fn resolve_required(
        &self,
        identifier: &str,
    ) -> std::result::Result<(String, Option<String>), ToolFailure> {
        let resolved = self.resolver.resolve(identifier).await?;
        match resolved {
            Some(id) => {
                let resolved_from =
                    Some(identifier.to_string()).filter(|input| !input.eq_ignore_ascii_case(&id));
                Ok((id, resolved_from))
            }
            None => Err(ToolFailure::not_found(identifier)),
        }
    }

    // --- Work item CRUD ---

    async fn create_work_item(&self, args: Value) -> ToolResult {
        let draft: WorkItemDraft = parse_args(args)?;
        let item = self.store.create_work_item(draft).await?;
        let mut payload = Map::new();
        payload.insert("work_item_id".to_string(), json!(item.id));
        payload.insert("work_item".to_string(), json!(item));
        Ok(payload)
    }

    async fn get_work_item(&self, args: Value) -> ToolResult {
        let req: IdentifierArgs = parse_args(args)?;
        let (id, resolved_from) = self.resolve_required(&req.work_item_id).await?;
        let item = self
            .store
            .get_work_item(&id)
            .await?
            .ok_or_else(|| ToolFailure::not_found(&id))?;

        let mut payload = Map::new();
        payload.insert("work_item".to_string(), json!(item));
        add_resolved_from(&mut payload, resolved_from);
        Ok(payload)
    }

    async fn update_work_item(&self, args: Value) -> ToolResult {
        let Value::Object(mut object) = args else {
            return Err(ToolFailure::invalid("arguments must be an object"));
        };
        let identifier = take_identifier(&mut object)?;
        let patch: WorkItemPatch = parse_args(Value::Object(object))?;

        let (id, resolved_from) = self.resolve_required(&identifier).await?;
        let item = self.store.update_work_item(&id, patch).await?;

        let mut payload = Map::new();
        payload.insert("work_item".to_string(), json!(item));
        add_resolved_from(&mut payload, resolved_from);
        Ok(payload)
    }

    async fn delete_work_item(&self, args: Value) -> ToolResult {
        let req: DeleteArgs = parse_args(args)?;
        let (id, resolved_from) = self.resolve_required(&req.work_item_id).await?;
        let deleted = self.store.delete_work_item(&id, req.cascade).await?;

        let mut payload = Map::new();
        payload.insert("deleted_count".to_string(), json!(deleted));
        add_resolved_from(&mut payload, resolved_from);
        Ok(payload)
    }

    async fn list_work_items(&self, args: Value) -> ToolResult {
        let filter: ListFilter = parse_args(args)?;
        let items = self.store.list_work_items(&filter).await?;

        let mut payload = Map::new();
        payload.insert("count".to_string(), json!(items.len()));
        payload.insert("work_items".to_string(), json!(items));
        Ok(payload)
    }

    async fn count_work_items(&self, args: Value) -> ToolResult {
        let filter: ListFilter = parse_args(args)?;
        let count = self.store.count_work_items(&filter).await?;

        let mut payload = Map::new();
        payload.insert("count".to_string(), json!(count));
        Ok(payload)
    }

    async fn search_work_items(&self, args: Value) -> ToolResult {
        let req: SearchArgs = parse_args(args)?;
        let mode = match &req.search_type {
            None => SearchMode::Hybrid,
            Some(raw) => SearchMode::parse(raw)
                .ok_or_else(|| ToolFailure::invalid(format!("unknown search_type: {raw}")))?,
        };
        let response = self
            .store
            .search_work_items(&req.query, mode, &req.filter, req.limit)
            .await?;

        let mut payload = Map::new();
        payload.insert("count".to_string(), json!(response.hits.len()));
        payload.insert("results".to_string(), json!(response.hits));
        payload.insert("fallback_used".to_string(), json!(response.fallback_used));
        Ok(payload)
    }

    // --- Hierarchy & dependencies ---

    async fn get_children(&self, args: Value) -> ToolResult {
        let req: ChildrenArgs = parse_args(args)?;
        let (id, resolved_from) = self.resolve_required(&req.work_item_id).await?;
        let children = self.hierarchy.get_children(&id, req.recursive).await?;

        let mut payload = Map::new();
        payload.insert("count".to_string(), json!(children.len()));
        payload.insert("children".to_string(), json!(children));
        add_resolved_from(&mut payload, resolved_from);
        Ok(payload)
    }

    async fn get_parent_chain(&self, args: Value) -> ToolResult {
        let req: IdentifierArgs = parse_args(args)?;
        let (id, resolved_from) = self.resolve_required(&req.work_item_id).await?;
        let chain = self.hierarchy.get_parent_chain(&id).await?;

        let mut payload = Map::new();
        payload.insert("parents".to_string(), json!(chain));
        add_resolved_from(&mut payload, resolved_from);
        Ok(payload)
    }

    async fn get_dependencies(&self, args: Value) -> ToolResult {
        let req: DependenciesArgs = parse_args(args)?;
        let (id, resolved_from) = self.resolve_required(&req.work_item_id).await?;
        let dependencies = self
            .hierarchy
            .get_dependencies(&id, req.transitive, req.only_blocking)
            .await?;

        let mut payload = Map::new();
        payload.insert("count".to_string(), json!(dependencies.len()));
        payload.insert("dependencies".to_string(), json!(dependencies));
        add_resolved_from(&mut payload, resolved_from);
        Ok(payload)
    }

    async fn add_dependency(&self, args: Value) -> ToolResult {
        let req: DependencyEdgeArgs = parse_args(args)?;
        let (from, _) = self.resolve_required(&req.work_item_id).await?;
        let (to, _) = self.resolve_required(&req.depends_on).await?;
        let item = self.hierarchy.add_dependency(&from, &to).await?;

        let mut payload = Map::new();
        payload.insert("work_item".to_string(), json!(item));
        Ok(payload)
    }

    async fn remove_dependency(&self, args: Value) -> ToolResult {
        let req: DependencyEdgeArgs = parse_args(args)?;
        let (from, _) = self.resolve_required(&req.work_item_id).await?;
        let (to, _) = self.resolve_required(&req.depends_on).await?;
        let removed = self.hierarchy.remove_dependency(&from, &to).await?;

        let mut payload = Map::new();
        payload.insert("removed".to_string(), json!(removed));
        Ok(payload)
    }

    async fn validate_dependencies(&self, args: Value) -> ToolResult {
        let req: ValidateArgs = parse_args(args)?;
        let ids = match &req.work_item_ids {
            None => None,
            Some(raw_ids) => {
                let mut resolved = Vec::with_capacity(raw_ids.len());
                for raw in raw_ids {
                    let (id, _) = self.resolve_required(raw).await?;
                    resolved.push(id);
                }
                Some(resolved)
            }
        };

        let report = self
            .hierarchy
            .validate_dependencies(
                ids.as_deref(),
                req.check_cycles,
                req.check_missing,
                req.suggest_fixes,
            )
            .await?;

        let mut payload = Map::new();
        payload.insert("valid".to_string(), json!(report.is_clean()));
        payload.insert("report".to_string(), json!(report));
        Ok(payload)
    }

    async fn recalculate_progress(&self, args: Value) -> ToolResult {
        let req: RecalculateArgs = parse_args(args)?;
        let (root, resolved_from) = match &req.work_item_id {
            Some(identifier) => {
                let (id, from) = self.resolve_required(identifier).await?;
                (Some(id), from)
            }
            None => (None, None),
        };
        let updated = self
            .hierarchy
            .recalculate_progress(root.as_deref())
            .await?;

        let mut payload = Map::new();
        payload.insert("updated".to_string(), json!(updated));
        add_resolved_from(&mut payload, resolved_from);
        Ok(payload)
    }

    // --- Sync ---

    async fn sync_file_to_db(&self, args: Value) -> ToolResult {
        let req: SyncFileArgs = parse_args(args)?;
        let resolution = parse_resolution(req.resolution.as_deref())?;
        let outcome = self
            .sync
            .sync_file_to_db(Path::new(&req.file_path), &req.content, resolution)
            .await?;

        let mut payload = Map::new();
        payload.insert(
            "work_item_id".to_string(),
            json!(outcome.work_item_id()),
        );
        payload.insert("result".to_string(), json!(outcome));
        Ok(payload)
    }

    async fn sync_db_to_file(&self, args: Value) -> ToolResult {
        let req: SyncDbArgs = parse_args(args)?;
        let resolution = parse_resolution(req.resolution.as_deref())?;
        let format = match req.format.as_deref() {
            None => FileFormat::Markdown,
            Some(ext) => FileFormat::from_extension(ext)
                .map_err(|e| ToolFailure::invalid(e.to_string()))?,
        };
        let (id, resolved_from) = self.resolve_required(&req.work_item_id).await?;
        let (path, outcome) = self.sync.sync_db_to_file(&id, format, resolution).await?;

        let mut payload = Map::new();
        payload.insert("file_path".to_string(), json!(path.to_string_lossy()));
        payload.insert("result".to_string(), json!(outcome));
        add_resolved_from(&mut payload, resolved_from);
        Ok(payload)
    }

    async fn sync_status(&self, args: Value) -> ToolResult {
        let req: IdentifierArgs = parse_args(args)?;
        let (id, resolved_from) = self.resolve_required(&req.work_item_id).await?;
        let entries = self.sync.sync_status(&id).await?;

        let mut payload = Map::new();
        payload.insert("work_item_id".to_string(), json!(id));
        payload.insert("entries".to_string(), json!(entries));
        add_resolved_from(&mut payload, resolved_from);
        Ok(payload)
    }

    async fn reconcile_sync(&self, args: Value) -> ToolResult {
        let req: ReconcileArgs = parse_args(args)?;
        let resolution = parse_resolution(req.resolution.as_deref())?;
        let root = req.root_dir.as_ref().map(PathBuf::from);
        let summary = self.sync.reconcile_all(root.as_deref(), resolution).await?;

        let mut payload = Map::new();
        payload.insert("summary".to_string(), json!(summary));
        Ok(payload)
    }

    // --- Execution ---

    async fn execute_work_item(&self, args: Value) -> ToolResult {
        let req: ExecuteArgs = parse_args(args)?;
        let mode = match req.mode.as_deref() {
            None => ExecutionMode::DependencyBased,
            Some(raw) => ExecutionMode::parse(raw)
                .ok_or_else(|| ToolFailure::invalid(format!("unknown execution mode: {raw}")))?,
        };
        let (id, resolved_from) = self.resolve_required(&req.work_item_id).await?;
        let execution_id = self
            .executor
            .execute(&id, mode, req.agent_context, req.validate_before)
            .await?;

        let mut payload = Map::new();
        payload.insert("execution_id".to_string(), json!(execution_id));
        add_resolved_from(&mut payload, resolved_from);
        Ok(payload)
    }

    async fn get_execution_status(&self, args: Value) -> ToolResult {
        let req: ExecutionStatusArgs = parse_args(args)?;
        let record = self.executor.get_execution(&req.execution_id).await?;

        let mut payload = Map::new();
        payload.insert("execution_id".to_string(), json!(record.execution_id));
        payload.insert("work_item_id".to_string(), json!(record.work_item_id));
        payload.insert("status".to_string(), json!(record.status));
        payload.insert("mode".to_string(), json!(record.mode));
        payload.insert("plan".to_string(), json!(record.plan));
        payload.insert("started_at".to_string(), json!(record.started_at));
        payload.insert("finished_at".to_string(), json!(record.finished_at));
        payload.insert("cancel_reason".to_string(), json!(record.cancel_reason));
        payload.insert(
            "rollback_requested".to_string(),
            json!(record.rollback_requested),
        );
        if req.include_artifacts {
            payload.insert("artifacts".to_string(), json!(record.artifacts));
        }
        if req.include_validation {
            payload.insert(
                "validation_results".to_string(),
                json!(record.validation_results),
            );
        }
        if req.include_logs {
            let logs = self
                .executor
                .get_execution_logs(&req.execution_id)
                .await?;
            payload.insert("logs".to_string(), json!(logs));
        }
        Ok(payload)
    }

    async fn cancel_execution(&self, args: Value) -> ToolResult {
        let req: CancelArgs = parse_args(args)?;
        self.executor
            .cancel_execution(&req.execution_id, req.reason, req.rollback, req.force)
            .await?;

        let mut payload = Map::new();
        payload.insert("execution_id".to_string(), json!(req.execution_id));
        payload.insert("cancelled".to_string(), json!(true));
        Ok(payload)
    }

    /// Clip oversized responses: arrays are truncated to the configured
    /// threshold and the response is marked `truncated`.
    fn shape_response(&self, response: Value) -> Value {
        if !self.truncation.enabled {
            return response;
        }
        let size = response.to_string().len();
        if size <= self.truncation.max_response_size {
            return response;
        }

        let mut shaped = response;
        let mut truncated = false;
        truncate_arrays(&mut shaped, self.truncation.threshold, &mut truncated);
        if truncated {
            if let Value::Object(map) = &mut shaped {
                map.insert("truncated".to_string(), Value::Bool(true));
            }
            tracing::debug!(original_size = size, "response truncated");
        }
        shaped
    }
}

fn truncate_arrays(value: &mut Value, threshold: usize, truncated: &mut bool) {
    match value {
        Value::Array(items) => {
            if items.len() > threshold {
                items.truncate(threshold);
                *truncated = true;
            }
            for item in items {
                truncate_arrays(item, threshold, truncated);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                truncate_arrays(v, threshold, truncated);
            }
        }
        _ => {}
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> std::result::Result<T, ToolFailure> {
    serde_json::from_value(args).map_err(|e| ToolFailure::invalid(format!("invalid arguments: {e}")))
}

fn parse_resolution(
    raw: Option<&str>,
) -> std::result::Result<ConflictStrategy, ToolFailure> {
    match raw {
        None => Ok(ConflictStrategy::default()),
        Some(raw) => ConflictStrategy::parse(raw)
            .ok_or_else(|| ToolFailure::invalid(format!("unknown resolution: {raw}"))),
    }
}

fn take_identifier(
    object: &mut Map<String, Value>,
) -> std::result::Result<String, ToolFailure> {
    match object.remove("work_item_id") {
        Some(Value::String(id)) => Ok(id),
        Some(_) => Err(ToolFailure::invalid("work_item_id must be a string")),
        None => Err(ToolFailure::invalid("work_item_id is required")),
    }
}

fn add_resolved_from(payload: &mut Map<String, Value>, resolved_from: Option<String>) {
    if let Some(resolved_from) = resolved_from {
        payload.insert("resolved_from".to_string(), Value::String(resolved_from));
    }
}

// --- Argument shapes ---

#[derive(Debug, Deserialize)]
struct IdentifierArgs {
    work_item_id: String,
}

#[derive(Debug, Deserialize)]
struct DeleteArgs {
    work_item_id: String,
    #[serde(default)]
    cascade: bool,
}

fn default_search_limit() -> usize {
    10
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    search_type: Option<String>,
    #[serde(default = "default_search_limit")]
    limit: usize,
    #[serde(flatten)]
    filter: ListFilter,
}

#[derive(Debug, Deserialize)]
struct ChildrenArgs {
    work_item_id: String,
    #[serde(default)]
    recursive: bool,
}

#[derive(Debug, Deserialize)]
struct DependenciesArgs {
    work_item_id: String,
    #[serde(default)]
    transitive: bool,
    #[serde(default)]
    only_blocking: bool,
}

#[derive(Debug, Deserialize)]
struct DependencyEdgeArgs {
    work_item_id: String,
    depends_on: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ValidateArgs {
    #[serde(default)]
    work_item_ids: Option<Vec<String>>,
    #[serde(default = "default_true")]
    check_cycles: bool,
    #[serde(default = "default_true")]
    check_missing: bool,
    #[serde(default)]
    suggest_fixes: bool,
}

#[derive(Debug, Deserialize)]
struct RecalculateArgs {
    #[serde(default)]
    work_item_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncFileArgs {
    file_path: String,
    content: String,
    #[serde(default)]
    resolution: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncDbArgs {
    work_item_id: String,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    resolution: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReconcileArgs {
    #[serde(default)]
    root_dir: Option<String>,
    #[serde(default)]
    resolution: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecuteArgs {
    work_item_id: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    agent_context: Option<Value>,
    #[serde(default = "default_true")]
    validate_before: bool,
}

#[derive(Debug, Deserialize)]
struct ExecutionStatusArgs {
    execution_id: String,
    #[serde(default)]
    include_logs: bool,
    #[serde(default)]
    include_artifacts: bool,
    #[serde(default)]
    include_validation: bool,
}

#[derive(Debug, Deserialize)]
struct CancelArgs {
    execution_id: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    rollback: bool,
    #[serde(default)]
    force: bool,
}
