//! Autonomous execution orchestrator.
//!
//! Takes a work item, computes an execution plan over the induced
//! sub-DAG, drives items through the status machine via the storage core,
//! and supports cooperative cancellation with rollback. Each run owns one
//! ExecutionRecord; the orchestrator never writes run state into the
//! work-item table.

use crate::hierarchy::{HierarchyEngine, HierarchyError, ValidationReport};
use crate::storage::{Storage, StorageError};
use crate::store::{StoreError, WorkItemStore};
use async_trait::async_trait;
use chrono::Utc;
use jive_core::{
    new_id, ArtifactRef, ErrorCode, ExecutionMode, ExecutionRecord, ExecutionStatus, LogLevel,
    Status, ValidationCheck, ValidationOutcome, WorkItem,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Grace period granted to in-flight agent calls on a non-forced cancel.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("work item not found: {0}")]
    NotFound(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("execution already finished: {0}")]
    AlreadyFinished(String),
    #[error("validation failed for execution {execution_id}")]
    ValidationFailed {
        execution_id: String,
        report: ValidationReport,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ExecutorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) | Self::ExecutionNotFound(_) => ErrorCode::NotFound,
            Self::AlreadyFinished(_) => ErrorCode::InvalidArgument,
            Self::ValidationFailed { .. } => ErrorCode::InvariantViolation,
            Self::Store(e) => e.code(),
            Self::Storage(_) => ErrorCode::Internal,
        }
    }
}

impl From<HierarchyError> for ExecutorError {
    fn from(e: HierarchyError) -> Self {
        Self::Store(e.into())
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Outcome reported by an agent for one work item.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub detail: Option<String>,
    pub artifacts: Vec<ArtifactRef>,
}

impl AgentOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            detail: None,
            artifacts: Vec::new(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
            artifacts: Vec::new(),
        }
    }
}

/// The external agent that actually performs a work item. The token is the
/// cancellation signal; a rollback cancel carries `rollback=true` so the
/// agent can unwind its own artifacts.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_item(
        &self,
        item: &WorkItem,
        agent_context: Option<&Value>,
        cancel: CancellationToken,
        rollback_on_cancel: bool,
    ) -> AgentOutcome;
}

/// Built-in runner: acknowledges the instructions and reports success.
/// Deployments install an LLM-agent backed runner through the trait.
pub struct AcknowledgingRunner;

#[async_trait]
impl AgentRunner for AcknowledgingRunner {
    async fn run_item(
        &self,
        item: &WorkItem,
        _agent_context: Option<&Value>,
        _cancel: CancellationToken,
        _rollback_on_cancel: bool,
    ) -> AgentOutcome {
        tracing::debug!(id = %item.id, "acknowledging runner executed item");
        AgentOutcome::succeeded()
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_parallel: usize,
    pub item_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            item_timeout: Duration::from_secs(60 * 60),
        }
    }
}

struct ExecutionHandle {
    cancel: CancellationToken,
    rollback: Arc<std::sync::atomic::AtomicBool>,
    force: Arc<std::sync::atomic::AtomicBool>,
    cancel_reason: Arc<std::sync::Mutex<Option<String>>>,
    done_rx: tokio::sync::watch::Receiver<bool>,
}

/// The execution registry: the third process-wide singleton.
pub struct Executor {
    store: Arc<WorkItemStore>,
    hierarchy: Arc<HierarchyEngine>,
    storage: Arc<Storage>,
    runner: Arc<dyn AgentRunner>,
    config: ExecutorConfig,
    registry: Mutex<HashMap<String, ExecutionHandle>>,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(
        store: Arc<WorkItemStore>,
        storage: Arc<Storage>,
        runner: Arc<dyn AgentRunner>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            hierarchy: Arc::new(HierarchyEngine::new(Arc::clone(&storage))),
            store,
            storage,
            runner,
            config,
            registry: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start an execution for a work item. Returns once the record exists
    /// and (when requested) validation has passed; the run itself proceeds
    /// in the background.
    pub async fn execute(
        &self,
        work_item_id: &str,
        mode: ExecutionMode,
        agent_context: Option<Value>,
        validate_before: bool,
    ) -> Result<String> {
        let root = self
            .store
            .get_work_item(work_item_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(work_item_id.to_string()))?;

        let scope = self.collect_scope(&root).await?;
        let plan = plan_order(&scope);
        let execution_id = new_id();

        let mut record = ExecutionRecord {
            execution_id: execution_id.clone(),
            work_item_id: root.id.clone(),
            mode,
            status: ExecutionStatus::Queued,
            plan: plan.clone(),
            agent_context,
            started_at: Utc::now(),
            finished_at: None,
            cancel_reason: None,
            rollback_requested: false,
            artifacts: Vec::new(),
            validation_results: Vec::new(),
        };
        self.storage.insert_execution(&record).await?;
        self.log(&execution_id, LogLevel::Info, format!("queued, plan has {} items", plan.len()))
            .await;

        if validate_before {
            record.status = ExecutionStatus::Validating;
            self.storage.update_execution(&record).await?;

            let scope_ids: Vec<String> = scope.iter().map(|i| i.id.clone()).collect();
            let report = self
                .hierarchy
                .validate_dependencies(Some(&scope_ids), true, true, false)
                .await?;
            record.validation_results = validation_checks(&report);

            if !report.is_clean() {
                record.status = ExecutionStatus::Failed;
                record.finished_at = Some(Utc::now());
                self.storage.update_execution(&record).await?;
                self.log(&execution_id, LogLevel::Error, "validation gate failed")
                    .await;
                return Err(ExecutorError::ValidationFailed {
                    execution_id,
                    report,
                });
            }
            self.storage.update_execution(&record).await?;
            self.log(&execution_id, LogLevel::Info, "validation gate passed")
                .await;
        }

        let cancel = self.shutdown.child_token();
        let rollback = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let force = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let cancel_reason = Arc::new(std::sync::Mutex::new(None));
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);

        let handle = ExecutionHandle {
            cancel: cancel.clone(),
            rollback: Arc::clone(&rollback),
            force: Arc::clone(&force),
            cancel_reason: Arc::clone(&cancel_reason),
            done_rx,
        };
        self.registry
            .lock()
            .await
            .insert(execution_id.clone(), handle);

        let driver = Driver {
            store: Arc::clone(&self.store),
            hierarchy: Arc::clone(&self.hierarchy),
            storage: Arc::clone(&self.storage),
            runner: Arc::clone(&self.runner),
            config: self.config.clone(),
            record,
            scope,
            cancel,
            rollback,
            force,
            cancel_reason,
        };
        tokio::spawn(async move {
            driver.run().await;
            let _ = done_tx.send(true);
        });

        Ok(execution_id)
    }

    /// Fetch an execution record.
    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.storage
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ExecutorError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Fetch the append-only log stream of an execution.
    pub async fn get_execution_logs(
        &self,
        execution_id: &str,
    ) -> Result<Vec<jive_core::ExecutionLogEntry>> {
        Ok(self.storage.list_execution_logs(execution_id).await?)
    }

    /// Cancel a live execution. `rollback` sends in-flight items back to
    /// backlog and asks the agent to unwind artifacts; `force` skips the
    /// grace period for in-flight calls.
    pub async fn cancel_execution(
        &self,
        execution_id: &str,
        reason: Option<String>,
        rollback: bool,
        force: bool,
    ) -> Result<()> {
        let record = self.get_execution(execution_id).await?;
        if record.status.is_terminal() {
            return Err(ExecutorError::AlreadyFinished(execution_id.to_string()));
        }

        let registry = self.registry.lock().await;
        let Some(handle) = registry.get(execution_id) else {
            // Record is live but nothing is driving it (daemon restart);
            // close it out directly.
            drop(registry);
            let mut record = record;
            record.status = ExecutionStatus::Cancelled;
            record.cancel_reason = reason;
            record.rollback_requested = rollback;
            record.finished_at = Some(Utc::now());
            self.storage.update_execution(&record).await?;
            return Ok(());
        };

        handle
            .rollback
            .store(rollback, std::sync::atomic::Ordering::SeqCst);
        handle
            .force
            .store(force, std::sync::atomic::Ordering::SeqCst);
        if let Some(reason) = &reason {
            *handle.cancel_reason.lock().expect("reason slot poisoned") =
                Some(reason.clone());
        }
        handle.cancel.cancel();
        drop(registry);

        if let Some(reason) = reason {
            self.log(
                execution_id,
                LogLevel::Warn,
                format!("cancel requested: {reason}"),
            )
            .await;
        }
        Ok(())
    }

    /// Wait for an execution's driver to finish. Used by shutdown and
    /// tests; completed executions return immediately.
    pub async fn wait(&self, execution_id: &str) -> Result<()> {
        let rx = {
            let registry = self.registry.lock().await;
            registry.get(execution_id).map(|h| h.done_rx.clone())
        };
        let Some(mut rx) = rx else {
            // Never registered (e.g. validation gate failure): nothing runs.
            return Ok(());
        };
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Cancel every live execution and wait for the drivers to drain.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<String> = self.registry.lock().await.keys().cloned().collect();
        for id in ids {
            let _ = self.wait(&id).await;
        }
    }

    async fn log(&self, execution_id: &str, level: LogLevel, message: impl AsRef<str>) {
        if let Err(e) = self
            .storage
            .append_execution_log(execution_id, level, message.as_ref())
            .await
        {
            tracing::warn!(execution_id, error = %e, "failed to append execution log");
        }
    }

    /// The induced sub-DAG: the root, its transitive children, and the
    /// transitive dependencies of everything collected.
    async fn collect_scope(&self, root: &WorkItem) -> Result<Vec<WorkItem>> {
        let mut items: HashMap<String, WorkItem> = HashMap::new();
        let mut queue = VecDeque::from([root.clone()]);

        while let Some(item) = queue.pop_front() {
            if items.contains_key(&item.id) {
                continue;
            }
            for child in self.storage.list_children(&item.id).await? {
                queue.push_back(child);
            }
            for dep_id in &item.dependencies {
                if !items.contains_key(dep_id) {
                    if let Some(dep) = self.storage.get_work_item(dep_id).await? {
                        queue.push_back(dep);
                    }
                }
            }
            items.insert(item.id.clone(), item);
        }

        Ok(items.into_values().collect())
    }
}

/// Blocking edges within the scope: an item waits on its in-scope
/// dependencies and on its in-scope children (a parent cannot finish
/// before the subtree it aggregates).
fn blocking_edges(scope: &[WorkItem]) -> HashMap<String, Vec<String>> {
    let ids: HashSet<&str> = scope.iter().map(|i| i.id.as_str()).collect();
    let mut edges: HashMap<String, Vec<String>> = scope
        .iter()
        .map(|item| {
            let deps = item
                .dependencies
                .iter()
                .filter(|dep| ids.contains(dep.as_str()))
                .cloned()
                .collect();
            (item.id.clone(), deps)
        })
        .collect();

    for item in scope {
        if let Some(parent_id) = &item.parent_id {
            if let Some(parent_edges) = edges.get_mut(parent_id) {
                parent_edges.push(item.id.clone());
            }
        }
    }
    edges
}

/// Depth of each item in the blocking graph: items nothing waits on sit at
/// depth 0.
fn blocking_depths(edges: &HashMap<String, Vec<String>>) -> HashMap<String, usize> {
    fn depth_of(
        id: &str,
        edges: &HashMap<String, Vec<String>>,
        depths: &mut HashMap<String, usize>,
        visiting: &mut HashSet<String>,
    ) -> usize {
        if let Some(d) = depths.get(id) {
            return *d;
        }
        if !visiting.insert(id.to_string()) {
            // Cycle: bottom out instead of recursing forever; validation
            // reports the cycle itself.
            return 0;
        }
        let d = edges
            .get(id)
            .map(|blockers| {
                blockers
                    .iter()
                    .map(|blocker| depth_of(blocker, edges, depths, visiting) + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        visiting.remove(id);
        depths.insert(id.to_string(), d);
        d
    }

    let mut depths = HashMap::new();
    let mut visiting = HashSet::new();
    for id in edges.keys() {
        depth_of(id, edges, &mut depths, &mut visiting);
    }
    depths
}

/// Stable plan order: by blocking depth, then creation time, then id.
fn plan_order(scope: &[WorkItem]) -> Vec<String> {
    let depths = blocking_depths(&blocking_edges(scope));
    let mut ordered: Vec<&WorkItem> = scope.iter().collect();
    ordered.sort_by(|a, b| {
        depths[&a.id]
            .cmp(&depths[&b.id])
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    ordered.into_iter().map(|i| i.id.clone()).collect()
}

fn validation_checks(report: &ValidationReport) -> Vec<ValidationCheck> {
    let mut checks = Vec::new();
    checks.push(ValidationCheck {
        check: "missing_references".to_string(),
        outcome: if report.missing.is_empty() {
            ValidationOutcome::Passed
        } else {
            ValidationOutcome::Failed
        },
        detail: if report.missing.is_empty() {
            None
        } else {
            Some(
                report
                    .missing
                    .iter()
                    .map(|m| format!("{} -> {}", m.from, m.missing))
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        },
    });
    checks.push(ValidationCheck {
        check: "cycles".to_string(),
        outcome: if report.cycles.is_empty() {
            ValidationOutcome::Passed
        } else {
            ValidationOutcome::Failed
        },
        detail: if report.cycles.is_empty() {
            None
        } else {
            Some(
                report
                    .cycles
                    .iter()
                    .map(|c| c.join(" -> "))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        },
    });
    checks.push(ValidationCheck {
        check: "rank_invariants".to_string(),
        outcome: if report.rank_violations.is_empty() {
            ValidationOutcome::Passed
        } else {
            ValidationOutcome::Failed
        },
        detail: if report.rank_violations.is_empty() {
            None
        } else {
            Some(
                report
                    .rank_violations
                    .iter()
                    .map(|v| format!("{} under {}", v.child, v.parent))
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        },
    });
    checks
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ItemState {
    Pending,
    Running,
    Done,
    Failed,
    Blocked,
}

enum ItemResult {
    Success(AgentOutcome),
    Failure(String),
}

/// Owns one execution from `running` to its terminal status.
struct Driver {
    store: Arc<WorkItemStore>,
    hierarchy: Arc<HierarchyEngine>,
    storage: Arc<Storage>,
    runner: Arc<dyn AgentRunner>,
    config: ExecutorConfig,
    record: ExecutionRecord,
    scope: Vec<WorkItem>,
    cancel: CancellationToken,
    rollback: Arc<std::sync::atomic::AtomicBool>,
    force: Arc<std::sync::atomic::AtomicBool>,
    cancel_reason: Arc<std::sync::Mutex<Option<String>>>,
}

impl Driver {
    async fn run(mut self) {
        self.record.status = ExecutionStatus::Running;
        if let Err(e) = self.storage.update_execution(&self.record).await {
            tracing::error!(execution_id = %self.record.execution_id, error = %e, "failed to mark execution running");
            return;
        }
        self.log(LogLevel::Info, "execution running").await;

        let outcome = self.drive().await;

        self.record.finished_at = Some(Utc::now());
        self.record.status = outcome;
        if let Err(e) = self.storage.update_execution(&self.record).await {
            tracing::error!(execution_id = %self.record.execution_id, error = %e, "failed to finalise execution");
        }
        self.log(
            LogLevel::Info,
            format!("execution finished: {}", outcome.as_str()),
        )
        .await;
    }

    async fn drive(&mut self) -> ExecutionStatus {
        let by_id: HashMap<String, WorkItem> = self
            .scope
            .iter()
            .map(|i| (i.id.clone(), i.clone()))
            .collect();
        let edges = blocking_edges(&self.scope);
        let plan = self.record.plan.clone();

        let mut state: HashMap<String, ItemState> = HashMap::new();
        for id in &plan {
            let item = &by_id[id];
            if item.status.satisfies_dependency() {
                // Already done before this run; planned but not re-executed.
                state.insert(id.clone(), ItemState::Done);
                self.log(
                    LogLevel::Info,
                    format!("{id} already satisfied ({}), skipping", item.status.as_str()),
                )
                .await;
            } else {
                state.insert(id.clone(), ItemState::Pending);
            }
        }

        let concurrency = match self.record.mode {
            ExecutionMode::Sequential => 1,
            _ => self.config.max_parallel.max(1),
        };
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut join_set: JoinSet<(String, ItemResult)> = JoinSet::new();
        let mut running: HashSet<String> = HashSet::new();

        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled(&mut join_set, &mut running).await;
            }

            // Propagate failures: a pending item waiting on a failed or
            // blocked item will never become ready.
            for id in &plan {
                if state[id] != ItemState::Pending {
                    continue;
                }
                let doomed = edges[id].iter().any(|blocker| {
                    matches!(
                        state.get(blocker),
                        Some(ItemState::Failed | ItemState::Blocked)
                    )
                });
                if doomed {
                    state.insert(id.clone(), ItemState::Blocked);
                    self.mark_blocked(&by_id[id]).await;
                }
            }

            // Launch everything ready, within the mode's concurrency.
            for id in &plan {
                if state[id] != ItemState::Pending {
                    continue;
                }
                let item = &by_id[id];
                let ready = edges[id]
                    .iter()
                    .all(|blocker| state[blocker] == ItemState::Done);
                if !ready {
                    continue;
                }
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };

                if let Err(e) = self.start_item(item).await {
                    self.log(
                        LogLevel::Error,
                        format!("{id} could not start: {e}"),
                    )
                    .await;
                    state.insert(id.clone(), ItemState::Failed);
                    continue;
                }
                state.insert(id.clone(), ItemState::Running);
                running.insert(id.clone());

                let runner = Arc::clone(&self.runner);
                let work_item = item.clone();
                let context = self.record.agent_context.clone();
                let token = self.cancel.child_token();
                let rollback = Arc::clone(&self.rollback);
                let timeout = self.config.item_timeout;
                join_set.spawn(async move {
                    let _permit = permit;
                    let rollback_on_cancel =
                        rollback.load(std::sync::atomic::Ordering::SeqCst);
                    let result = tokio::time::timeout(
                        timeout,
                        runner.run_item(&work_item, context.as_ref(), token, rollback_on_cancel),
                    )
                    .await;
                    let outcome = match result {
                        Ok(outcome) if outcome.success => ItemResult::Success(outcome),
                        Ok(outcome) => ItemResult::Failure(
                            outcome
                                .detail
                                .unwrap_or_else(|| "agent reported failure".to_string()),
                        ),
                        Err(_) => ItemResult::Failure(format!(
                            "timed out after {} seconds",
                            timeout.as_secs()
                        )),
                    };
                    (work_item.id, outcome)
                });
            }

            if running.is_empty() {
                break;
            }

            // Biased so a cancellation signal always wins over an agent
            // result that raced with it.
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return self.cancelled(&mut join_set, &mut running).await;
                }
                joined = join_set.join_next() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Ok((id, result)) => {
                            running.remove(&id);
                            let next = self.finish_item(&id, result).await;
                            state.insert(id, next);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "execution worker panicked");
                        }
                    }
                }
            }
        }

        if state.values().all(|s| *s == ItemState::Done) {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        }
    }

    /// Transition an item to in_progress through the storage core.
    async fn start_item(&self, item: &WorkItem) -> crate::store::Result<()> {
        let patch = jive_core::WorkItemPatch {
            status: Some(Status::InProgress),
            ..Default::default()
        };
        self.store.update_work_item(&item.id, patch).await?;
        self.log(LogLevel::Info, format!("{} started", item.id)).await;
        Ok(())
    }

    /// Apply an item's terminal outcome and roll progress up its parents.
    async fn finish_item(&mut self, id: &str, result: ItemResult) -> ItemState {
        let (status, progress, state, detail) = match &result {
            ItemResult::Success(_) => (Status::Completed, Some(1.0), ItemState::Done, None),
            ItemResult::Failure(detail) => {
                (Status::Failed, None, ItemState::Failed, Some(detail.clone()))
            }
        };

        if let ItemResult::Success(outcome) = &result {
            self.record.artifacts.extend(outcome.artifacts.iter().cloned());
        }

        let patch = jive_core::WorkItemPatch {
            status: Some(status),
            progress,
            ..Default::default()
        };
        if let Err(e) = self.store.update_work_item(id, patch).await {
            self.log(
                LogLevel::Error,
                format!("{id} outcome write failed: {e}"),
            )
            .await;
            return ItemState::Failed;
        }

        if let Err(e) = self.hierarchy.rollup_from(id).await {
            self.log(
                LogLevel::Warn,
                format!("progress rollup after {id} failed: {e}"),
            )
            .await;
        }

        match detail {
            None => self.log(LogLevel::Info, format!("{id} completed")).await,
            Some(detail) => {
                self.log(LogLevel::Error, format!("{id} failed: {detail}"))
                    .await;
            }
        }
        state
    }

    /// Record that an item is blocked by an upstream failure. The stored
    /// status only moves when the machine allows it; otherwise the block
    /// is tracked in the execution record alone.
    async fn mark_blocked(&self, item: &WorkItem) {
        if item.status.can_transition_to(Status::Blocked) {
            let patch = jive_core::WorkItemPatch {
                status: Some(Status::Blocked),
                ..Default::default()
            };
            if let Err(e) = self.store.update_work_item(&item.id, patch).await {
                self.log(
                    LogLevel::Warn,
                    format!("{} block write failed: {e}", item.id),
                )
                .await;
            }
        }
        self.log(
            LogLevel::Warn,
            format!("{} blocked by failed dependency", item.id),
        )
        .await;
    }

    /// Cancellation protocol: give in-flight calls their grace period
    /// (unless forced), then unwind.
    async fn cancelled(
        &mut self,
        join_set: &mut JoinSet<(String, ItemResult)>,
        running: &mut HashSet<String>,
    ) -> ExecutionStatus {
        let force = self.force.load(std::sync::atomic::Ordering::SeqCst);
        let rollback = self.rollback.load(std::sync::atomic::Ordering::SeqCst);

        self.log(
            LogLevel::Warn,
            format!("cancelling (rollback={rollback}, force={force})"),
        )
        .await;

        if !force {
            // Items that manage to finish inside the grace period keep
            // their real outcome; agent-side cancellation failures are
            // handled by the transition below instead.
            let deadline = tokio::time::Instant::now() + CANCEL_GRACE;
            loop {
                let joined = tokio::select! {
                    joined = join_set.join_next() => joined,
                    () = tokio::time::sleep_until(deadline) => break,
                };
                match joined {
                    Some(Ok((id, result @ ItemResult::Success(_)))) => {
                        self.finish_item(&id, result).await;
                        running.remove(&id);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
        join_set.abort_all();
        while join_set.join_next().await.is_some() {}

        // In-flight items move per the cancellation protocol: back to
        // backlog on rollback, else to cancelled.
        let target = if rollback {
            Status::Backlog
        } else {
            Status::Cancelled
        };
        for id in running.iter() {
            let _guard = self.storage.item_write_guard(id).await;
            match self.storage.get_work_item(id).await {
                Ok(Some(mut item)) if item.status == Status::InProgress => {
                    item.status = target;
                    item.updated_at = Utc::now().max(item.updated_at);
                    if let Err(e) = self.storage.update_work_item(&item).await {
                        tracing::warn!(id = %id, error = %e, "cancel transition failed");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "cancel read failed");
                }
            }
            if let Err(e) = self.hierarchy.rollup_from(id).await {
                tracing::warn!(id = %id, error = %e, "rollup after cancel failed");
            }
        }

        if rollback {
            // The agent unwinds its own writes; this side only marks the
            // recorded artifacts superseded.
            for artifact in &mut self.record.artifacts {
                artifact.superseded = true;
            }
        }

        self.record.rollback_requested = rollback;
        let requested_reason = self
            .cancel_reason
            .lock()
            .expect("reason slot poisoned")
            .clone();
        self.record.cancel_reason =
            Some(requested_reason.unwrap_or_else(|| "cancelled".to_string()));
        ExecutionStatus::Cancelled
    }

    async fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        if let Err(e) = self
            .storage
            .append_execution_log(&self.record.execution_id, level, message.as_ref())
            .await
        {
            tracing::warn!(error = %e, "failed to append execution log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests_support::{create_test_store, draft, TestStore};
    use jive_core::ItemType;

    /// Scripted runner: fails configured ids, sleeps where asked, and
    /// records the order in which items ran.
    struct ScriptedRunner {
        fail: HashSet<String>,
        delay: Duration,
        order: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(fail: HashSet<String>, delay: Duration) -> Self {
            Self {
                fail,
                delay,
                order: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn ran(&self) -> Vec<String> {
            self.order.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        async fn run_item(
            &self,
            item: &WorkItem,
            _agent_context: Option<&Value>,
            cancel: CancellationToken,
            _rollback_on_cancel: bool,
        ) -> AgentOutcome {
            self.order.lock().unwrap().push(item.id.clone());
            if !self.delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(self.delay) => {}
                    () = cancel.cancelled() => {
                        return AgentOutcome::failed("cancelled");
                    }
                }
            }
            if self.fail.contains(&item.id) {
                AgentOutcome::failed("scripted failure")
            } else {
                AgentOutcome::succeeded()
            }
        }
    }

    fn executor_with(ts: &TestStore, runner: Arc<dyn AgentRunner>) -> Executor {
        Executor::new(
            Arc::clone(&ts.store),
            Arc::clone(&ts.storage),
            runner,
            ExecutorConfig {
                max_parallel: 3,
                item_timeout: Duration::from_secs(30),
            },
        )
    }

    async fn completed_dep(ts: &TestStore, title: &str) -> WorkItem {
        let item = ts
            .store
            .create_work_item(draft(ItemType::Task, title))
            .await
            .unwrap();
        let patch = jive_core::WorkItemPatch {
            status: Some(Status::InProgress),
            ..Default::default()
        };
        ts.store.update_work_item(&item.id, patch).await.unwrap();
        let patch = jive_core::WorkItemPatch {
            status: Some(Status::Completed),
            progress: Some(1.0),
            ..Default::default()
        };
        ts.store.update_work_item(&item.id, patch).await.unwrap()
    }

    #[tokio::test]
    async fn execute_with_satisfied_dependencies_completes_root() {
        let ts = create_test_store().await;
        let d1 = completed_dep(&ts, "dep one").await;
        let d2 = completed_dep(&ts, "dep two").await;

        let mut story = draft(ItemType::Story, "the story");
        story.dependencies = vec![d1.id.clone(), d2.id.clone()];
        let story = ts.store.create_work_item(story).await.unwrap();

        let runner = Arc::new(ScriptedRunner::new(HashSet::new(), Duration::ZERO));
        let executor = executor_with(&ts, Arc::clone(&runner) as Arc<dyn AgentRunner>);

        let execution_id = executor
            .execute(&story.id, ExecutionMode::DependencyBased, None, true)
            .await
            .unwrap();
        executor.wait(&execution_id).await.unwrap();

        let record = executor.get_execution(&execution_id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        // Plan ends with the story; the satisfied dependencies precede it.
        assert_eq!(record.plan.last(), Some(&story.id));
        assert!(record.plan.contains(&d1.id));
        assert!(record.plan.contains(&d2.id));
        // Satisfied dependencies were not re-executed.
        assert_eq!(runner.ran(), vec![story.id.clone()]);

        let story_after = ts.store.get_work_item(&story.id).await.unwrap().unwrap();
        assert_eq!(story_after.status, Status::Completed);
        assert!((story_after.progress - 1.0).abs() < 1e-9);

        let logs = executor.get_execution_logs(&execution_id).await.unwrap();
        assert!(!logs.is_empty());
    }

    #[tokio::test]
    async fn dependency_order_is_respected() {
        let ts = create_test_store().await;
        let a = ts
            .store
            .create_work_item(draft(ItemType::Task, "first"))
            .await
            .unwrap();
        let mut b_draft = draft(ItemType::Task, "second");
        b_draft.dependencies = vec![a.id.clone()];
        let b = ts.store.create_work_item(b_draft).await.unwrap();

        let runner = Arc::new(ScriptedRunner::new(HashSet::new(), Duration::ZERO));
        let executor = executor_with(&ts, Arc::clone(&runner) as Arc<dyn AgentRunner>);

        let execution_id = executor
            .execute(&b.id, ExecutionMode::DependencyBased, None, false)
            .await
            .unwrap();
        executor.wait(&execution_id).await.unwrap();

        assert_eq!(runner.ran(), vec![a.id, b.id]);
        let record = executor.get_execution(&execution_id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn failure_propagates_to_dependents_only() {
        let ts = create_test_store().await;
        let doomed = ts
            .store
            .create_work_item(draft(ItemType::Task, "doomed"))
            .await
            .unwrap();
        let mut dependent_draft = draft(ItemType::Task, "dependent");
        dependent_draft.dependencies = vec![doomed.id.clone()];
        let dependent = ts.store.create_work_item(dependent_draft).await.unwrap();
        let bystander = ts
            .store
            .create_work_item(draft(ItemType::Task, "bystander"))
            .await
            .unwrap();

        // Root story holding all three as children.
        let story = ts
            .store
            .create_work_item(draft(ItemType::Story, "root story"))
            .await
            .unwrap();
        for id in [&doomed.id, &dependent.id, &bystander.id] {
            let patch = jive_core::WorkItemPatch {
                parent_id: Some(Some(story.id.clone())),
                ..Default::default()
            };
            ts.store.update_work_item(id, patch).await.unwrap();
        }

        let runner = Arc::new(ScriptedRunner::new(
            HashSet::from([doomed.id.clone()]),
            Duration::ZERO,
        ));
        let executor = executor_with(&ts, Arc::clone(&runner) as Arc<dyn AgentRunner>);

        let execution_id = executor
            .execute(&story.id, ExecutionMode::DependencyBased, None, false)
            .await
            .unwrap();
        executor.wait(&execution_id).await.unwrap();

        let record = executor.get_execution(&execution_id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);

        let doomed_after = ts.store.get_work_item(&doomed.id).await.unwrap().unwrap();
        assert_eq!(doomed_after.status, Status::Failed);

        // The dependent never ran; the bystander did.
        let ran = runner.ran();
        assert!(!ran.contains(&dependent.id));
        assert!(ran.contains(&bystander.id));
    }

    #[tokio::test]
    async fn sequential_mode_runs_one_at_a_time_in_stable_order() {
        let ts = create_test_store().await;
        let story = ts
            .store
            .create_work_item(draft(ItemType::Story, "root"))
            .await
            .unwrap();
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut d = draft(ItemType::Task, &format!("task {i}"));
            d.parent_id = Some(story.id.clone());
            ids.push(ts.store.create_work_item(d).await.unwrap().id);
            tokio::time::sleep(Duration::from_millis(3)).await;
        }

        let runner = Arc::new(ScriptedRunner::new(HashSet::new(), Duration::ZERO));
        let executor = executor_with(&ts, Arc::clone(&runner) as Arc<dyn AgentRunner>);

        let execution_id = executor
            .execute(&story.id, ExecutionMode::Sequential, None, false)
            .await
            .unwrap();
        executor.wait(&execution_id).await.unwrap();

        // Tasks ran in creation order, then the root.
        let ran = runner.ran();
        assert_eq!(&ran[..3], &ids[..]);
        assert_eq!(ran.last(), Some(&story.id));
    }

    #[tokio::test]
    async fn validation_gate_rejects_cycles_before_running() {
        let ts = create_test_store().await;
        let a = ts
            .store
            .create_work_item(draft(ItemType::Task, "a"))
            .await
            .unwrap();
        let b = ts
            .store
            .create_work_item(draft(ItemType::Task, "b"))
            .await
            .unwrap();

        // Force a cycle directly in storage, bypassing the guarded paths.
        let mut a_raw = ts.storage.get_work_item(&a.id).await.unwrap().unwrap();
        a_raw.dependencies = vec![b.id.clone()];
        ts.storage.update_work_item(&a_raw).await.unwrap();
        let mut b_raw = ts.storage.get_work_item(&b.id).await.unwrap().unwrap();
        b_raw.dependencies = vec![a.id.clone()];
        ts.storage.update_work_item(&b_raw).await.unwrap();

        let runner = Arc::new(ScriptedRunner::new(HashSet::new(), Duration::ZERO));
        let executor = executor_with(&ts, Arc::clone(&runner) as Arc<dyn AgentRunner>);

        let err = executor
            .execute(&a.id, ExecutionMode::DependencyBased, None, true)
            .await
            .unwrap_err();
        let ExecutorError::ValidationFailed {
            execution_id,
            report,
        } = err
        else {
            panic!("expected validation failure");
        };
        assert!(!report.cycles.is_empty());

        let record = executor.get_execution(&execution_id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record
            .validation_results
            .iter()
            .any(|c| c.check == "cycles" && c.outcome == ValidationOutcome::Failed));
        assert!(runner.ran().is_empty());
    }

    #[tokio::test]
    async fn cancel_with_rollback_returns_in_flight_items_to_backlog() {
        let ts = create_test_store().await;
        let task = ts
            .store
            .create_work_item(draft(ItemType::Task, "slow task"))
            .await
            .unwrap();

        let runner = Arc::new(ScriptedRunner::new(
            HashSet::new(),
            Duration::from_secs(30),
        ));
        let executor = executor_with(&ts, Arc::clone(&runner) as Arc<dyn AgentRunner>);

        let execution_id = executor
            .execute(&task.id, ExecutionMode::DependencyBased, None, false)
            .await
            .unwrap();

        // Let the item reach in_progress.
        for _ in 0..100 {
            let current = ts.store.get_work_item(&task.id).await.unwrap().unwrap();
            if current.status == Status::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        executor
            .cancel_execution(&execution_id, Some("test cancel".to_string()), true, true)
            .await
            .unwrap();
        executor.wait(&execution_id).await.unwrap();

        let record = executor.get_execution(&execution_id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(record.rollback_requested);

        let task_after = ts.store.get_work_item(&task.id).await.unwrap().unwrap();
        assert_eq!(task_after.status, Status::Backlog);
    }

    #[tokio::test]
    async fn cancel_finished_execution_is_rejected() {
        let ts = create_test_store().await;
        let task = ts
            .store
            .create_work_item(draft(ItemType::Task, "quick"))
            .await
            .unwrap();

        let runner = Arc::new(ScriptedRunner::new(HashSet::new(), Duration::ZERO));
        let executor = executor_with(&ts, runner);

        let execution_id = executor
            .execute(&task.id, ExecutionMode::DependencyBased, None, false)
            .await
            .unwrap();
        executor.wait(&execution_id).await.unwrap();

        let err = executor
            .cancel_execution(&execution_id, None, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::AlreadyFinished(_)));
    }

    #[tokio::test]
    async fn execute_missing_item_is_not_found() {
        let ts = create_test_store().await;
        let runner = Arc::new(AcknowledgingRunner);
        let executor = executor_with(&ts, runner);
        let err = executor
            .execute(&new_id(), ExecutionMode::DependencyBased, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound(_)));
    }

    #[tokio::test]
    async fn parent_progress_recomputed_after_completion() {
        let ts = create_test_store().await;
        let feature = ts
            .store
            .create_work_item(draft(ItemType::Feature, "feature"))
            .await
            .unwrap();
        let mut s1 = draft(ItemType::Story, "story one");
        s1.parent_id = Some(feature.id.clone());
        let s1 = ts.store.create_work_item(s1).await.unwrap();
        let mut s2 = draft(ItemType::Story, "story two");
        s2.parent_id = Some(feature.id.clone());
        ts.store.create_work_item(s2).await.unwrap();

        let runner = Arc::new(ScriptedRunner::new(HashSet::new(), Duration::ZERO));
        let executor = executor_with(&ts, runner);

        let execution_id = executor
            .execute(&s1.id, ExecutionMode::DependencyBased, None, false)
            .await
            .unwrap();
        executor.wait(&execution_id).await.unwrap();

        let feature_after = ts.store.get_work_item(&feature.id).await.unwrap().unwrap();
        assert!((feature_after.progress - 0.5).abs() < 1e-9);
    }
}
