//! Core domain types for the work-management engine.
//!
//! Work items form a five-level hierarchy (initiative > epic > feature >
//! story > task) with cross-item dependencies, a validated status machine,
//! and derived progress. Execution and sync records reference work items by
//! canonical UUID.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a fresh canonical work-item id (UUIDv4, lowercase, hyphenated).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Check whether a string is a canonical UUIDv4: 36 chars, hyphenated,
/// version nibble 4. Uppercase input is accepted; storage always holds the
/// lowercase form.
pub fn is_canonical_uuid(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    match Uuid::try_parse(s) {
        Ok(u) => u.get_version_num() == 4,
        Err(_) => false,
    }
}

// --- Enumerations ---

/// Hierarchy level of a work item. Parent/child edges must descend exactly
/// one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Initiative,
    Epic,
    Feature,
    Story,
    Task,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiative => "initiative",
            Self::Epic => "epic",
            Self::Feature => "feature",
            Self::Story => "story",
            Self::Task => "task",
        }
    }

    /// Depth in the hierarchy: initiative=0 through task=4.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Initiative => 0,
            Self::Epic => 1,
            Self::Feature => 2,
            Self::Story => 3,
            Self::Task => 4,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiative" => Some(Self::Initiative),
            "epic" => Some(Self::Epic),
            "feature" => Some(Self::Feature),
            "story" => Some(Self::Story),
            "task" => Some(Self::Task),
            _ => None,
        }
    }

    /// Whether `parent` may directly contain an item of this type.
    pub fn is_valid_parent(&self, parent: Self) -> bool {
        parent.rank() + 1 == self.rank()
    }
}

/// Work item lifecycle status.
///
/// The serde aliases form the migration table for status strings found in
/// legacy data; they are accepted on read only and never written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    #[serde(alias = "not_started", alias = "todo", alias = "open")]
    Backlog,
    Ready,
    InProgress,
    Blocked,
    OnHold,
    #[serde(alias = "in_review")]
    UnderReview,
    Approved,
    Rejected,
    #[serde(alias = "done")]
    Completed,
    Failed,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::OnHold => "on_hold",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Strict parse of the canonical wire strings.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backlog" => Some(Self::Backlog),
            "ready" => Some(Self::Ready),
            "in_progress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            "on_hold" => Some(Self::OnHold),
            "under_review" => Some(Self::UnderReview),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Parse a stored status, mapping legacy strings through the explicit
    /// migration table. Unknown strings return `None`; they are never
    /// silently coerced.
    pub fn from_stored(s: &str) -> Option<Self> {
        Self::parse(s).or(match s {
            "not_started" | "todo" | "open" => Some(Self::Backlog),
            "done" => Some(Self::Completed),
            "in_review" => Some(Self::UnderReview),
            "canceled" => Some(Self::Cancelled),
            _ => None,
        })
    }

    /// Permitted transition targets from this status. Same-state writes are
    /// always allowed and are not listed.
    pub fn allowed_transitions(&self) -> &'static [Status] {
        use Status::{
            Approved, Backlog, Blocked, Cancelled, Completed, Failed, InProgress, OnHold, Ready,
            Rejected, UnderReview,
        };
        match self {
            Backlog => &[Ready, InProgress, Cancelled, OnHold],
            Ready => &[InProgress, Cancelled, OnHold],
            InProgress => &[Completed, Failed, Blocked, OnHold, Cancelled, UnderReview],
            Blocked => &[InProgress, Cancelled, OnHold],
            OnHold => &[InProgress, Ready, Cancelled],
            UnderReview => &[Approved, Rejected, InProgress, Cancelled],
            Approved => &[Completed, InProgress],
            Rejected => &[InProgress, Cancelled],
            Completed => &[InProgress],
            Failed => &[InProgress, Cancelled],
            Cancelled => &[Backlog, InProgress],
        }
    }

    /// Whether a write from this status to `to` is legal.
    pub fn can_transition_to(&self, to: Status) -> bool {
        *self == to || self.allowed_transitions().contains(&to)
    }

    /// Terminal states require explicit reopening to make forward progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether an item in this status unblocks items depending on it.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::Approved)
    }
}

/// Work item priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

// --- Work item ---

fn default_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// The unit of planning. The `vector` field is derived from title and
/// description by the storage core and is excluded from file renderings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub item_type: ItemType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_hours: Option<f64>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub autonomous_executable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default = "default_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vector: Vec<f32>,
}

impl WorkItem {
    /// Text fed to the embedding provider.
    pub fn embedding_input(&self) -> String {
        format!("{} {}", self.title, self.description)
    }
}

/// Input for creating a work item. Ids and timestamps are assigned by the
/// storage core when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemDraft {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub item_id: Option<String>,
    pub item_type: ItemType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub actual_hours: Option<f64>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub autonomous_executable: bool,
    #[serde(default)]
    pub execution_instructions: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Keeps the outer layer of an `Option<Option<_>>` field: a present key
/// (including an explicit `null`) deserializes to `Some(inner)`, a missing
/// key falls back to the struct default of `None`.
fn double_option<'de, T, D>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Partial update for a work item. Nullable fields use `Option<Option<_>>`:
/// a missing key leaves the field untouched, an explicit `null` clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkItemPatch {
    #[serde(deserialize_with = "double_option")]
    pub item_id: Option<Option<String>>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    #[serde(deserialize_with = "double_option")]
    pub parent_id: Option<Option<String>>,
    pub dependencies: Option<Vec<String>>,
    #[serde(deserialize_with = "double_option")]
    pub assignee: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub acceptance_criteria: Option<Vec<String>>,
    #[serde(deserialize_with = "double_option")]
    pub estimated_hours: Option<Option<f64>>,
    #[serde(deserialize_with = "double_option")]
    pub actual_hours: Option<Option<f64>>,
    pub progress: Option<f64>,
    pub autonomous_executable: Option<bool>,
    #[serde(deserialize_with = "double_option")]
    pub execution_instructions: Option<Option<String>>,
    #[serde(deserialize_with = "double_option")]
    pub metadata: Option<Option<serde_json::Value>>,
}

impl WorkItemPatch {
    /// Whether the patch changes anything at all.
    pub fn is_empty(&self) -> bool {
        self.item_id.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.parent_id.is_none()
            && self.dependencies.is_none()
            && self.assignee.is_none()
            && self.tags.is_none()
            && self.acceptance_criteria.is_none()
            && self.estimated_hours.is_none()
            && self.actual_hours.is_none()
            && self.progress.is_none()
            && self.autonomous_executable.is_none()
            && self.execution_instructions.is_none()
            && self.metadata.is_none()
    }
}

// --- Execution ---

/// How the orchestrator orders the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    DependencyBased,
    Parallel,
    Sequential,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DependencyBased => "dependency_based",
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dependency_based" => Some(Self::DependencyBased),
            "parallel" => Some(Self::Parallel),
            "sequential" => Some(Self::Sequential),
            _ => None,
        }
    }
}

/// Lifecycle of one execution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Validating,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Validating => "validating",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "validating" => Some(Self::Validating),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Severity of an execution log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One line in an execution's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// An artifact produced during an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Set when the producing execution was rolled back.
    #[serde(default)]
    pub superseded: bool,
}

/// Outcome of one validation check run before or during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationOutcome {
    Passed,
    Failed,
    Warning,
}

impl ValidationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub check: String,
    pub outcome: ValidationOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One run of a work-item execution. Owned exclusively by the orchestrator;
/// the storage core persists it but never mutates its content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub work_item_id: String,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub plan: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_context: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(default)]
    pub rollback_requested: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_results: Vec<ValidationCheck>,
}

// --- Sync ---

/// Which way a tracked file/work-item pair may flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    Bidirectional,
    FileToDb,
    DbToFile,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bidirectional => "bidirectional",
            Self::FileToDb => "file_to_db",
            Self::DbToFile => "db_to_file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bidirectional" => Some(Self::Bidirectional),
            "file_to_db" => Some(Self::FileToDb),
            "db_to_file" => Some(Self::DbToFile),
            _ => None,
        }
    }
}

/// How diverging file and DB representations are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    FileWins,
    DbWins,
    #[default]
    NewestWins,
    AutoMerge,
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileWins => "file_wins",
            Self::DbWins => "db_wins",
            Self::NewestWins => "newest_wins",
            Self::AutoMerge => "auto_merge",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file_wins" => Some(Self::FileWins),
            "db_wins" => Some(Self::DbWins),
            "newest_wins" => Some(Self::NewestWins),
            "auto_merge" => Some(Self::AutoMerge),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Tracking entry for one reconciled file/work-item pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub file_path: String,
    pub work_item_id: String,
    /// SHA-256 hex digest of the last successfully synced file bytes.
    pub content_checksum: String,
    pub last_sync_at: DateTime<Utc>,
    pub direction: SyncDirection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_is_canonical_v4() {
        let id = new_id();
        assert!(is_canonical_uuid(&id));
        assert_eq!(id, id.to_lowercase());
    }

    #[test]
    fn canonical_uuid_rejects_malformed_input() {
        assert!(!is_canonical_uuid(""));
        assert!(!is_canonical_uuid("not-a-uuid"));
        assert!(!is_canonical_uuid("urn:uuid:550e8400-e29b-41d4-a716-446655440000"));
        // Valid v7 is not v4.
        assert!(!is_canonical_uuid("01890a5d-ac96-774b-bcce-b302099a8057"));
        assert!(is_canonical_uuid("550e8400-e29b-41d4-a716-446655440000"));
    }

    #[test]
    fn ranks_descend_one_level_per_type() {
        assert_eq!(ItemType::Initiative.rank(), 0);
        assert_eq!(ItemType::Task.rank(), 4);
        assert!(ItemType::Epic.is_valid_parent(ItemType::Initiative));
        assert!(ItemType::Task.is_valid_parent(ItemType::Story));
        assert!(!ItemType::Story.is_valid_parent(ItemType::Epic));
        assert!(!ItemType::Initiative.is_valid_parent(ItemType::Task));
    }

    #[test]
    fn status_serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&Status::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&Status::UnderReview).unwrap(),
            "\"under_review\""
        );
    }

    #[test]
    fn status_deserializes_legacy_aliases() {
        assert_eq!(
            serde_json::from_str::<Status>("\"not_started\"").unwrap(),
            Status::Backlog
        );
        assert_eq!(
            serde_json::from_str::<Status>("\"todo\"").unwrap(),
            Status::Backlog
        );
        assert_eq!(
            serde_json::from_str::<Status>("\"done\"").unwrap(),
            Status::Completed
        );
        assert_eq!(
            serde_json::from_str::<Status>("\"canceled\"").unwrap(),
            Status::Cancelled
        );
        assert!(serde_json::from_str::<Status>("\"bogus\"").is_err());
    }

    #[test]
    fn from_stored_maps_legacy_strings() {
        assert_eq!(Status::from_stored("open"), Some(Status::Backlog));
        assert_eq!(Status::from_stored("in_review"), Some(Status::UnderReview));
        assert_eq!(Status::from_stored("completed"), Some(Status::Completed));
        assert_eq!(Status::from_stored("nonsense"), None);
    }

    #[test]
    fn transition_graph_matches_state_machine() {
        assert!(Status::Backlog.can_transition_to(Status::Ready));
        assert!(Status::Backlog.can_transition_to(Status::InProgress));
        assert!(!Status::Backlog.can_transition_to(Status::Completed));
        assert!(Status::InProgress.can_transition_to(Status::UnderReview));
        assert!(Status::UnderReview.can_transition_to(Status::Approved));
        assert!(Status::Approved.can_transition_to(Status::Completed));
        assert!(!Status::Ready.can_transition_to(Status::Blocked));
        // Reopening terminal states is permitted.
        assert!(Status::Completed.can_transition_to(Status::InProgress));
        assert!(Status::Cancelled.can_transition_to(Status::Backlog));
        assert!(!Status::Completed.can_transition_to(Status::Cancelled));
    }

    #[test]
    fn same_state_writes_are_allowed() {
        for status in [
            Status::Backlog,
            Status::InProgress,
            Status::Completed,
            Status::Cancelled,
        ] {
            assert!(status.can_transition_to(status));
        }
    }

    #[test]
    fn terminal_and_dependency_classification() {
        assert!(Status::Completed.is_terminal());
        assert!(Status::Cancelled.is_terminal());
        assert!(!Status::Failed.is_terminal());
        assert!(Status::Completed.satisfies_dependency());
        assert!(Status::Approved.satisfies_dependency());
        assert!(!Status::InProgress.satisfies_dependency());
    }

    #[test]
    fn priority_default_is_medium() {
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn execution_mode_default_is_dependency_based() {
        assert_eq!(ExecutionMode::default(), ExecutionMode::DependencyBased);
    }

    #[test]
    fn execution_status_terminal_states() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
    }

    #[test]
    fn patch_null_clears_missing_leaves_untouched() {
        let patch: WorkItemPatch =
            serde_json::from_str(r#"{"assignee": null, "title": "New title"}"#).unwrap();
        assert_eq!(patch.assignee, Some(None));
        assert_eq!(patch.title.as_deref(), Some("New title"));
        assert!(patch.parent_id.is_none());
        assert!(!patch.is_empty());

        let empty: WorkItemPatch = serde_json::from_str("{}").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn work_item_round_trips_through_json() {
        let item = WorkItem {
            id: new_id(),
            item_id: Some("AUTH-1".to_string()),
            item_type: ItemType::Task,
            title: "Implement login".to_string(),
            description: "JWT-based auth".to_string(),
            status: Status::Backlog,
            priority: Priority::High,
            parent_id: None,
            dependencies: vec![new_id()],
            assignee: Some("dev".to_string()),
            tags: vec!["auth".to_string()],
            acceptance_criteria: vec!["tokens expire".to_string()],
            estimated_hours: Some(4.0),
            actual_hours: None,
            progress: 0.0,
            autonomous_executable: true,
            execution_instructions: Some("implement per criteria".to_string()),
            metadata: Some(serde_json::json!({"sprint": 3})),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            vector: vec![0.1, 0.2],
        };

        let json = serde_json::to_string(&item).unwrap();
        let back: WorkItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, item.id);
        assert_eq!(back.item_type, item.item_type);
        assert_eq!(back.dependencies, item.dependencies);
        assert_eq!(back.metadata, item.metadata);
        assert_eq!(back.vector, item.vector);
    }

    #[test]
    fn conflict_strategy_parses_all_variants() {
        for s in ["file_wins", "db_wins", "newest_wins", "auto_merge", "manual"] {
            let parsed = ConflictStrategy::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!(ConflictStrategy::parse("coin_flip").is_none());
    }
}
