pub mod config;
pub mod error;
pub mod formats;
pub mod types;
pub mod validate;

pub use config::{Config, ConfigError, VectorMetric};
pub use error::ErrorCode;
pub use formats::{
    checksum, parse_work_item, render_work_item, slugify, sync_state_file_name, task_file_name,
    FileFormat, FormatError,
};
pub use types::{
    is_canonical_uuid, new_id, ArtifactRef, ConflictStrategy, ExecutionLogEntry, ExecutionMode,
    ExecutionRecord, ExecutionStatus, ItemType, LogLevel, Priority, Status, SyncDirection,
    SyncState, ValidationCheck, ValidationOutcome, WorkItem, WorkItemDraft, WorkItemPatch,
};
pub use validate::{validate_work_item, ValidationError};
