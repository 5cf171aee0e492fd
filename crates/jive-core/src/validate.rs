//! Field-level validation for work items.
//!
//! These checks guard every create and update before anything touches the
//! store. Structural checks that need other rows (parent rank, dependency
//! cycles) live in the engine; everything here is local to one item.

use crate::types::{is_canonical_uuid, WorkItem};
use thiserror::Error;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 5000;
pub const MAX_TAGS: usize = 10;
pub const MAX_ACCEPTANCE_CRITERIA: usize = 15;
pub const MAX_CRITERION_LEN: usize = 2000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("title must be 1..={MAX_TITLE_LEN} characters, got {0}")]
    TitleLength(usize),
    #[error("description must be at most {MAX_DESCRIPTION_LEN} characters, got {0}")]
    DescriptionLength(usize),
    #[error("id is not a canonical UUIDv4: {0}")]
    InvalidId(String),
    #[error("parent_id is not a canonical UUIDv4: {0}")]
    InvalidParentId(String),
    #[error("dependency is not a canonical UUIDv4: {0}")]
    InvalidDependencyId(String),
    #[error("work item cannot depend on itself")]
    SelfDependency,
    #[error("at most {MAX_TAGS} tags allowed, got {0}")]
    TooManyTags(usize),
    #[error("duplicate tag: {0}")]
    DuplicateTag(String),
    #[error("at most {MAX_ACCEPTANCE_CRITERIA} acceptance criteria allowed, got {0}")]
    TooManyCriteria(usize),
    #[error("acceptance criterion {index} exceeds {MAX_CRITERION_LEN} characters")]
    CriterionLength { index: usize },
    #[error("{field} must be non-negative, got {value}")]
    NegativeHours { field: &'static str, value: f64 },
    #[error("progress must be within [0, 1], got {0}")]
    ProgressRange(f64),
    #[error("autonomous_executable requires non-empty execution_instructions")]
    MissingExecutionInstructions,
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Validate a fully assembled work item. Character counts use Unicode
/// scalar values, not bytes.
pub fn validate_work_item(item: &WorkItem) -> Result<()> {
    if !is_canonical_uuid(&item.id) {
        return Err(ValidationError::InvalidId(item.id.clone()));
    }

    let title_len = item.title.chars().count();
    if title_len == 0 || title_len > MAX_TITLE_LEN || item.title.trim().is_empty() {
        return Err(ValidationError::TitleLength(title_len));
    }

    let description_len = item.description.chars().count();
    if description_len > MAX_DESCRIPTION_LEN {
        return Err(ValidationError::DescriptionLength(description_len));
    }

    if let Some(parent_id) = &item.parent_id {
        if !is_canonical_uuid(parent_id) {
            return Err(ValidationError::InvalidParentId(parent_id.clone()));
        }
    }

    for dep in &item.dependencies {
        if !is_canonical_uuid(dep) {
            return Err(ValidationError::InvalidDependencyId(dep.clone()));
        }
        if *dep == item.id {
            return Err(ValidationError::SelfDependency);
        }
    }

    if item.tags.len() > MAX_TAGS {
        return Err(ValidationError::TooManyTags(item.tags.len()));
    }
    let mut seen = std::collections::HashSet::new();
    for tag in &item.tags {
        if !seen.insert(tag.as_str()) {
            return Err(ValidationError::DuplicateTag(tag.clone()));
        }
    }

    if item.acceptance_criteria.len() > MAX_ACCEPTANCE_CRITERIA {
        return Err(ValidationError::TooManyCriteria(
            item.acceptance_criteria.len(),
        ));
    }
    for (index, criterion) in item.acceptance_criteria.iter().enumerate() {
        if criterion.chars().count() > MAX_CRITERION_LEN {
            return Err(ValidationError::CriterionLength { index });
        }
    }

    if let Some(hours) = item.estimated_hours {
        if hours < 0.0 || !hours.is_finite() {
            return Err(ValidationError::NegativeHours {
                field: "estimated_hours",
                value: hours,
            });
        }
    }
    if let Some(hours) = item.actual_hours {
        if hours < 0.0 || !hours.is_finite() {
            return Err(ValidationError::NegativeHours {
                field: "actual_hours",
                value: hours,
            });
        }
    }

    if !(0.0..=1.0).contains(&item.progress) || item.progress.is_nan() {
        return Err(ValidationError::ProgressRange(item.progress));
    }

    if item.autonomous_executable
        && item
            .execution_instructions
            .as_deref()
            .map_or(true, |s| s.trim().is_empty())
    {
        return Err(ValidationError::MissingExecutionInstructions);
    }

    Ok(())
}
