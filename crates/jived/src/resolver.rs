//! Identifier resolution.
//!
//! Tools accept any reasonable reference to a work item: a canonical UUID,
//! an exact title, or free text ranked by hybrid search. The resolver maps
//! the input to a canonical id or reports the candidates it considered.

use crate::search::SearchMode;
use crate::storage::ListFilter;
use crate::store::{Result, WorkItemStore};
use jive_core::is_canonical_uuid;
use serde::Serialize;
use std::sync::Arc;

/// Search hits below this score are never considered matches.
const SEARCH_SCORE_CUTOFF: f64 = 0.5;
/// The top hit must beat the runner-up by at least this margin.
const SEARCH_SCORE_MARGIN: f64 = 0.15;
const SEARCH_CANDIDATE_LIMIT: usize = 5;

/// How an identifier was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Uuid,
    Title,
    Search,
    None,
}

impl MatchedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uuid => "uuid",
            Self::Title => "title",
            Self::Search => "search",
            Self::None => "none",
        }
    }
}

/// A near-miss surfaced when resolution is ambiguous.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub id: String,
    pub title: String,
    pub score: f64,
}

/// Full resolution outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ResolveDetail {
    pub matched_by: MatchedBy,
    pub resolved_id: Option<String>,
    pub candidates: Vec<Candidate>,
}

impl ResolveDetail {
    fn none() -> Self {
        Self {
            matched_by: MatchedBy::None,
            resolved_id: None,
            candidates: Vec::new(),
        }
    }
}

pub struct Resolver {
    store: Arc<WorkItemStore>,
}

impl Resolver {
    pub fn new(store: Arc<WorkItemStore>) -> Self {
        Self { store }
    }

    /// Resolve an identifier to a canonical work-item id, or None.
    /// Malformed input never errors.
    pub async fn resolve(&self, identifier: &str) -> Result<Option<String>> {
        Ok(self.resolve_detail(identifier).await?.resolved_id)
    }

    /// Resolve with diagnostics: how the match was made and which
    /// candidates were in play when it was not.
    pub async fn resolve_detail(&self, identifier: &str) -> Result<ResolveDetail> {
        let trimmed = identifier.trim();
        if trimmed.is_empty() || !trimmed.chars().any(char::is_alphanumeric) {
            return Ok(ResolveDetail::none());
        }

        // A well-formed UUID is authoritative: it either exists or the
        // reference is dead; titles are never consulted for it.
        let lowered = trimmed.to_lowercase();
        if is_canonical_uuid(&lowered) {
            return Ok(match self.store.get_work_item(&lowered).await? {
                Some(item) => ResolveDetail {
                    matched_by: MatchedBy::Uuid,
                    resolved_id: Some(item.id),
                    candidates: Vec::new(),
                },
                None => ResolveDetail::none(),
            });
        }

        let title_hits = self.store.storage().find_by_title(trimmed).await?;
        if title_hits.len() == 1 {
            return Ok(ResolveDetail {
                matched_by: MatchedBy::Title,
                resolved_id: Some(title_hits[0].id.clone()),
                candidates: Vec::new(),
            });
        }

        let response = self
            .store
            .search_work_items(
                trimmed,
                SearchMode::Hybrid,
                &ListFilter::default(),
                SEARCH_CANDIDATE_LIMIT,
            )
            .await?;

        let candidates: Vec<Candidate> = response
            .hits
            .iter()
            .filter(|hit| hit.score >= SEARCH_SCORE_CUTOFF)
            .map(|hit| Candidate {
                id: hit.item.id.clone(),
                title: hit.item.title.clone(),
                score: hit.score,
            })
            .collect();

        if candidates.is_empty() {
            return Ok(ResolveDetail::none());
        }

        let top = &candidates[0];
        let decisive = match candidates.get(1) {
            Some(second) => top.score - second.score >= SEARCH_SCORE_MARGIN,
            None => true,
        };

        if decisive {
            Ok(ResolveDetail {
                matched_by: MatchedBy::Search,
                resolved_id: Some(top.id.clone()),
                candidates,
            })
        } else {
            Ok(ResolveDetail {
                matched_by: MatchedBy::None,
                resolved_id: None,
                candidates,
            })
        }
    }
}
