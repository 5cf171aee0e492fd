//! Hierarchy and dependency engine.
//!
//! Enforces the five-level tree, manages the dependency DAG, detects
//! cycles with three-colour DFS, and rolls progress up the parent chain.

use crate::storage::{ListFilter, Storage, StorageError};
use chrono::Utc;
use jive_core::WorkItem;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

/// Progress updates below this delta are considered noise and skipped.
const PROGRESS_EPSILON: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("work item not found: {0}")]
    NotFound(String),
    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, HierarchyError>;

/// A dangling reference found during validation.
#[derive(Debug, Clone, Serialize)]
pub struct MissingRef {
    pub from: String,
    pub missing: String,
}

/// A parent/child pair whose types do not differ by exactly one rank.
#[derive(Debug, Clone, Serialize)]
pub struct RankViolation {
    pub child: String,
    pub child_type: String,
    pub parent: String,
    pub parent_type: String,
}

/// An edge whose removal is suggested to restore acyclicity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeRemoval {
    pub from: String,
    pub to: String,
}

/// Outcome of a dependency validation sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub missing: Vec<MissingRef>,
    pub cycles: Vec<Vec<String>>,
    pub rank_violations: Vec<RankViolation>,
    pub suggested_removals: Vec<EdgeRemoval>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.cycles.is_empty() && self.rank_violations.is_empty()
    }
}

/// The hierarchy engine operates directly on stored rows; writers go
/// through the per-item locks of the storage layer.
pub struct HierarchyEngine {
    storage: Arc<Storage>,
}

impl HierarchyEngine {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    async fn require(&self, id: &str) -> Result<WorkItem> {
        self.storage
            .get_work_item(id)
            .await?
            .ok_or_else(|| HierarchyError::NotFound(id.to_string()))
    }

    /// Children of a work item; `recursive` walks the whole subtree
    /// breadth-first (the root itself is not included).
    pub async fn get_children(&self, id: &str, recursive: bool) -> Result<Vec<WorkItem>> {
        self.require(id).await?;

        let mut result = Vec::new();
        let mut queue = VecDeque::from([id.to_string()]);
        let mut seen = HashSet::new();

        while let Some(current) = queue.pop_front() {
            let children = self.storage.list_children(&current).await?;
            for child in children {
                if seen.insert(child.id.clone()) {
                    if recursive {
                        queue.push_back(child.id.clone());
                    }
                    result.push(child);
                }
            }
            if !recursive {
                break;
            }
        }
        Ok(result)
    }

    /// Ancestors of a work item, nearest parent first.
    pub async fn get_parent_chain(&self, id: &str) -> Result<Vec<WorkItem>> {
        let mut current = self.require(id).await?;
        let mut chain = Vec::new();
        let mut seen = HashSet::from([current.id.clone()]);

        while let Some(parent_id) = current.parent_id.clone() {
            if !seen.insert(parent_id.clone()) {
                // The rank invariant rules this out; refuse to loop forever
                // on corrupted data.
                return Err(HierarchyError::Invariant(format!(
                    "parent chain of {id} revisits {parent_id}"
                )));
            }
            let parent = self.require(&parent_id).await?;
            chain.push(parent.clone());
            current = parent;
        }
        Ok(chain)
    }

    /// Dependencies of a work item. `transitive` follows the DAG depth-first
    /// with a visited set; `only_blocking` keeps items whose status does not
    /// yet satisfy dependents.
    pub async fn get_dependencies(
        &self,
        id: &str,
        transitive: bool,
        only_blocking: bool,
    ) -> Result<Vec<WorkItem>> {
        let root = self.require(id).await?;

        let mut result = Vec::new();
        let mut visited: HashSet<String> = HashSet::from([root.id.clone()]);
        let mut stack: Vec<String> = root.dependencies.clone();

        while let Some(dep_id) = stack.pop() {
            if !visited.insert(dep_id.clone()) {
                continue;
            }
            let Some(dep) = self.storage.get_work_item(&dep_id).await? else {
                // Dangling references are reported by validation, not here.
                continue;
            };
            if transitive {
                stack.extend(dep.dependencies.iter().cloned());
            }
            if !only_blocking || !dep.status.satisfies_dependency() {
                result.push(dep);
            }
        }
        Ok(result)
    }

    /// Add a dependency edge: `from` depends on `to`. Rejects unknown ids,
    /// self-references, and anything that would close a cycle.
    pub async fn add_dependency(&self, from: &str, to: &str) -> Result<WorkItem> {
        if from == to {
            return Err(HierarchyError::Invariant(
                "work item cannot depend on itself".to_string(),
            ));
        }

        let _guard = self.storage.item_write_guard(from).await;
        let mut item = self.require(from).await?;
        self.require(to).await?;

        if item.dependencies.iter().any(|d| d == to) {
            return Ok(item);
        }

        if let Some(path) = self.dependency_cycle_path(from, to).await? {
            return Err(HierarchyError::Cycle { path });
        }

        item.dependencies.push(to.to_string());
        item.updated_at = Utc::now().max(item.updated_at);
        self.storage.update_work_item(&item).await?;
        Ok(item)
    }

    /// Remove a dependency edge. Returns whether the edge existed.
    pub async fn remove_dependency(&self, from: &str, to: &str) -> Result<bool> {
        let _guard = self.storage.item_write_guard(from).await;
        let mut item = self.require(from).await?;

        let before = item.dependencies.len();
        item.dependencies.retain(|d| d != to);
        if item.dependencies.len() == before {
            return Ok(false);
        }

        item.updated_at = Utc::now().max(item.updated_at);
        self.storage.update_work_item(&item).await?;
        Ok(true)
    }

    /// Path that would close a cycle if `from` were to depend on `to`:
    /// a chain `to -> ... -> from` already exists. The reported path starts
    /// and ends with `from` for the caller's diagnostics.
    pub(crate) async fn dependency_cycle_path(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Option<Vec<String>>> {
        // DFS from `to` along stored dependency edges, looking for `from`.
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<Vec<String>> = vec![vec![to.to_string()]];

        while let Some(path) = stack.pop() {
            let current = path.last().expect("path never empty").clone();
            if current == from {
                // path is to -> ... -> from; the new edge closes
                // from -> to -> ... -> from.
                let mut cycle = Vec::with_capacity(path.len() + 1);
                cycle.push(from.to_string());
                cycle.extend(path.iter().take(path.len() - 1).cloned());
                cycle.push(from.to_string());
                return Ok(Some(cycle));
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(item) = self.storage.get_work_item(&current).await? {
                for dep in item.dependencies {
                    let mut next = path.clone();
                    next.push(dep);
                    stack.push(next);
                }
            }
        }
        Ok(None)
    }

    /// Validate dependency structure over the given ids (or the whole
    /// store). Reports missing references, cycles with full paths, rank
    /// violations, and optionally a greedy set of edge removals that would
    /// restore acyclicity.
    pub async fn validate_dependencies(
        &self,
        ids: Option<&[String]>,
        check_cycles: bool,
        check_missing: bool,
        suggest_fixes: bool,
    ) -> Result<ValidationReport> {
        let items = match ids {
            Some(ids) => self.storage.get_work_items(ids).await?,
            None => self.storage.list_work_items(&ListFilter::default()).await?,
        };
        let by_id: HashMap<String, &WorkItem> =
            items.iter().map(|item| (item.id.clone(), item)).collect();

        let mut report = ValidationReport::default();

        if check_missing {
            for item in &items {
                for dep in &item.dependencies {
                    if !by_id.contains_key(dep)
                        && self.storage.get_work_item(dep).await?.is_none()
                    {
                        report.missing.push(MissingRef {
                            from: item.id.clone(),
                            missing: dep.clone(),
                        });
                    }
                }
                if let Some(parent_id) = &item.parent_id {
                    let parent = match by_id.get(parent_id) {
                        Some(parent) => Some((*parent).clone()),
                        None => self.storage.get_work_item(parent_id).await?,
                    };
                    match parent {
                        None => report.missing.push(MissingRef {
                            from: item.id.clone(),
                            missing: parent_id.clone(),
                        }),
                        Some(parent) => {
                            if !item.item_type.is_valid_parent(parent.item_type) {
                                report.rank_violations.push(RankViolation {
                                    child: item.id.clone(),
                                    child_type: item.item_type.as_str().to_string(),
                                    parent: parent.id.clone(),
                                    parent_type: parent.item_type.as_str().to_string(),
                                });
                            }
                        }
                    }
                }
            }
        }

        if check_cycles {
            let mut graph: HashMap<String, Vec<String>> = HashMap::new();
            for item in &items {
                graph.insert(
                    item.id.clone(),
                    item.dependencies
                        .iter()
                        .filter(|d| by_id.contains_key(*d))
                        .cloned()
                        .collect(),
                );
            }
            report.cycles = find_cycles(&graph);

            if suggest_fixes && !report.cycles.is_empty() {
                report.suggested_removals = suggest_edge_removals(&graph);
            }
        }

        Ok(report)
    }

    /// Recalculate derived progress bottom-up from `root` (or across every
    /// tree when `root` is None). Returns the ids whose stored value
    /// changed. Running it twice is a no-op the second time.
    pub async fn recalculate_progress(&self, root: Option<&str>) -> Result<Vec<String>> {
        let scope: Vec<WorkItem> = match root {
            Some(id) => {
                let mut items = vec![self.require(id).await?];
                items.extend(self.get_children(id, true).await?);
                items
            }
            None => self.storage.list_work_items(&ListFilter::default()).await?,
        };

        let mut children_of: HashMap<String, Vec<String>> = HashMap::new();
        let mut stored: HashMap<String, f64> = HashMap::new();
        let in_scope: HashSet<String> = scope.iter().map(|i| i.id.clone()).collect();
        for item in &scope {
            stored.insert(item.id.clone(), item.progress);
            if let Some(parent_id) = &item.parent_id {
                if in_scope.contains(parent_id) {
                    children_of
                        .entry(parent_id.clone())
                        .or_default()
                        .push(item.id.clone());
                }
            }
        }

        // Post-order evaluation: a parent's progress is the mean of its
        // children's computed values; leaves keep their stored value.
        let mut computed: HashMap<String, f64> = HashMap::new();
        for item in &scope {
            compute_progress(&item.id, &children_of, &stored, &mut computed);
        }

        let mut updated = Vec::new();
        for item in &scope {
            let next = computed[&item.id];
            if (next - item.progress).abs() > PROGRESS_EPSILON {
                let _guard = self.storage.item_write_guard(&item.id).await;
                if let Some(mut fresh) = self.storage.get_work_item(&item.id).await? {
                    fresh.progress = next;
                    fresh.updated_at = Utc::now().max(fresh.updated_at);
                    self.storage.update_work_item(&fresh).await?;
                    updated.push(item.id.clone());
                }
            }
        }
        Ok(updated)
    }

    /// Recalculate the parent chain of one item after its progress changed.
    pub async fn rollup_from(&self, id: &str) -> Result<Vec<String>> {
        let chain = self.get_parent_chain(id).await?;
        let mut updated = Vec::new();
        // Walk upward so each parent sees fresh child values.
        for parent in chain {
            let children = self.storage.list_children(&parent.id).await?;
            if children.is_empty() {
                continue;
            }
            let mean =
                children.iter().map(|c| c.progress).sum::<f64>() / children.len() as f64;
            if (mean - parent.progress).abs() > PROGRESS_EPSILON {
                let _guard = self.storage.item_write_guard(&parent.id).await;
                if let Some(mut fresh) = self.storage.get_work_item(&parent.id).await? {
                    fresh.progress = mean;
                    fresh.updated_at = Utc::now().max(fresh.updated_at);
                    self.storage.update_work_item(&fresh).await?;
                    updated.push(parent.id.clone());
                }
            }
        }
        Ok(updated)
    }

    /// Items whose dependencies are all satisfied (status in the
    /// completed/approved set).
    pub async fn is_ready_to_run(&self, item: &WorkItem) -> Result<bool> {
        for dep_id in &item.dependencies {
            match self.storage.get_work_item(dep_id).await? {
                Some(dep) if dep.status.satisfies_dependency() => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

fn compute_progress(
    id: &str,
    children_of: &HashMap<String, Vec<String>>,
    stored: &HashMap<String, f64>,
    computed: &mut HashMap<String, f64>,
) -> f64 {
    if let Some(value) = computed.get(id) {
        return *value;
    }
    let value = match children_of.get(id) {
        Some(children) if !children.is_empty() => {
            let sum: f64 = children
                .iter()
                .map(|c| compute_progress(c, children_of, stored, computed))
                .sum();
            sum / children.len() as f64
        }
        _ => stored.get(id).copied().unwrap_or(0.0),
    };
    computed.insert(id.to_string(), value);
    value
}

#[derive(Clone, Copy, PartialEq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// Three-colour DFS over the dependency graph. A grey-to-grey edge closes a
/// cycle; the returned path runs from the re-encountered node around the
/// loop and back.
fn find_cycles(graph: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    let mut colour: HashMap<&str, Colour> =
        graph.keys().map(|k| (k.as_str(), Colour::White)).collect();
    let mut cycles = Vec::new();

    let mut nodes: Vec<&String> = graph.keys().collect();
    nodes.sort();

    for start in nodes {
        if colour[start.as_str()] != Colour::White {
            continue;
        }
        let mut path: Vec<&str> = Vec::new();
        visit(start, graph, &mut colour, &mut path, &mut cycles);
    }
    cycles
}

fn visit<'a>(
    node: &'a str,
    graph: &'a HashMap<String, Vec<String>>,
    colour: &mut HashMap<&'a str, Colour>,
    path: &mut Vec<&'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    colour.insert(node, Colour::Grey);
    path.push(node);

    if let Some(deps) = graph.get(node) {
        for dep in deps {
            match colour.get(dep.as_str()).copied() {
                Some(Colour::White) => visit(dep, graph, colour, path, cycles),
                Some(Colour::Grey) => {
                    // Cycle: slice the current path from the grey node.
                    if let Some(pos) = path.iter().position(|n| *n == dep.as_str()) {
                        let mut cycle: Vec<String> =
                            path[pos..].iter().map(|s| (*s).to_string()).collect();
                        cycle.push(dep.clone());
                        cycles.push(cycle);
                    }
                }
                _ => {}
            }
        }
    }

    path.pop();
    colour.insert(node, Colour::Black);
}

/// Greedy feedback-edge selection: repeatedly drop the edge appearing in
/// the most detected cycles until none remain.
fn suggest_edge_removals(graph: &HashMap<String, Vec<String>>) -> Vec<EdgeRemoval> {
    let mut graph = graph.clone();
    let mut removals = Vec::new();

    loop {
        let cycles = find_cycles(&graph);
        if cycles.is_empty() {
            break;
        }

        let mut edge_counts: HashMap<(String, String), usize> = HashMap::new();
        for cycle in &cycles {
            for pair in cycle.windows(2) {
                *edge_counts
                    .entry((pair[0].clone(), pair[1].clone()))
                    .or_insert(0) += 1;
            }
        }

        let Some(((from, to), _)) = edge_counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        else {
            break;
        };

        if let Some(deps) = graph.get_mut(&from) {
            deps.retain(|d| *d != to);
        }
        removals.push(EdgeRemoval { from, to });
    }
    removals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests_support::sample_item;
    use jive_core::{new_id, ItemType, Status};
    use tempfile::TempDir;

    struct TestHierarchy {
        engine: HierarchyEngine,
        storage: Arc<Storage>,
        _dir: TempDir,
    }

    async fn create_test_hierarchy() -> TestHierarchy {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(&dir.path().join("test.db")).await.unwrap());
        storage.migrate_embedded().await.unwrap();
        TestHierarchy {
            engine: HierarchyEngine::new(Arc::clone(&storage)),
            storage,
            _dir: dir,
        }
    }

    async fn insert_typed(th: &TestHierarchy, title: &str, item_type: ItemType) -> WorkItem {
        let mut item = sample_item(title);
        item.item_type = item_type;
        th.storage.insert_work_item(&item).await.unwrap();
        item
    }

    async fn insert_child(
        th: &TestHierarchy,
        title: &str,
        item_type: ItemType,
        parent: &WorkItem,
    ) -> WorkItem {
        let mut item = sample_item(title);
        item.item_type = item_type;
        item.parent_id = Some(parent.id.clone());
        th.storage.insert_work_item(&item).await.unwrap();
        item
    }

    #[tokio::test]
    async fn children_direct_and_recursive() {
        let th = create_test_hierarchy().await;
        let epic = insert_typed(&th, "epic", ItemType::Epic).await;
        let f1 = insert_child(&th, "f1", ItemType::Feature, &epic).await;
        let f2 = insert_child(&th, "f2", ItemType::Feature, &epic).await;
        let s1 = insert_child(&th, "s1", ItemType::Story, &f1).await;
        let s2 = insert_child(&th, "s2", ItemType::Story, &f1).await;

        let direct = th.engine.get_children(&epic.id, false).await.unwrap();
        let direct_ids: HashSet<String> = direct.into_iter().map(|i| i.id).collect();
        assert_eq!(direct_ids, HashSet::from([f1.id.clone(), f2.id.clone()]));

        let all = th.engine.get_children(&epic.id, true).await.unwrap();
        let all_ids: HashSet<String> = all.into_iter().map(|i| i.id).collect();
        assert_eq!(
            all_ids,
            HashSet::from([f1.id.clone(), f2.id, s1.id, s2.id])
        );
    }

    #[tokio::test]
    async fn parent_chain_nearest_first() {
        let th = create_test_hierarchy().await;
        let epic = insert_typed(&th, "epic", ItemType::Epic).await;
        let feature = insert_child(&th, "feature", ItemType::Feature, &epic).await;
        let story = insert_child(&th, "story", ItemType::Story, &feature).await;

        let chain = th.engine.get_parent_chain(&story.id).await.unwrap();
        let ids: Vec<String> = chain.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![feature.id, epic.id]);
    }

    #[tokio::test]
    async fn missing_root_is_not_found() {
        let th = create_test_hierarchy().await;
        let result = th.engine.get_children(&new_id(), false).await;
        assert!(matches!(result, Err(HierarchyError::NotFound(_))));
    }

    #[tokio::test]
    async fn add_dependency_rejects_cycles_with_path() {
        let th = create_test_hierarchy().await;
        let a = insert_typed(&th, "a", ItemType::Task).await;
        let b = insert_typed(&th, "b", ItemType::Task).await;
        let c = insert_typed(&th, "c", ItemType::Task).await;

        th.engine.add_dependency(&a.id, &b.id).await.unwrap();
        th.engine.add_dependency(&b.id, &c.id).await.unwrap();

        let err = th.engine.add_dependency(&c.id, &a.id).await.unwrap_err();
        match err {
            HierarchyError::Cycle { path } => {
                assert_eq!(path.first(), Some(&c.id));
                assert_eq!(path.last(), Some(&c.id));
                assert!(path.contains(&a.id));
                assert!(path.contains(&b.id));
            }
            other => panic!("expected cycle, got {other:?}"),
        }

        // Store unchanged after the rejection.
        let c_loaded = th.storage.get_work_item(&c.id).await.unwrap().unwrap();
        assert!(c_loaded.dependencies.is_empty());
    }

    #[tokio::test]
    async fn add_dependency_rejects_self_and_unknown() {
        let th = create_test_hierarchy().await;
        let a = insert_typed(&th, "a", ItemType::Task).await;

        assert!(matches!(
            th.engine.add_dependency(&a.id, &a.id).await,
            Err(HierarchyError::Invariant(_))
        ));
        assert!(matches!(
            th.engine.add_dependency(&a.id, &new_id()).await,
            Err(HierarchyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn add_dependency_is_idempotent() {
        let th = create_test_hierarchy().await;
        let a = insert_typed(&th, "a", ItemType::Task).await;
        let b = insert_typed(&th, "b", ItemType::Task).await;

        th.engine.add_dependency(&a.id, &b.id).await.unwrap();
        let item = th.engine.add_dependency(&a.id, &b.id).await.unwrap();
        assert_eq!(item.dependencies, vec![b.id]);
    }

    #[tokio::test]
    async fn remove_dependency_reports_presence() {
        let th = create_test_hierarchy().await;
        let a = insert_typed(&th, "a", ItemType::Task).await;
        let b = insert_typed(&th, "b", ItemType::Task).await;

        th.engine.add_dependency(&a.id, &b.id).await.unwrap();
        assert!(th.engine.remove_dependency(&a.id, &b.id).await.unwrap());
        assert!(!th.engine.remove_dependency(&a.id, &b.id).await.unwrap());
    }

    #[tokio::test]
    async fn transitive_dependencies_with_visited_set() {
        let th = create_test_hierarchy().await;
        let a = insert_typed(&th, "a", ItemType::Task).await;
        let b = insert_typed(&th, "b", ItemType::Task).await;
        let c = insert_typed(&th, "c", ItemType::Task).await;
        let d = insert_typed(&th, "d", ItemType::Task).await;

        // a -> b -> d and a -> c -> d; d must appear once.
        th.engine.add_dependency(&a.id, &b.id).await.unwrap();
        th.engine.add_dependency(&a.id, &c.id).await.unwrap();
        th.engine.add_dependency(&b.id, &d.id).await.unwrap();
        th.engine.add_dependency(&c.id, &d.id).await.unwrap();

        let direct = th.engine.get_dependencies(&a.id, false, false).await.unwrap();
        assert_eq!(direct.len(), 2);

        let transitive = th.engine.get_dependencies(&a.id, true, false).await.unwrap();
        let ids: HashSet<String> = transitive.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, HashSet::from([b.id, c.id, d.id.clone()]));
        assert_eq!(transitive.len(), 3);
    }

    #[tokio::test]
    async fn only_blocking_filters_satisfied_dependencies() {
        let th = create_test_hierarchy().await;
        let a = insert_typed(&th, "a", ItemType::Task).await;
        let mut done = sample_item("done");
        done.status = Status::Completed;
        th.storage.insert_work_item(&done).await.unwrap();
        let open = insert_typed(&th, "open", ItemType::Task).await;

        th.engine.add_dependency(&a.id, &done.id).await.unwrap();
        th.engine.add_dependency(&a.id, &open.id).await.unwrap();

        let blocking = th.engine.get_dependencies(&a.id, false, true).await.unwrap();
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].id, open.id);
    }

    #[tokio::test]
    async fn validation_reports_missing_and_rank_violations() {
        let th = create_test_hierarchy().await;
        let ghost = new_id();
        let mut item = sample_item("dangling");
        item.dependencies = vec![ghost.clone()];
        th.storage.insert_work_item(&item).await.unwrap();

        // Epic incorrectly parented on a feature.
        let feature = insert_typed(&th, "feature", ItemType::Feature).await;
        let mut epic = sample_item("misparented epic");
        epic.item_type = ItemType::Epic;
        epic.parent_id = Some(feature.id.clone());
        th.storage.insert_work_item(&epic).await.unwrap();

        let report = th
            .engine
            .validate_dependencies(None, true, true, false)
            .await
            .unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.missing[0].missing, ghost);
        assert_eq!(report.rank_violations.len(), 1);
        assert_eq!(report.rank_violations[0].child, epic.id);
    }

    #[tokio::test]
    async fn validation_suggests_edge_removals_for_cycles() {
        let th = create_test_hierarchy().await;
        let a = insert_typed(&th, "a", ItemType::Task).await;
        let b = insert_typed(&th, "b", ItemType::Task).await;

        // Force a cycle directly, bypassing the guarded path.
        let mut a_loaded = th.storage.get_work_item(&a.id).await.unwrap().unwrap();
        a_loaded.dependencies = vec![b.id.clone()];
        th.storage.update_work_item(&a_loaded).await.unwrap();
        let mut b_loaded = th.storage.get_work_item(&b.id).await.unwrap().unwrap();
        b_loaded.dependencies = vec![a.id.clone()];
        th.storage.update_work_item(&b_loaded).await.unwrap();

        let report = th
            .engine
            .validate_dependencies(None, true, true, true)
            .await
            .unwrap();
        assert_eq!(report.cycles.len(), 1);
        assert!(!report.suggested_removals.is_empty());

        // Applying the suggested removals restores acyclicity.
        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        graph.insert(a.id.clone(), vec![b.id.clone()]);
        graph.insert(b.id.clone(), vec![a.id.clone()]);
        for removal in &report.suggested_removals {
            if let Some(deps) = graph.get_mut(&removal.from) {
                deps.retain(|d| *d != removal.to);
            }
        }
        assert!(find_cycles(&graph).is_empty());
    }

    #[tokio::test]
    async fn progress_rollup_is_mean_of_children() {
        let th = create_test_hierarchy().await;
        let epic = insert_typed(&th, "epic", ItemType::Epic).await;
        let f1 = insert_child(&th, "f1", ItemType::Feature, &epic).await;
        let f2 = insert_child(&th, "f2", ItemType::Feature, &epic).await;

        let mut f1_loaded = th.storage.get_work_item(&f1.id).await.unwrap().unwrap();
        f1_loaded.progress = 1.0;
        th.storage.update_work_item(&f1_loaded).await.unwrap();
        let mut f2_loaded = th.storage.get_work_item(&f2.id).await.unwrap().unwrap();
        f2_loaded.progress = 0.5;
        th.storage.update_work_item(&f2_loaded).await.unwrap();

        let updated = th
            .engine
            .recalculate_progress(Some(&epic.id))
            .await
            .unwrap();
        assert_eq!(updated, vec![epic.id.clone()]);

        let loaded = th.storage.get_work_item(&epic.id).await.unwrap().unwrap();
        assert!((loaded.progress - 0.75).abs() < 1e-9);

        // Idempotent: a second run changes nothing.
        let updated = th
            .engine
            .recalculate_progress(Some(&epic.id))
            .await
            .unwrap();
        assert!(updated.is_empty());
    }

    #[tokio::test]
    async fn recalculate_all_matches_rooted_recalculation() {
        let th = create_test_hierarchy().await;
        let epic = insert_typed(&th, "epic", ItemType::Epic).await;
        let feature = insert_child(&th, "feature", ItemType::Feature, &epic).await;
        let s1 = insert_child(&th, "s1", ItemType::Story, &feature).await;
        let _s2 = insert_child(&th, "s2", ItemType::Story, &feature).await;

        let mut s1_loaded = th.storage.get_work_item(&s1.id).await.unwrap().unwrap();
        s1_loaded.progress = 1.0;
        th.storage.update_work_item(&s1_loaded).await.unwrap();

        th.engine.recalculate_progress(None).await.unwrap();
        let feature_loaded = th
            .storage
            .get_work_item(&feature.id)
            .await
            .unwrap()
            .unwrap();
        let epic_loaded = th.storage.get_work_item(&epic.id).await.unwrap().unwrap();
        assert!((feature_loaded.progress - 0.5).abs() < 1e-9);
        assert!((epic_loaded.progress - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rollup_from_updates_parent_chain() {
        let th = create_test_hierarchy().await;
        let epic = insert_typed(&th, "epic", ItemType::Epic).await;
        let feature = insert_child(&th, "feature", ItemType::Feature, &epic).await;
        let story = insert_child(&th, "story", ItemType::Story, &feature).await;

        let mut story_loaded = th.storage.get_work_item(&story.id).await.unwrap().unwrap();
        story_loaded.progress = 1.0;
        th.storage.update_work_item(&story_loaded).await.unwrap();

        let updated = th.engine.rollup_from(&story.id).await.unwrap();
        assert_eq!(updated.len(), 2);

        let feature_loaded = th
            .storage
            .get_work_item(&feature.id)
            .await
            .unwrap()
            .unwrap();
        assert!((feature_loaded.progress - 1.0).abs() < 1e-9);
    }

    #[test]
    fn find_cycles_reports_paths() {
        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        graph.insert("a".into(), vec!["b".into()]);
        graph.insert("b".into(), vec!["c".into()]);
        graph.insert("c".into(), vec!["a".into()]);
        graph.insert("d".into(), vec![]);

        let cycles = find_cycles(&graph);
        assert_eq!(cycles.len(), 1);
        let cycle = &cycles[0];
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn find_cycles_clean_graph_is_empty() {
        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        graph.insert("a".into(), vec!["b".into()]);
        graph.insert("b".into(), vec![]);
        assert!(find_cycles(&graph).is_empty());
    }
}
