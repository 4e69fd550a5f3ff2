//! The build graph: operations wrapping external commands, and the
//! persisted results of their most recent executions.

use crate::fs::{FileId, Timestamp};
use rustc_hash::FxHashMap;
use std::path::PathBuf;

/// Stable external identifier for a build operation, assigned by whatever
/// generates the graph.  Unlike FileId these are not dense.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct OperationId(u32);

impl OperationId {
    pub fn from_raw(raw: u32) -> OperationId {
        OperationId(raw)
    }
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One external command: what to run and where.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandInfo {
    pub working_directory: PathBuf,
    pub executable: PathBuf,
    pub arguments: String,
}

/// One build operation: a command plus its declared file accesses and its
/// position in the dependency graph.  Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationInfo {
    pub id: OperationId,
    pub title: String,
    pub command: CommandInfo,
    /// Files the operation's author claims it reads, known before execution.
    pub declared_input: Vec<FileId>,
    /// Files the operation's author claims it writes, known before execution.
    pub declared_output: Vec<FileId>,
    /// Extra read grants for the sandbox beyond the declared sets.
    pub read_access: Vec<FileId>,
    /// Extra write grants for the sandbox beyond the declared sets.
    pub write_access: Vec<FileId>,
    /// Operations that must not start until this one finishes.
    pub children: Vec<OperationId>,
    /// Number of distinct operations listing this one as a child; the
    /// synchronization counter for execution ordering.
    pub dependency_count: u32,
}

/// The set of all operations plus the root set.  Built once upstream and
/// consumed read-only by the engine, which copies the dependency counters
/// into scratch state so a graph can be evaluated repeatedly.
#[derive(Debug)]
pub struct OperationGraph {
    pub roots: Vec<OperationId>,
    operations: FxHashMap<OperationId, OperationInfo>,
}

impl OperationGraph {
    pub fn new(roots: Vec<OperationId>, operations: Vec<OperationInfo>) -> OperationGraph {
        let operations = operations.into_iter().map(|op| (op.id, op)).collect();
        OperationGraph { roots, operations }
    }

    pub fn get(&self, id: OperationId) -> Option<&OperationInfo> {
        self.operations.get(&id)
    }

    pub fn operations(&self) -> impl Iterator<Item = &OperationInfo> {
        self.operations.values()
    }

    /// Operation ids in ascending order, for deterministic traversal.
    pub fn sorted_ids(&self) -> Vec<OperationId> {
        let mut ids: Vec<OperationId> = self.operations.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// The outcome of an operation's most recent execution.  Created or
/// overwritten only when the operation actually runs.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub was_successful_run: bool,
    pub evaluate_time: Timestamp,
    /// Files the sandbox recorded the process reading, merged with the
    /// declared inputs; known only after execution.
    pub observed_input: Vec<FileId>,
    /// Files the sandbox recorded the process writing, merged with the
    /// declared outputs.
    pub observed_output: Vec<FileId>,
}

/// All persisted operation results, loaded before an evaluation pass and
/// saved once after it settles.
#[derive(Debug, Default)]
pub struct OperationResults {
    results: FxHashMap<OperationId, OperationResult>,
}

impl OperationResults {
    pub fn get(&self, id: OperationId) -> Option<&OperationResult> {
        self.results.get(&id)
    }

    pub fn set(&mut self, id: OperationId, result: OperationResult) {
        self.results.insert(id, result);
    }

    pub fn iter(&self) -> impl Iterator<Item = (OperationId, &OperationResult)> {
        self.results.iter().map(|(&id, result)| (id, result))
    }

    /// Result ids in ascending order, for deterministic serialization.
    pub fn sorted_ids(&self) -> Vec<OperationId> {
        let mut ids: Vec<OperationId> = self.results.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(id: u32, children: Vec<u32>, dependency_count: u32) -> OperationInfo {
        OperationInfo {
            id: OperationId::from_raw(id),
            title: format!("op{}", id),
            command: CommandInfo {
                working_directory: PathBuf::from("/work"),
                executable: PathBuf::from("/bin/true"),
                arguments: String::new(),
            },
            declared_input: Vec::new(),
            declared_output: Vec::new(),
            read_access: Vec::new(),
            write_access: Vec::new(),
            children: children.into_iter().map(OperationId::from_raw).collect(),
            dependency_count,
        }
    }

    #[test]
    fn lookup_by_id() {
        let graph = OperationGraph::new(
            vec![OperationId::from_raw(1)],
            vec![op(1, vec![2], 0), op(2, vec![], 1)],
        );
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.get(OperationId::from_raw(1)).unwrap().title, "op1");
        assert!(graph.get(OperationId::from_raw(3)).is_none());
    }

    #[test]
    fn sorted_ids_are_ascending() {
        let graph = OperationGraph::new(
            vec![OperationId::from_raw(5)],
            vec![op(5, vec![], 0), op(2, vec![], 0), op(9, vec![], 0)],
        );
        assert_eq!(
            graph.sorted_ids(),
            vec![
                OperationId::from_raw(2),
                OperationId::from_raw(5),
                OperationId::from_raw(9)
            ]
        );
    }

    #[test]
    fn results_replace_prior_entries() {
        let mut results = OperationResults::default();
        let id = OperationId::from_raw(1);
        results.set(
            id,
            OperationResult {
                was_successful_run: false,
                evaluate_time: Timestamp::from_ticks(10),
                observed_input: Vec::new(),
                observed_output: Vec::new(),
            },
        );
        results.set(
            id,
            OperationResult {
                was_successful_run: true,
                evaluate_time: Timestamp::from_ticks(20),
                observed_input: Vec::new(),
                observed_output: Vec::new(),
            },
        );
        assert_eq!(results.len(), 1);
        let result = results.get(id).unwrap();
        assert!(result.was_successful_run);
        assert_eq!(result.evaluate_time, Timestamp::from_ticks(20));
    }
}
