//! The build evaluation engine: decides which operations are stale,
//! executes exactly those in dependency order, and updates the persisted
//! results.

use crate::fs::{FileId, FileSystemState, FsError, MTime, Timestamp};
use crate::graph::{OperationGraph, OperationId, OperationInfo, OperationResult, OperationResults};
use crate::progress::Progress;
use crate::sandbox::{Invocation, Sandbox, SandboxOutput};
use crate::task::Runner;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    /// Cycle, dangling id, or dependency-count underflow; the graph
    /// cannot be trusted, so nothing further is executed.
    #[error("operation graph corrupt: {0}")]
    GraphCorrupt(String),
    /// A command exited non-zero; the whole pass is aborted.
    #[error("{title}: command failed with exit code {exit_code}")]
    CommandExecutionFailed {
        title: String,
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    #[error(transparent)]
    Fs(#[from] FsError),
}

pub struct EvalOptions {
    /// How many stale operations may execute concurrently.
    pub parallelism: usize,
    /// Extra read grants added to every operation's sandbox.
    pub global_read_access: Vec<FileId>,
    /// Extra write grants added to every operation's sandbox.
    pub global_write_access: Vec<FileId>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            parallelism: 1,
            global_read_access: Vec::new(),
            global_write_access: Vec::new(),
        }
    }
}

/// Performs one full evaluation pass over an operation graph.
///
/// The graph is read-only; dependency counters are copied into scratch
/// state, so the same graph can be evaluated repeatedly.  Results are
/// updated in place as operations execute and are the caller's to save
/// once the pass settles, whether it succeeded or failed.
pub struct BuildEvaluateEngine<'a> {
    graph: &'a OperationGraph,
    results: &'a mut OperationResults,
    fs: &'a mut FileSystemState,
    sandbox: Arc<dyn Sandbox>,
    progress: &'a mut dyn Progress,
    options: EvalOptions,
}

impl<'a> BuildEvaluateEngine<'a> {
    pub fn new(
        graph: &'a OperationGraph,
        results: &'a mut OperationResults,
        fs: &'a mut FileSystemState,
        sandbox: Arc<dyn Sandbox>,
        progress: &'a mut dyn Progress,
        options: EvalOptions,
    ) -> Self {
        BuildEvaluateEngine {
            graph,
            results,
            fs,
            sandbox,
            progress,
            options,
        }
    }

    /// Run the pass.  Returns whether any operation actually executed.
    pub fn evaluate(&mut self) -> Result<bool, EvalError> {
        let graph = self.graph;
        self.progress.diagnostic("build evaluation start");
        if graph.is_empty() {
            self.progress.diagnostic("build evaluation end");
            return Ok(false);
        }

        for &root in &graph.roots {
            if graph.get(root).is_none() {
                return Err(EvalError::GraphCorrupt(format!(
                    "root operation {} not in graph",
                    root
                )));
            }
        }

        let mut counters: FxHashMap<OperationId, u32> = graph
            .operations()
            .map(|op| (op.id, op.dependency_count))
            .collect();

        self.prestat_graph_files()?;

        // Everything with no outstanding dependencies is immediately
        // eligible; the rest becomes eligible through counter decrements.
        let mut ready: VecDeque<OperationId> = graph
            .sorted_ids()
            .into_iter()
            .filter(|id| counters[id] == 0)
            .collect();
        let mut runner = Runner::new(self.options.parallelism);
        let mut completed = 0usize;
        let mut ran_any = false;

        loop {
            while runner.can_start_more() {
                let id = match ready.pop_front() {
                    Some(id) => id,
                    None => break,
                };
                // Invariant: ready only ever holds ids drawn from `counters`.
                let op = graph.get(id).unwrap();
                if self.check_operation_stale(op)? {
                    ran_any = true;
                    self.progress.high_priority(&op.title);
                    let invocation = self.make_invocation(op)?;
                    runner.start(op.id, self.sandbox.clone(), invocation);
                } else {
                    finish_operation(op, &mut counters, &mut ready, &mut completed)?;
                }
            }

            if runner.is_running() {
                let finished = runner.wait();
                let op = graph.get(finished.id).unwrap();
                self.record_execution(op, finished.output)?;
                finish_operation(op, &mut counters, &mut ready, &mut completed)?;
            } else if ready.is_empty() {
                break;
            }
        }

        if completed != graph.len() {
            return Err(EvalError::GraphCorrupt(
                "dependency cycle among operations".to_string(),
            ));
        }
        self.progress.diagnostic("build evaluation end");
        Ok(ran_any)
    }

    /// Warm the mtime cache for every file staleness analysis will look
    /// at, in parallel.
    fn prestat_graph_files(&mut self) -> Result<(), FsError> {
        let mut ids: Vec<FileId> = Vec::new();
        for op in self.graph.operations() {
            ids.extend_from_slice(&op.declared_input);
            ids.extend_from_slice(&op.declared_output);
            if let Some(prior) = self.results.get(op.id) {
                ids.extend_from_slice(&prior.observed_input);
                ids.extend_from_slice(&prior.observed_output);
            }
        }
        ids.sort();
        ids.dedup();
        self.fs.prestat(&ids)
    }

    /// Decide whether an operation must execute, against its previous
    /// result if any.  First matching rule wins.
    fn check_operation_stale(&mut self, op: &OperationInfo) -> Result<bool, EvalError> {
        self.progress.diagnostic(&format!(
            "check for previous operation invocation: {}",
            op.title
        ));

        let prior = match self.results.get(op.id) {
            Some(prior) if prior.was_successful_run => prior.clone(),
            _ => {
                self.progress
                    .info(&format!("no successful previous invocation: {}", op.title));
                return Ok(true);
            }
        };

        for &out in &op.declared_output {
            if let MTime::Missing = self.fs.stat(out)? {
                let path = self.fs.path(out)?;
                self.progress
                    .info(&format!("output target does not exist: {}", path.display()));
                return Ok(true);
            }
        }

        // Newest input over declared and previously observed inputs.  A
        // declared input that is missing always forces a run; an
        // observed-only file that has since vanished (e.g. a temporary)
        // is informational and cannot invalidate.
        let mut input_ids = op.declared_input.clone();
        input_ids.extend_from_slice(&prior.observed_input);
        input_ids.sort();
        input_ids.dedup();
        let mut max_input: Option<(Timestamp, PathBuf)> = None;
        for &id in &input_ids {
            match self.fs.stat(id)? {
                MTime::Missing => {
                    if op.declared_input.contains(&id) {
                        let path = self.fs.path(id)?;
                        self.progress
                            .info(&format!("input target does not exist: {}", path.display()));
                        return Ok(true);
                    }
                }
                MTime::Stamp(mtime) => {
                    let path = self.fs.path(id)?;
                    if extreme(&max_input, mtime, path, Ordering::Max) {
                        max_input = Some((mtime, path.to_owned()));
                    }
                }
            }
        }

        // Oldest output over declared and previously observed outputs;
        // missing declared outputs were handled above.
        let mut output_ids = op.declared_output.clone();
        output_ids.extend_from_slice(&prior.observed_output);
        output_ids.sort();
        output_ids.dedup();
        let mut min_output: Option<(Timestamp, PathBuf)> = None;
        for &id in &output_ids {
            if let MTime::Stamp(mtime) = self.fs.stat(id)? {
                let path = self.fs.path(id)?;
                if extreme(&min_output, mtime, path, Ordering::Min) {
                    min_output = Some((mtime, path.to_owned()));
                }
            }
        }

        if let (Some((in_time, in_path)), Some((out_time, out_path))) = (&max_input, &min_output) {
            if in_time > out_time {
                self.progress.info(&format!(
                    "input altered after target [{}] -> [{}]",
                    in_path.display(),
                    out_path.display()
                ));
                return Ok(true);
            }
        }

        // Catches inputs that are not the output of any tracked
        // operation, e.g. the invoked executable itself.
        if let Some((in_time, in_path)) = &max_input {
            if *in_time > prior.evaluate_time {
                self.progress.info(&format!(
                    "input altered after last evaluate [{}]",
                    in_path.display()
                ));
                return Ok(true);
            }
        }

        self.progress
            .info(&format!("operation is up to date: {}", op.title));
        Ok(false)
    }

    fn make_invocation(&self, op: &OperationInfo) -> Result<Invocation, EvalError> {
        let mut read_ids = op.declared_input.clone();
        read_ids.extend_from_slice(&op.declared_output);
        read_ids.extend_from_slice(&op.read_access);
        read_ids.extend_from_slice(&self.options.global_read_access);
        read_ids.sort();
        read_ids.dedup();

        let mut write_ids = op.declared_output.clone();
        write_ids.extend_from_slice(&op.write_access);
        write_ids.extend_from_slice(&self.options.global_write_access);
        write_ids.sort();
        write_ids.dedup();

        Ok(Invocation {
            executable: op.command.executable.clone(),
            arguments: op.command.arguments.clone(),
            working_directory: op.command.working_directory.clone(),
            allowed_read: self.resolve_paths(&read_ids)?,
            allowed_write: self.resolve_paths(&write_ids)?,
        })
    }

    fn resolve_paths(&self, ids: &[FileId]) -> Result<Vec<PathBuf>, EvalError> {
        ids.iter()
            .map(|&id| Ok(self.fs.path(id)?.to_owned()))
            .collect()
    }

    /// Surface a finished command's output, then either abort the pass or
    /// store its fresh result.
    fn record_execution(
        &mut self,
        op: &OperationInfo,
        output: SandboxOutput,
    ) -> Result<(), EvalError> {
        if output.exit_code != 0 {
            if !output.stdout.is_empty() {
                self.progress
                    .warning(String::from_utf8_lossy(&output.stdout).trim_end());
            }
            if !output.stderr.is_empty() {
                self.progress
                    .error(String::from_utf8_lossy(&output.stderr).trim_end());
            }
            return Err(EvalError::CommandExecutionFailed {
                title: op.title.clone(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        if !output.stdout.is_empty() {
            self.progress
                .info(String::from_utf8_lossy(&output.stdout).trim_end());
        }
        if !output.stderr.is_empty() {
            self.progress
                .error(String::from_utf8_lossy(&output.stderr).trim_end());
        }

        // Supersets of the declared sets are expected from the sandbox
        // and merged in as informational detail.
        let working_dir = &op.command.working_directory;
        let mut observed_input = op.declared_input.clone();
        for path in &output.observed_read {
            observed_input.push(self.fs.to_file_id(path, working_dir));
        }
        observed_input.sort();
        observed_input.dedup();

        let mut observed_output = op.declared_output.clone();
        for path in &output.observed_write {
            observed_output.push(self.fs.to_file_id(path, working_dir));
        }
        observed_output.sort();
        observed_output.dedup();

        // Refresh the cache for everything the command just wrote.
        for &id in &observed_output {
            self.fs.restat(id)?;
        }

        self.results.set(
            op.id,
            OperationResult {
                was_successful_run: true,
                evaluate_time: Timestamp::now(),
                observed_input,
                observed_output,
            },
        );
        Ok(())
    }
}

enum Ordering {
    Min,
    Max,
}

/// Whether (mtime, path) displaces the current extreme.  Ties on the
/// timestamp break toward the lexicographically smaller path so the
/// reported offender is deterministic.
fn extreme(
    current: &Option<(Timestamp, PathBuf)>,
    mtime: Timestamp,
    path: &std::path::Path,
    ordering: Ordering,
) -> bool {
    match current {
        None => true,
        Some((best, best_path)) => {
            let better = match ordering {
                Ordering::Max => mtime > *best,
                Ordering::Min => mtime < *best,
            };
            better || (mtime == *best && path < best_path.as_path())
        }
    }
}

/// Mark an operation done and decrement its children's counters; a child
/// whose counter reaches zero becomes ready, which happens exactly once
/// even with multiple parents.
fn finish_operation(
    op: &OperationInfo,
    counters: &mut FxHashMap<OperationId, u32>,
    ready: &mut VecDeque<OperationId>,
    completed: &mut usize,
) -> Result<(), EvalError> {
    *completed += 1;
    for &child in &op.children {
        let counter = counters.get_mut(&child).ok_or_else(|| {
            EvalError::GraphCorrupt(format!(
                "operation {} lists unknown child {}",
                op.id, child
            ))
        })?;
        if *counter == 0 {
            return Err(EvalError::GraphCorrupt(format!(
                "dependency count underflow on operation {}",
                child
            )));
        }
        *counter -= 1;
        if *counter == 0 {
            ready.push_back(child);
        }
    }
    Ok(())
}
