//! Resolver facade
//!
//! Two modes over the same pipeline: `resolve` pre-resolves the whole
//! document up front, leaving deferred bindings for outputs that only exist
//! after execution; `Session` interleaves resolution with execution, so
//! outputs recorded between steps bind as literals immediately.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::binder::{self, Params, ResolvedTaskConfig};
use crate::document::Document;
use crate::error::ResolveError;
use crate::graph::RefGraph;
use crate::outputs::OutputTable;
use crate::scanner::ParsedDocument;
use crate::schedule;

/// Fully pre-resolve a document against a parameter environment.
///
/// Fails atomically on the first error; a returned `Resolution` always
/// covers every task in the document.
pub fn resolve(doc: &Document, params: &Params) -> Result<Resolution, ResolveError> {
    let parsed = ParsedDocument::parse(doc)?;
    let graph = RefGraph::build(&parsed)?;
    let order = schedule::evaluation_order(&graph)?;

    let mut table = OutputTable::new();
    let mut tasks = Vec::with_capacity(order.len());
    let mut index = HashMap::with_capacity(order.len());

    for name in &order {
        let task = parsed.get(name).expect("scheduled task exists");
        let config = binder::evaluate_task(task, params, &table)?;
        table.declare_task(name, task.output.clone());
        index.insert(name.clone(), tasks.len());
        tasks.push(config);
    }

    tracing::debug!(tasks = tasks.len(), "document resolved");
    Ok(Resolution {
        order,
        tasks,
        index,
        table,
    })
}

/// The resolved document: per-task configs in evaluation order plus the
/// output table carrying the executor binding contract.
#[derive(Debug, Clone)]
pub struct Resolution {
    order: Vec<String>,
    tasks: Vec<ResolvedTaskConfig>,
    index: HashMap<String, usize>,
    table: OutputTable,
}

impl Resolution {
    /// Scheduled evaluation order
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn task(&self, name: &str) -> Option<&ResolvedTaskConfig> {
        self.index.get(name).map(|&pos| &self.tasks[pos])
    }

    /// Resolved configs in evaluation order
    pub fn tasks(&self) -> impl Iterator<Item = &ResolvedTaskConfig> {
        self.tasks.iter()
    }

    /// Output fields the executor must supply for a task
    pub fn pending_outputs(&self, task: &str) -> Vec<&str> {
        self.table.pending_fields(task)
    }

    /// Executor feedback: bind concrete values to a task's pending outputs.
    pub fn record_output(
        &mut self,
        task: &str,
        values: &Map<String, Value>,
    ) -> Result<(), ResolveError> {
        self.table.record(task, values)
    }

    /// Thin re-binding pass: replace deferred bindings whose source outputs
    /// have been recorded since resolution.
    pub fn rebind(&mut self) {
        for config in &mut self.tasks {
            *config = config.rebind(&self.table);
        }
    }

    /// Deterministic JSON rendering of every resolved config, keyed by task
    /// name in evaluation order.
    pub fn to_json(&self) -> Value {
        let mut map = Map::with_capacity(self.tasks.len());
        for config in &self.tasks {
            map.insert(config.name.clone(), config.to_json());
        }
        Value::Object(map)
    }
}

/// Interleaved resolve/execute session: tasks resolve one at a time against
/// the outputs recorded so far.
pub struct Session {
    parsed: ParsedDocument,
    params: Params,
    order: Vec<String>,
    cursor: usize,
    table: OutputTable,
    tasks: Vec<ResolvedTaskConfig>,
    index: HashMap<String, usize>,
}

impl Session {
    /// Parse, build the graph and schedule up front, so static errors
    /// surface before any task runs.
    pub fn new(doc: &Document, params: Params) -> Result<Self, ResolveError> {
        let parsed = ParsedDocument::parse(doc)?;
        let graph = RefGraph::build(&parsed)?;
        let order = schedule::evaluation_order(&graph)?;
        Ok(Self {
            parsed,
            params,
            order,
            cursor: 0,
            table: OutputTable::new(),
            tasks: Vec::new(),
            index: HashMap::new(),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.order.len()
    }

    /// Scheduled evaluation order
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Resolve the next scheduled task against the current output table.
    /// Returns `None` once every task is resolved.
    pub fn next(&mut self) -> Result<Option<ResolvedTaskConfig>, ResolveError> {
        let Some(name) = self.order.get(self.cursor) else {
            return Ok(None);
        };
        let task = self.parsed.get(name).expect("scheduled task exists");
        let config = binder::evaluate_task(task, &self.params, &self.table)?;
        self.table.declare_task(name, task.output.clone());
        self.index.insert(name.clone(), self.tasks.len());
        self.tasks.push(config.clone());
        self.cursor += 1;
        Ok(Some(config))
    }

    /// Executor feedback for an already-resolved task. Later tasks see the
    /// recorded values as literals.
    pub fn record_output(
        &mut self,
        task: &str,
        values: &Map<String, Value>,
    ) -> Result<(), ResolveError> {
        self.table.record(task, values)
    }

    pub fn pending_outputs(&self, task: &str) -> Vec<&str> {
        self.table.pending_fields(task)
    }

    /// A task resolved earlier in this session
    pub fn task(&self, name: &str) -> Option<&ResolvedTaskConfig> {
        self.index.get(name).map(|&pos| &self.tasks[pos])
    }

    /// Resolve all remaining tasks and close the session.
    pub fn finish(mut self) -> Result<Resolution, ResolveError> {
        while self.next()?.is_some() {}
        Ok(Resolution {
            order: self.order,
            tasks: self.tasks,
            index: self.index,
            table: self.table,
        })
    }
}
