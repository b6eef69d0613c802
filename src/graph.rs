//! Reference graph built from cross-task output references
//!
//! The dependency graph is discovered, not declared: every
//! `$.<task>.output.<field>` occurrence in a task's inputs adds an edge from
//! the referenced task to the referencing one. Rebuilt fresh per resolution
//! run, never mutated incrementally.

use std::collections::{HashMap, HashSet};

use crate::error::ResolveError;
use crate::scanner::{ParsedDocument, Piece, ValueExpr};

/// Directed task dependency graph
pub struct RefGraph {
    /// task -> tasks whose inputs reference its outputs
    dependents: HashMap<String, Vec<String>>,
    /// task -> tasks it references
    dependencies: HashMap<String, Vec<String>>,
    /// task names in document order
    order: Vec<String>,
}

impl RefGraph {
    pub fn build(doc: &ParsedDocument) -> Result<Self, ResolveError> {
        let mut dependents: HashMap<String, Vec<String>> = HashMap::with_capacity(doc.len());
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::with_capacity(doc.len());
        let mut order = Vec::with_capacity(doc.len());

        for task in doc.iter() {
            order.push(task.name.clone());
            dependents.insert(task.name.clone(), Vec::new());
            dependencies.insert(task.name.clone(), Vec::new());
        }

        let mut edges = 0usize;
        for task in doc.iter() {
            let mut seen: HashSet<&str> = HashSet::new();
            for (field, value) in &task.input {
                let mut refs: Vec<(&str, &str)> = Vec::new();
                collect_refs(value, &mut refs);

                for (source, _) in refs {
                    let path = format!("input.{field}");
                    if source == task.name {
                        return Err(ResolveError::SelfLoop {
                            task: task.name.clone(),
                            field: path,
                        });
                    }
                    if !doc.contains(source) {
                        return Err(ResolveError::UnknownTask {
                            name: source.to_string(),
                            context: format!(
                                "referenced by task '{}' field '{}'",
                                task.name, path
                            ),
                        });
                    }
                    if seen.insert(source) {
                        dependencies
                            .get_mut(&task.name)
                            .expect("task registered above")
                            .push(source.to_string());
                        dependents
                            .get_mut(source)
                            .expect("source exists in document")
                            .push(task.name.clone());
                        edges += 1;
                    }
                }
            }
        }

        tracing::debug!(tasks = order.len(), edges, "reference graph built");
        Ok(Self {
            dependents,
            dependencies,
            order,
        })
    }

    /// Tasks referenced by `task`, in first-reference order
    pub fn dependencies(&self, task: &str) -> &[String] {
        self.dependencies
            .get(task)
            .map(|v| v.as_slice())
            .unwrap_or_default()
    }

    /// Tasks whose inputs reference `task`
    pub fn dependents(&self, task: &str) -> &[String] {
        self.dependents
            .get(task)
            .map(|v| v.as_slice())
            .unwrap_or_default()
    }

    /// Task names in document order
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Collect every `TaskOutput` reference beneath a value, including inside
/// splices, nested containers, concatenations, and map-literal entries/keys.
fn collect_refs<'a>(value: &'a ValueExpr, acc: &mut Vec<(&'a str, &'a str)>) {
    match value {
        ValueExpr::Literal(_) => {}
        ValueExpr::Expr(expr) => expr.for_each_task_ref(&mut |task, field| acc.push((task, field))),
        ValueExpr::Splice(pieces) => {
            for piece in pieces {
                if let Piece::Expr(expr) = piece {
                    expr.for_each_task_ref(&mut |task, field| acc.push((task, field)));
                }
            }
        }
        ValueExpr::Object(fields) => {
            for (_, child) in fields {
                collect_refs(child, acc);
            }
        }
        ValueExpr::Array(items) => {
            for child in items {
                collect_refs(child, acc);
            }
        }
    }
}
