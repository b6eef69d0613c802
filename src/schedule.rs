//! Topological evaluation order
//!
//! Kahn-style repeated removal of in-degree-zero tasks. All simultaneously
//! ready tasks are taken as one batch in document order, so two runs over
//! the same document schedule identically.

use std::collections::{HashMap, HashSet};

use crate::error::ResolveError;
use crate::graph::RefGraph;

/// Produce the evaluation order: every task appears after all tasks it
/// references. Fails with `CyclicDependency` when tasks remain but none is
/// ready.
pub fn evaluation_order(graph: &RefGraph) -> Result<Vec<String>, ResolveError> {
    let order = graph.order();
    let mut indegree: HashMap<&str, usize> = order
        .iter()
        .map(|name| (name.as_str(), graph.dependencies(name).len()))
        .collect();
    let mut placed: HashSet<&str> = HashSet::with_capacity(order.len());
    let mut result = Vec::with_capacity(order.len());

    while result.len() < order.len() {
        let ready: Vec<&str> = order
            .iter()
            .map(String::as_str)
            .filter(|name| !placed.contains(name) && indegree[name] == 0)
            .collect();

        if ready.is_empty() {
            return Err(ResolveError::CyclicDependency {
                cycle: find_cycle(graph, &placed),
            });
        }

        for name in ready {
            placed.insert(name);
            result.push(name.to_string());
            for dependent in graph.dependents(name) {
                *indegree
                    .get_mut(dependent.as_str())
                    .expect("dependent is a graph node") -= 1;
            }
        }
    }

    tracing::debug!(order = ?result, "evaluation order scheduled");
    Ok(result)
}

/// Walk unplaced dependencies until a node repeats; the repeated suffix is a
/// cycle. Any unplaced node has at least one unplaced dependency once the
/// scheduler is stuck, so the walk always closes.
fn find_cycle(graph: &RefGraph, placed: &HashSet<&str>) -> Vec<String> {
    let start = graph
        .order()
        .iter()
        .find(|name| !placed.contains(name.as_str()))
        .expect("scheduler stuck with no unplaced task");

    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut chain: Vec<&str> = Vec::new();
    let mut current = start.as_str();

    loop {
        if let Some(&at) = position.get(current) {
            return chain[at..].iter().map(|name| name.to_string()).collect();
        }
        position.insert(current, chain.len());
        chain.push(current);
        current = graph
            .dependencies(current)
            .iter()
            .map(String::as_str)
            .find(|dep| !placed.contains(dep))
            .expect("stuck task has an unplaced dependency");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::scanner::ParsedDocument;

    fn order_for(json: &str) -> Result<Vec<String>, ResolveError> {
        let doc = Document::from_json_str(json).unwrap();
        let graph = RefGraph::build(&ParsedDocument::parse(&doc).unwrap())?;
        evaluation_order(&graph)
    }

    #[test]
    fn dependencies_come_first() {
        // evaluate is declared first but references everything else
        let order = order_for(
            r#"{
                "evaluate": {
                    "input": {
                        "model": "<%= $.train.output.model %>",
                        "data": "<%= $.fetch_data.output.test %>"
                    },
                    "output": {}
                },
                "train": {
                    "input": {"data": "<%= $.fetch_data.output.train %>"},
                    "output": {"model": "./ckpt"}
                },
                "fetch_data": {"input": {}, "output": {"train": null, "test": null}}
            }"#,
        )
        .unwrap();
        assert_eq!(order, ["fetch_data", "train", "evaluate"]);
    }

    #[test]
    fn ready_ties_break_by_document_order() {
        let order = order_for(
            r#"{
                "fetch_vocab": {"input": {}, "output": {"vocab": null}},
                "fetch_data": {"input": {}, "output": {"train": null}},
                "preprocess": {
                    "input": {
                        "vocab": "<%= $.fetch_vocab.output.vocab %>",
                        "data": "<%= $.fetch_data.output.train %>"
                    },
                    "output": {}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(order, ["fetch_vocab", "fetch_data", "preprocess"]);
    }

    #[test]
    fn independent_tasks_keep_document_order() {
        let order = order_for(
            r#"{
                "c": {"input": {}, "output": {}},
                "a": {"input": {}, "output": {}},
                "b": {"input": {}, "output": {}}
            }"#,
        )
        .unwrap();
        assert_eq!(order, ["c", "a", "b"]);
    }

    #[test]
    fn two_task_cycle_names_both() {
        let err = order_for(
            r#"{
                "a": {"input": {"x": "<%= $.b.output.y %>"}, "output": {"x": null}},
                "b": {"input": {"y": "<%= $.a.output.x %>"}, "output": {"y": null}}
            }"#,
        )
        .unwrap_err();
        match err {
            ResolveError::CyclicDependency { cycle } => {
                assert!(cycle.len() >= 2);
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn cycle_behind_valid_prefix_is_found() {
        let err = order_for(
            r#"{
                "seed": {"input": {}, "output": {"s": null}},
                "a": {
                    "input": {
                        "s": "<%= $.seed.output.s %>",
                        "x": "<%= $.c.output.z %>"
                    },
                    "output": {"x": null}
                },
                "b": {"input": {"y": "<%= $.a.output.x %>"}, "output": {"y": null}},
                "c": {"input": {"z": "<%= $.b.output.y %>"}, "output": {"z": null}}
            }"#,
        )
        .unwrap_err();
        match err {
            ResolveError::CyclicDependency { cycle } => {
                assert_eq!(cycle.len(), 3);
                assert!(!cycle.contains(&"seed".to_string()));
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn scheduling_is_deterministic() {
        let json = r#"{
            "d": {"input": {}, "output": {}},
            "b": {"input": {"x": "<%= $.d.output.x %>"}, "output": {}},
            "a": {"input": {}, "output": {"x": null}},
            "c": {"input": {}, "output": {}}
        }"#;
        let first = order_for(json).unwrap();
        let second = order_for(json).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, ["d", "a", "c", "b"]);
    }
}
