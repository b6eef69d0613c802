//! Output placeholder model
//!
//! An output field declared `null` is `Pending` until the executor supplies
//! its concrete value; a field with a literal value (a fixed checkpoint path,
//! a known filename) is available to downstream tasks at resolution time.
//! The set of pending fields per task is the binding contract the executor
//! must honor: write exactly these fields after running the task.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::ResolveError;
use crate::scanner;

/// One output field: statically known, or produced at run time
#[derive(Debug, Clone, PartialEq)]
pub enum OutputSlot {
    /// Value known before the task runs
    Literal(Value),
    /// Value only known after the task runs; bound by the executor
    Pending,
}

impl OutputSlot {
    /// Classify a declared output value. `null` means run-time-only; any
    /// other value must be marker-free.
    pub(crate) fn declare(task: &str, field: &str, value: &Value) -> Result<Self, ResolveError> {
        match value {
            Value::Null => Ok(OutputSlot::Pending),
            other => Ok(OutputSlot::Literal(scanner::literal_only(
                task, field, other,
            )?)),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, OutputSlot::Pending)
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            OutputSlot::Literal(value) => Some(value),
            OutputSlot::Pending => None,
        }
    }

    /// Pending slots render as `null`, matching the source document form.
    pub fn to_json(&self) -> Value {
        match self {
            OutputSlot::Literal(value) => value.clone(),
            OutputSlot::Pending => Value::Null,
        }
    }
}

/// Growing table of task outputs, appended to as tasks are resolved.
/// Slots transition `Pending` -> `Literal` at most once, via `record`.
#[derive(Debug, Clone, Default)]
pub struct OutputTable {
    tasks: Vec<(String, Vec<(String, OutputSlot)>)>,
    index: HashMap<String, usize>,
}

impl OutputTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task's declared outputs. Called once per task, in
    /// evaluation order.
    pub(crate) fn declare_task(&mut self, name: &str, slots: Vec<(String, OutputSlot)>) {
        self.index.insert(name.to_string(), self.tasks.len());
        self.tasks.push((name.to_string(), slots));
    }

    pub fn has_task(&self, task: &str) -> bool {
        self.index.contains_key(task)
    }

    pub fn slot(&self, task: &str, field: &str) -> Option<&OutputSlot> {
        let &pos = self.index.get(task)?;
        self.tasks[pos]
            .1
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, slot)| slot)
    }

    /// Declared output fields of a task, in declaration order
    pub fn fields(&self, task: &str) -> Option<&[(String, OutputSlot)]> {
        self.index.get(task).map(|&pos| self.tasks[pos].1.as_slice())
    }

    /// Field names still pending for a task: the executor binding contract
    pub fn pending_fields(&self, task: &str) -> Vec<&str> {
        self.fields(task)
            .map(|fields| {
                fields
                    .iter()
                    .filter(|(_, slot)| slot.is_pending())
                    .map(|(name, _)| name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Executor feedback: bind concrete values to a task's pending outputs.
    ///
    /// Writing a field that is unknown or already literal fails before any
    /// slot is touched. Pending fields left unwritten stay pending, with a
    /// warning.
    pub fn record(&mut self, task: &str, values: &Map<String, Value>) -> Result<(), ResolveError> {
        let Some(&pos) = self.index.get(task) else {
            return Err(ResolveError::UnknownTask {
                name: task.to_string(),
                context: "executor reported output for an unresolved task".to_string(),
            });
        };

        for key in values.keys() {
            let slot = self.tasks[pos].1.iter().find(|(name, _)| name == key);
            match slot {
                Some((_, OutputSlot::Pending)) => {}
                _ => {
                    return Err(ResolveError::OutputNotPending {
                        task: task.to_string(),
                        field: key.clone(),
                    })
                }
            }
        }

        let unwritten: Vec<&str> = self.tasks[pos]
            .1
            .iter()
            .filter(|(name, slot)| slot.is_pending() && !values.contains_key(name))
            .map(|(name, _)| name.as_str())
            .collect();
        if !unwritten.is_empty() {
            tracing::warn!(task, fields = ?unwritten, "executor left pending output fields unwritten");
        }

        for (name, slot) in &mut self.tasks[pos].1 {
            if let Some(value) = values.get(name) {
                *slot = OutputSlot::Literal(value.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table_with_fetch_data() -> OutputTable {
        let mut table = OutputTable::new();
        table.declare_task(
            "fetch_data",
            vec![
                ("train".to_string(), OutputSlot::Pending),
                ("dev".to_string(), OutputSlot::Pending),
                (
                    "vocab".to_string(),
                    OutputSlot::Literal(json!("./vocab.txt")),
                ),
            ],
        );
        table
    }

    #[test]
    fn declare_classifies_null_as_pending() {
        assert_eq!(
            OutputSlot::declare("t", "output.train", &Value::Null).unwrap(),
            OutputSlot::Pending
        );
        assert_eq!(
            OutputSlot::declare("t", "output.model", &json!("./ckpt")).unwrap(),
            OutputSlot::Literal(json!("./ckpt"))
        );
    }

    #[test]
    fn declare_rejects_templated_outputs() {
        let err = OutputSlot::declare("t", "output.model", &json!("<%= locale %>")).unwrap_err();
        assert!(matches!(err, ResolveError::Parse { .. }));
    }

    #[test]
    fn pending_fields_reports_the_contract() {
        let table = table_with_fetch_data();
        assert_eq!(table.pending_fields("fetch_data"), vec!["train", "dev"]);
        assert!(table.pending_fields("unknown").is_empty());
    }

    #[test]
    fn record_binds_pending_slots() {
        let mut table = table_with_fetch_data();
        let mut values = Map::new();
        values.insert("train".to_string(), json!("./train"));
        values.insert("dev".to_string(), json!("./dev"));
        table.record("fetch_data", &values).unwrap();

        assert_eq!(
            table.slot("fetch_data", "train"),
            Some(&OutputSlot::Literal(json!("./train")))
        );
        assert!(table.pending_fields("fetch_data").is_empty());
    }

    #[test]
    fn record_rejects_undeclared_fields() {
        let mut table = table_with_fetch_data();
        let mut values = Map::new();
        values.insert("test".to_string(), json!("./test"));
        let err = table.record("fetch_data", &values).unwrap_err();
        assert!(matches!(
            err,
            ResolveError::OutputNotPending { field, .. } if field == "test"
        ));
    }

    #[test]
    fn record_rejects_literal_overwrite() {
        let mut table = table_with_fetch_data();
        let mut values = Map::new();
        values.insert("vocab".to_string(), json!("./other.txt"));
        assert!(table.record("fetch_data", &values).is_err());
    }

    #[test]
    fn record_is_all_or_nothing() {
        let mut table = table_with_fetch_data();
        let mut values = Map::new();
        values.insert("train".to_string(), json!("./train"));
        values.insert("bogus".to_string(), json!("x"));
        assert!(table.record("fetch_data", &values).is_err());
        // The valid key must not have been applied.
        assert_eq!(table.slot("fetch_data", "train"), Some(&OutputSlot::Pending));
    }

    #[test]
    fn record_twice_fails_on_second_write() {
        let mut table = table_with_fetch_data();
        let mut values = Map::new();
        values.insert("train".to_string(), json!("./train"));
        table.record("fetch_data", &values).unwrap();
        assert!(table.record("fetch_data", &values).is_err());
    }

    #[test]
    fn record_unknown_task_fails() {
        let mut table = OutputTable::new();
        let err = table.record("ghost", &Map::new()).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownTask { .. }));
    }

    #[test]
    fn partial_record_leaves_rest_pending() {
        let mut table = table_with_fetch_data();
        let mut values = Map::new();
        values.insert("train".to_string(), json!("./train"));
        table.record("fetch_data", &values).unwrap();
        assert_eq!(table.pending_fields("fetch_data"), vec!["dev"]);
    }
}
