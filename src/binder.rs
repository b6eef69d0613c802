//! Binder/evaluator: turns parsed inputs into resolved values
//!
//! Evaluation runs field by field in declaration order against read-only
//! scopes: the external parameter environment, the already-evaluated sibling
//! fields of the same task (`self`), and the growing output table. Upstream
//! outputs that are still pending bind as explicit `Deferred` markers rather
//! than blocking or substituting null.

use serde_json::{json, Map, Value};

use crate::error::ResolveError;
use crate::expr::Expr;
use crate::outputs::{OutputSlot, OutputTable};
use crate::scanner::{ParsedTask, Piece, ValueExpr};

/// External parameter environment: name -> scalar value, supplied once per
/// run and immutable during resolution.
#[derive(Debug, Clone, Default)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter. Only meaningful before resolution starts; the
    /// resolver takes the environment by shared reference.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Two-phase value availability: concrete now, or bound to an output that
/// only exists after its task runs. Containers appear only when a deferred
/// binding sits somewhere beneath; fully-concrete containers collapse to
/// `Concrete` at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    Concrete(Value),
    Deferred { task: String, field: String },
    Object(Vec<(String, ResolvedValue)>),
    Array(Vec<ResolvedValue>),
}

impl ResolvedValue {
    pub fn is_concrete(&self) -> bool {
        matches!(self, ResolvedValue::Concrete(_))
    }

    /// Deterministic JSON rendering; deferred bindings serialize as
    /// `{"__deferred__": true, "task": ..., "field": ...}`.
    pub fn to_json(&self) -> Value {
        match self {
            ResolvedValue::Concrete(value) => value.clone(),
            ResolvedValue::Deferred { task, field } => {
                json!({"__deferred__": true, "task": task, "field": field})
            }
            ResolvedValue::Object(fields) => {
                let mut map = Map::with_capacity(fields.len());
                for (name, value) in fields {
                    map.insert(name.clone(), value.to_json());
                }
                Value::Object(map)
            }
            ResolvedValue::Array(items) => {
                Value::Array(items.iter().map(ResolvedValue::to_json).collect())
            }
        }
    }

    /// Thin re-binding pass: replace deferred bindings whose slots have
    /// since become literal. Bindings still pending stay deferred.
    pub fn rebind(&self, table: &OutputTable) -> ResolvedValue {
        match self {
            ResolvedValue::Concrete(_) => self.clone(),
            ResolvedValue::Deferred { task, field } => {
                match table.slot(task, field).and_then(OutputSlot::as_literal) {
                    Some(value) => ResolvedValue::Concrete(value.clone()),
                    None => self.clone(),
                }
            }
            ResolvedValue::Object(fields) => collapse_object(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), value.rebind(table)))
                    .collect(),
            ),
            ResolvedValue::Array(items) => {
                collapse_array(items.iter().map(|value| value.rebind(table)).collect())
            }
        }
    }
}

fn collapse_object(fields: Vec<(String, ResolvedValue)>) -> ResolvedValue {
    if fields.iter().all(|(_, value)| value.is_concrete()) {
        let mut map = Map::with_capacity(fields.len());
        for (name, value) in fields {
            match value {
                ResolvedValue::Concrete(value) => {
                    map.insert(name, value);
                }
                _ => unreachable!("checked concrete"),
            }
        }
        ResolvedValue::Concrete(Value::Object(map))
    } else {
        ResolvedValue::Object(fields)
    }
}

fn collapse_array(items: Vec<ResolvedValue>) -> ResolvedValue {
    if items.iter().all(ResolvedValue::is_concrete) {
        let values = items
            .into_iter()
            .map(|item| match item {
                ResolvedValue::Concrete(value) => value,
                _ => unreachable!("checked concrete"),
            })
            .collect();
        ResolvedValue::Concrete(Value::Array(values))
    } else {
        ResolvedValue::Array(items)
    }
}

/// One task's resolved configuration, immutable once produced
#[derive(Debug, Clone)]
pub struct ResolvedTaskConfig {
    pub name: String,
    input: Vec<(String, ResolvedValue)>,
    output: Vec<(String, OutputSlot)>,
}

impl ResolvedTaskConfig {
    pub fn input(&self, field: &str) -> Option<&ResolvedValue> {
        self.input
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    /// Input fields in declaration order
    pub fn inputs(&self) -> impl Iterator<Item = (&str, &ResolvedValue)> {
        self.input.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Output fields in declaration order
    pub fn outputs(&self) -> impl Iterator<Item = (&str, &OutputSlot)> {
        self.output.iter().map(|(name, slot)| (name.as_str(), slot))
    }

    /// Output fields the executor must supply after running this task
    pub fn pending_outputs(&self) -> Vec<&str> {
        self.output
            .iter()
            .filter(|(_, slot)| slot.is_pending())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn to_json(&self) -> Value {
        let mut input = Map::with_capacity(self.input.len());
        for (name, value) in &self.input {
            input.insert(name.clone(), value.to_json());
        }
        let mut output = Map::with_capacity(self.output.len());
        for (name, slot) in &self.output {
            output.insert(name.clone(), slot.to_json());
        }
        json!({"input": input, "output": output})
    }

    /// Re-binding pass over this config against the current table state.
    pub(crate) fn rebind(&self, table: &OutputTable) -> ResolvedTaskConfig {
        let input = self
            .input
            .iter()
            .map(|(name, value)| (name.clone(), value.rebind(table)))
            .collect();
        let output = table
            .fields(&self.name)
            .map(|fields| fields.to_vec())
            .unwrap_or_else(|| self.output.clone());
        ResolvedTaskConfig {
            name: self.name.clone(),
            input,
            output,
        }
    }
}

/// Evaluate one task against the current scopes. The caller guarantees every
/// task this one references already has its outputs declared in the table.
pub(crate) fn evaluate_task(
    task: &ParsedTask,
    params: &Params,
    outputs: &OutputTable,
) -> Result<ResolvedTaskConfig, ResolveError> {
    let mut resolved: Vec<(String, ResolvedValue)> = Vec::with_capacity(task.input.len());

    for (field, value) in &task.input {
        let path = format!("input.{field}");
        let ctx = EvalCtx {
            task: &task.name,
            params,
            outputs,
            siblings: &resolved,
            input: &task.input,
        };
        let value = ctx.eval_value(&path, value)?;
        resolved.push((field.clone(), value));
    }

    tracing::debug!(task = %task.name, fields = resolved.len(), "task inputs bound");
    Ok(ResolvedTaskConfig {
        name: task.name.clone(),
        input: resolved,
        output: task.output.clone(),
    })
}

/// Read-only evaluation scopes for one field of one task
struct EvalCtx<'a> {
    task: &'a str,
    params: &'a Params,
    outputs: &'a OutputTable,
    /// Already-evaluated sibling fields of the same task
    siblings: &'a [(String, ResolvedValue)],
    /// All declared input fields, for forward-reference detection
    input: &'a [(String, ValueExpr)],
}

impl EvalCtx<'_> {
    fn eval_value(&self, path: &str, value: &ValueExpr) -> Result<ResolvedValue, ResolveError> {
        match value {
            ValueExpr::Literal(value) => Ok(ResolvedValue::Concrete(value.clone())),
            ValueExpr::Expr(expr) => self.eval_expr(path, expr),
            ValueExpr::Splice(pieces) => {
                let mut text = String::new();
                for piece in pieces {
                    match piece {
                        Piece::Text(fragment) => text.push_str(fragment),
                        Piece::Expr(expr) => {
                            let value = self.eval_expr(path, expr)?;
                            text.push_str(&self.render_scalar(path, &value)?);
                        }
                    }
                }
                Ok(ResolvedValue::Concrete(Value::String(text)))
            }
            ValueExpr::Object(fields) => {
                let mut children = Vec::with_capacity(fields.len());
                for (name, child) in fields {
                    let child_path = format!("{path}.{name}");
                    children.push((name.clone(), self.eval_value(&child_path, child)?));
                }
                Ok(collapse_object(children))
            }
            ValueExpr::Array(items) => {
                let mut children = Vec::with_capacity(items.len());
                for (idx, child) in items.iter().enumerate() {
                    let child_path = format!("{path}[{idx}]");
                    children.push(self.eval_value(&child_path, child)?);
                }
                Ok(collapse_array(children))
            }
        }
    }

    fn eval_expr(&self, path: &str, expr: &Expr) -> Result<ResolvedValue, ResolveError> {
        match expr {
            Expr::Param(name) => match self.params.get(name) {
                Some(value) => Ok(ResolvedValue::Concrete(value.clone())),
                None => Err(ResolveError::MissingParameter {
                    name: name.clone(),
                    task: self.task.to_string(),
                    field: path.to_string(),
                }),
            },
            Expr::SelfField(name) => {
                if let Some((_, value)) = self.siblings.iter().find(|(field, _)| field == name) {
                    return Ok(value.clone());
                }
                if self.input.iter().any(|(field, _)| field == name) {
                    Err(ResolveError::ForwardSelfReference {
                        task: self.task.to_string(),
                        field: path.to_string(),
                        target: name.clone(),
                    })
                } else {
                    Err(ResolveError::UnknownVariable {
                        task: self.task.to_string(),
                        field: path.to_string(),
                        marker: format!("self.{name}"),
                    })
                }
            }
            Expr::TaskOutput { task, field } => match self.outputs.slot(task, field) {
                Some(OutputSlot::Literal(value)) => Ok(ResolvedValue::Concrete(value.clone())),
                Some(OutputSlot::Pending) => Ok(ResolvedValue::Deferred {
                    task: task.clone(),
                    field: field.clone(),
                }),
                None if self.outputs.has_task(task) => Err(ResolveError::UnknownOutputField {
                    task: task.clone(),
                    field: field.clone(),
                    referrer: self.task.to_string(),
                }),
                None => Err(ResolveError::UnknownTask {
                    name: task.clone(),
                    context: format!(
                        "referenced by task '{}' field '{path}' before its outputs were declared",
                        self.task
                    ),
                }),
            },
            Expr::Str(text) => Ok(ResolvedValue::Concrete(Value::String(text.clone()))),
            Expr::Concat(left, right) => {
                let mut text = self.concat_operand(path, &self.eval_expr(path, left)?)?;
                text.push_str(&self.concat_operand(path, &self.eval_expr(path, right)?)?);
                Ok(ResolvedValue::Concrete(Value::String(text)))
            }
            Expr::MapIndex { entries, key } => {
                let key_value = self.eval_expr(path, key)?;
                let key_text = match &key_value {
                    ResolvedValue::Concrete(Value::String(text)) => text.clone(),
                    ResolvedValue::Deferred { task, field } => {
                        return Err(self.non_concretizable(
                            path,
                            format!("map index key depends on pending output '{task}.{field}'"),
                        ))
                    }
                    other => {
                        return Err(self.non_concretizable(
                            path,
                            format!("map index key must be a string, got {}", describe(other)),
                        ))
                    }
                };
                match entries.iter().find(|(name, _)| *name == key_text) {
                    Some((_, entry)) => self.eval_expr(path, entry),
                    None => Err(ResolveError::KeyNotFound {
                        task: self.task.to_string(),
                        field: path.to_string(),
                        key: key_text,
                        available: entries.iter().map(|(name, _)| name.clone()).collect(),
                    }),
                }
            }
        }
    }

    fn concat_operand(&self, path: &str, value: &ResolvedValue) -> Result<String, ResolveError> {
        match value {
            ResolvedValue::Concrete(Value::String(text)) => Ok(text.clone()),
            ResolvedValue::Deferred { task, field } => Err(self.non_concretizable(
                path,
                format!("concatenation operand depends on pending output '{task}.{field}'"),
            )),
            other => Err(self.non_concretizable(
                path,
                format!("concatenation operand is not a string: {}", describe(other)),
            )),
        }
    }

    /// Render a value for string interpolation: strings verbatim, numbers
    /// and booleans in canonical form.
    fn render_scalar(&self, path: &str, value: &ResolvedValue) -> Result<String, ResolveError> {
        match value {
            ResolvedValue::Concrete(Value::String(text)) => Ok(text.clone()),
            ResolvedValue::Concrete(Value::Number(number)) => Ok(number.to_string()),
            ResolvedValue::Concrete(Value::Bool(flag)) => Ok(flag.to_string()),
            ResolvedValue::Concrete(Value::Null) => Err(self.non_concretizable(
                path,
                "interpolated expression evaluates to null".to_string(),
            )),
            ResolvedValue::Deferred { task, field } => Err(self.non_concretizable(
                path,
                format!("interpolated expression depends on pending output '{task}.{field}'"),
            )),
            other => Err(self.non_concretizable(
                path,
                format!("interpolated expression is not a scalar: {}", describe(other)),
            )),
        }
    }

    fn non_concretizable(&self, path: &str, reason: String) -> ResolveError {
        ResolveError::NonConcretizable {
            task: self.task.to_string(),
            field: path.to_string(),
            reason,
        }
    }
}

fn describe(value: &ResolvedValue) -> &'static str {
    match value {
        ResolvedValue::Concrete(Value::Null) => "null",
        ResolvedValue::Concrete(Value::Bool(_)) => "a boolean",
        ResolvedValue::Concrete(Value::Number(_)) => "a number",
        ResolvedValue::Concrete(Value::String(_)) => "a string",
        ResolvedValue::Concrete(Value::Array(_)) | ResolvedValue::Array(_) => "an array",
        ResolvedValue::Concrete(Value::Object(_)) | ResolvedValue::Object(_) => "an object",
        ResolvedValue::Deferred { .. } => "a deferred binding",
    }
}
