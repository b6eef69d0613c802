//! Template marker scanning
//!
//! Extracts `<%= ... %>` markers from document values without touching the
//! surrounding literal text. A string that is exactly one marker evaluates to
//! the expression's value; a string with markers interpolated among literal
//! fragments concatenates the evaluated pieces. The ERB-style escape `<%%=`
//! renders as verbatim `<%=` and is never evaluated.
//!
//! Scanning is a pure transformation: it produces the `ValueExpr` tree the
//! binder evaluates, parsing each distinct marker text exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::document::Document;
use crate::error::ResolveError;
use crate::expr::{self, Expr, ExprError};
use crate::outputs::OutputSlot;

static MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<%=(.*?)%>").unwrap());

const ESCAPED_OPEN: &str = "<%%=";
const OPEN: &str = "<%=";

/// One fragment of a scanned string
#[derive(Debug, Clone, PartialEq)]
pub enum ScanPart {
    /// Literal text, escapes already unfolded
    Text(String),
    /// Inner text of one marker, trimmed
    Marker(String),
}

/// Classification of a scanned string value
#[derive(Debug, Clone, PartialEq)]
pub enum Scanned {
    /// No live markers; the unescaped text stands as-is
    Plain(String),
    /// The entire string is exactly one marker
    Whole(String),
    /// Markers interpolated among literal fragments
    Spliced(Vec<ScanPart>),
}

/// Scan one raw string for markers. Errors on an unterminated `<%=`.
pub fn scan(raw: &str) -> Result<Scanned, String> {
    let mut parts: Vec<ScanPart> = Vec::new();
    let mut cursor = 0;

    for captures in MARKER.captures_iter(raw) {
        let whole = captures.get(0).expect("regex has a full match");
        let inner = captures.get(1).expect("regex has one group").as_str();
        if whole.start() > cursor {
            push_text(&mut parts, &raw[cursor..whole.start()])?;
        }
        parts.push(ScanPart::Marker(inner.trim().to_string()));
        cursor = whole.end();
    }
    if cursor < raw.len() {
        push_text(&mut parts, &raw[cursor..])?;
    }

    let markers = parts
        .iter()
        .filter(|p| matches!(p, ScanPart::Marker(_)))
        .count();
    Ok(match (markers, parts.len()) {
        (0, _) => Scanned::Plain(unescape(raw)),
        (1, 1) => match parts.remove(0) {
            ScanPart::Marker(inner) => Scanned::Whole(inner),
            ScanPart::Text(_) => unreachable!("single part counted as marker"),
        },
        _ => Scanned::Spliced(parts),
    })
}

fn push_text(parts: &mut Vec<ScanPart>, fragment: &str) -> Result<(), String> {
    // All terminated markers were consumed by the regex; a leftover opener
    // has no matching close. The escaped form never contains a bare opener.
    if fragment.contains(OPEN) {
        return Err(format!("unterminated marker '{OPEN}' with no matching '%>'"));
    }
    parts.push(ScanPart::Text(unescape(fragment)));
    Ok(())
}

fn unescape(text: &str) -> String {
    text.replace(ESCAPED_OPEN, OPEN)
}

/// One interpolation piece, ready for evaluation
#[derive(Debug, Clone)]
pub enum Piece {
    Text(String),
    Expr(Arc<Expr>),
}

/// A document value with its markers parsed, built once per resolution run
#[derive(Debug, Clone)]
pub enum ValueExpr {
    /// No markers anywhere beneath; value stands as-is
    Literal(Value),
    /// Whole-field marker
    Expr(Arc<Expr>),
    /// String with interpolated markers
    Splice(Vec<Piece>),
    /// Object with a marker somewhere beneath
    Object(Vec<(String, ValueExpr)>),
    /// Array with a marker somewhere beneath
    Array(Vec<ValueExpr>),
}

/// Build the ValueExpr tree for one input value. `field` is the dotted path
/// used in error context, e.g. `input.config.tag`.
pub(crate) fn build_value(
    task: &str,
    field: &str,
    value: &Value,
) -> Result<ValueExpr, ResolveError> {
    match value {
        Value::String(raw) => build_string(task, field, raw),
        Value::Object(map) => {
            let mut children = Vec::with_capacity(map.len());
            for (key, child) in map {
                let child_path = format!("{field}.{key}");
                children.push((key.clone(), build_value(task, &child_path, child)?));
            }
            Ok(collapse_object(children))
        }
        Value::Array(items) => {
            let mut children = Vec::with_capacity(items.len());
            for (idx, child) in items.iter().enumerate() {
                let child_path = format!("{field}[{idx}]");
                children.push(build_value(task, &child_path, child)?);
            }
            Ok(collapse_array(children))
        }
        other => Ok(ValueExpr::Literal(other.clone())),
    }
}

fn build_string(task: &str, field: &str, raw: &str) -> Result<ValueExpr, ResolveError> {
    let scanned = scan(raw).map_err(|detail| ResolveError::Parse {
        task: task.to_string(),
        field: field.to_string(),
        detail,
    })?;
    match scanned {
        Scanned::Plain(text) => Ok(ValueExpr::Literal(Value::String(text))),
        Scanned::Whole(inner) => Ok(ValueExpr::Expr(parse_marker(task, field, &inner)?)),
        Scanned::Spliced(parts) => {
            let mut pieces = Vec::with_capacity(parts.len());
            for part in parts {
                match part {
                    ScanPart::Text(text) => pieces.push(Piece::Text(text)),
                    ScanPart::Marker(inner) => {
                        pieces.push(Piece::Expr(parse_marker(task, field, &inner)?))
                    }
                }
            }
            Ok(ValueExpr::Splice(pieces))
        }
    }
}

fn parse_marker(task: &str, field: &str, inner: &str) -> Result<Arc<Expr>, ResolveError> {
    expr::parse_cached(inner).map_err(|err| match err {
        ExprError::Parse(detail) => ResolveError::Parse {
            task: task.to_string(),
            field: field.to_string(),
            detail: format!("{detail} (marker '<%= {inner} %>')"),
        },
        ExprError::UnknownVariable => ResolveError::UnknownVariable {
            task: task.to_string(),
            field: field.to_string(),
            marker: inner.to_string(),
        },
    })
}

fn collapse_object(children: Vec<(String, ValueExpr)>) -> ValueExpr {
    if children.iter().all(|(_, c)| matches!(c, ValueExpr::Literal(_))) {
        let mut map = Map::with_capacity(children.len());
        for (key, child) in children {
            match child {
                ValueExpr::Literal(value) => {
                    map.insert(key, value);
                }
                _ => unreachable!("checked literal"),
            }
        }
        ValueExpr::Literal(Value::Object(map))
    } else {
        ValueExpr::Object(children)
    }
}

fn collapse_array(children: Vec<ValueExpr>) -> ValueExpr {
    if children.iter().all(|c| matches!(c, ValueExpr::Literal(_))) {
        let items = children
            .into_iter()
            .map(|c| match c {
                ValueExpr::Literal(value) => value,
                _ => unreachable!("checked literal"),
            })
            .collect();
        ValueExpr::Literal(Value::Array(items))
    } else {
        ValueExpr::Array(children)
    }
}

/// Walk an output value: live markers are forbidden in outputs, escapes are
/// unfolded, everything else passes through untouched.
pub(crate) fn literal_only(task: &str, field: &str, value: &Value) -> Result<Value, ResolveError> {
    match value {
        Value::String(raw) => {
            let scanned = scan(raw).map_err(|detail| ResolveError::Parse {
                task: task.to_string(),
                field: field.to_string(),
                detail,
            })?;
            match scanned {
                Scanned::Plain(text) => Ok(Value::String(text)),
                Scanned::Whole(_) | Scanned::Spliced(_) => Err(ResolveError::Parse {
                    task: task.to_string(),
                    field: field.to_string(),
                    detail: "output values must not contain template markers".to_string(),
                }),
            }
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let child_path = format!("{field}.{key}");
                out.insert(key.clone(), literal_only(task, &child_path, child)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (idx, child) in items.iter().enumerate() {
                let child_path = format!("{field}[{idx}]");
                out.push(literal_only(task, &child_path, child)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

/// One task with markers parsed, in declaration order
#[derive(Debug, Clone)]
pub struct ParsedTask {
    pub name: String,
    pub input: Vec<(String, ValueExpr)>,
    pub output: Vec<(String, OutputSlot)>,
}

impl ParsedTask {
    /// Names of the input fields in declaration order
    pub fn input_fields(&self) -> impl Iterator<Item = &str> {
        self.input.iter().map(|(name, _)| name.as_str())
    }
}

/// Document with every marker parsed, ready for graph building and binding
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    tasks: Vec<ParsedTask>,
    index: HashMap<String, usize>,
}

impl ParsedDocument {
    pub fn parse(doc: &Document) -> Result<Self, ResolveError> {
        let mut tasks = Vec::with_capacity(doc.len());
        let mut index = HashMap::with_capacity(doc.len());

        for (name, spec) in doc.iter() {
            let mut input = Vec::with_capacity(spec.input.len());
            for (field, value) in &spec.input {
                let path = format!("input.{field}");
                input.push((field.clone(), build_value(name, &path, value)?));
            }

            let mut output = Vec::with_capacity(spec.output.len());
            for (field, value) in &spec.output {
                let path = format!("output.{field}");
                output.push((field.clone(), OutputSlot::declare(name, &path, value)?));
            }

            index.insert(name.to_string(), tasks.len());
            tasks.push(ParsedTask {
                name: name.to_string(),
                input,
                output,
            });
        }

        tracing::debug!(tasks = tasks.len(), "document scanned");
        Ok(Self { tasks, index })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParsedTask> {
        self.index.get(name).map(|&pos| &self.tasks[pos])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Iterate tasks in document order
    pub fn iter(&self) -> impl Iterator<Item = &ParsedTask> {
        self.tasks.iter()
    }
}
