//! Error types with fix suggestions

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ─────────────────────────────────────────────────────────────
    // Document errors (TW-010 to TW-011)
    // ─────────────────────────────────────────────────────────────

    #[error("TW-010: duplicate task name '{task}'")]
    DuplicateTask { task: String },

    #[error("TW-011: unsupported document extension '{extension}'")]
    UnsupportedExtension { extension: String },

    // ─────────────────────────────────────────────────────────────
    // Marker and expression errors (TW-020 to TW-021)
    // ─────────────────────────────────────────────────────────────

    #[error("TW-020: parse error at task '{task}' field '{field}': {detail}")]
    Parse {
        task: String,
        field: String,
        detail: String,
    },

    #[error("TW-021: unknown variable '{marker}' at task '{task}' field '{field}'")]
    UnknownVariable {
        task: String,
        field: String,
        marker: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Graph errors (TW-030 to TW-032)
    // ─────────────────────────────────────────────────────────────

    #[error("TW-030: unknown task '{name}' ({context})")]
    UnknownTask { name: String, context: String },

    #[error("TW-031: task '{task}' references its own output at field '{field}'")]
    SelfLoop { task: String, field: String },

    #[error("TW-032: cyclic dependency: {}", format_cycle(cycle))]
    CyclicDependency { cycle: Vec<String> },

    // ─────────────────────────────────────────────────────────────
    // Evaluation errors (TW-040 to TW-044)
    // ─────────────────────────────────────────────────────────────

    #[error("TW-040: parameter '{name}' referenced at task '{task}' field '{field}' is not in the environment")]
    MissingParameter {
        name: String,
        task: String,
        field: String,
    },

    #[error("TW-041: 'self.{target}' at task '{task}' field '{field}' refers to a field declared later")]
    ForwardSelfReference {
        task: String,
        field: String,
        target: String,
    },

    #[error("TW-042: cannot concretize expression at task '{task}' field '{field}': {reason}")]
    NonConcretizable {
        task: String,
        field: String,
        reason: String,
    },

    #[error("TW-043: key '{key}' not found in map literal at task '{task}' field '{field}' (available: {})", available.join(", "))]
    KeyNotFound {
        task: String,
        field: String,
        key: String,
        available: Vec<String>,
    },

    #[error("TW-044: output field '{task}.{field}' referenced by task '{referrer}' is not declared")]
    UnknownOutputField {
        task: String,
        field: String,
        referrer: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Executor contract errors (TW-050)
    // ─────────────────────────────────────────────────────────────

    #[error("TW-050: task '{task}' does not declare pending output field '{field}'")]
    OutputNotPending { task: String, field: String },
}

fn format_cycle(cycle: &[String]) -> String {
    let mut path = cycle.join(" -> ");
    if let Some(first) = cycle.first() {
        path.push_str(" -> ");
        path.push_str(first);
    }
    path
}

impl FixSuggestion for ResolveError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            ResolveError::Json(_) => Some("Check JSON syntax: commas, braces and quoting"),
            ResolveError::Yaml(_) => Some("Check YAML syntax: indentation and quoting"),
            ResolveError::Io(_) => Some("Check file path and permissions"),
            ResolveError::DuplicateTask { .. } => Some("Give every task a unique name"),
            ResolveError::UnsupportedExtension { .. } => {
                Some("Use a .json, .yaml or .yml document")
            }
            ResolveError::Parse { .. } => {
                Some("Check marker syntax: <%= param %>, <%= $.task.output.field %>, <%= self.field %>")
            }
            ResolveError::UnknownVariable { .. } => {
                Some("Use a parameter name, self.<field>, or $.<task>.output.<field>")
            }
            ResolveError::UnknownTask { .. } => Some("Verify the task name exists in the document"),
            ResolveError::SelfLoop { .. } => {
                Some("A task cannot read its own output; use self.<field> for sibling input fields")
            }
            ResolveError::CyclicDependency { .. } => {
                Some("Break the cycle: at least one task must not depend on the others")
            }
            ResolveError::MissingParameter { .. } => {
                Some("Supply the parameter in the environment before resolving")
            }
            ResolveError::ForwardSelfReference { .. } => {
                Some("Declare the referenced field before the field that uses it")
            }
            ResolveError::NonConcretizable { .. } => {
                Some("Operands must be concrete strings; pending outputs cannot be combined before the task runs")
            }
            ResolveError::KeyNotFound { .. } => {
                Some("The index expression must evaluate to one of the literal map keys")
            }
            ResolveError::UnknownOutputField { .. } => {
                Some("Reference a field declared in the source task's output object")
            }
            ResolveError::OutputNotPending { .. } => {
                Some("The executor must write exactly the fields reported as pending, and only those")
            }
        }
    }
}
