//! Taskweave - template and reference resolution for pipeline task configurations
//!
//! A pipeline document maps task names to `{input, output}` objects whose
//! values may embed `<%= ... %>` expression markers: external parameters,
//! sibling fields (`self.<field>`), and other tasks' outputs
//! (`$.<task>.output.<field>`). The resolver discovers the dependency graph
//! implied by those references, schedules tasks in a deterministic
//! topological order, and binds every input, leaving explicit deferred
//! bindings for outputs that only exist once the corresponding task has run.

pub mod binder;
pub mod document;
pub mod error;
pub mod expr;
pub mod graph;
pub mod outputs;
pub mod resolver;
pub mod scanner;
pub mod schedule;

pub use binder::{Params, ResolvedTaskConfig, ResolvedValue};
pub use document::{Document, TaskSpec};
pub use error::{FixSuggestion, ResolveError};
pub use expr::Expr;
pub use graph::RefGraph;
pub use outputs::{OutputSlot, OutputTable};
pub use resolver::{resolve, Resolution, Session};
pub use scanner::{ParsedDocument, ParsedTask, ValueExpr};
