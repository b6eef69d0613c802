//! Marker expression grammar and parser
//!
//! Parses the text inside one `<%= ... %>` marker into an expression tree.
//! Supported forms:
//! - `$.task.output.field` (cross-task output reference)
//! - `self.field` (sibling input field of the same task)
//! - bare identifier (external parameter)
//! - `"text"` (string literal, `\"` and `\\` escapes)
//! - `a + b` (string concatenation, left-associative)
//! - `{key: expr, ...}[expr]` (map literal indexed by a dynamic key)
//!
//! Expressions are parsed once per distinct marker text and shared via a
//! process-wide cache.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use thiserror::Error;

/// A parsed marker expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// External parameter lookup: `locale`
    Param(String),
    /// Sibling input field of the same task: `self.model`
    SelfField(String),
    /// Another task's output: `$.fetch_data.output.train`
    TaskOutput { task: String, field: String },
    /// String literal: `"-"`
    Str(String),
    /// String concatenation: `locale + "-" + self.model`
    Concat(Box<Expr>, Box<Expr>),
    /// Map literal indexed by a dynamic key:
    /// `{train: $.a.output.x, dev: $.a.output.y}[fork]`
    MapIndex {
        entries: Vec<(String, Expr)>,
        key: Box<Expr>,
    },
}

impl Expr {
    /// Visit every `TaskOutput` reference in the tree, including references
    /// nested in concatenations and map-literal entries and keys.
    pub fn for_each_task_ref<'a>(&'a self, f: &mut impl FnMut(&'a str, &'a str)) {
        match self {
            Expr::TaskOutput { task, field } => f(task, field),
            Expr::Concat(left, right) => {
                left.for_each_task_ref(f);
                right.for_each_task_ref(f);
            }
            Expr::MapIndex { entries, key } => {
                for (_, entry) in entries {
                    entry.for_each_task_ref(f);
                }
                key.for_each_task_ref(f);
            }
            Expr::Param(_) | Expr::SelfField(_) | Expr::Str(_) => {}
        }
    }
}

/// Context-free parse failure; the scanner attaches task/field/marker context.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("{0}")]
    Parse(String),
    #[error("identifier is not a parameter, not self, and not a task path")]
    UnknownVariable,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Dollar,
    Dot,
    Plus,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Colon,
    Comma,
}

fn tokenize(text: &str) -> Result<Vec<Tok>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '$' => tokens.push(Tok::Dollar),
            '.' => tokens.push(Tok::Dot),
            '+' => tokens.push(Tok::Plus),
            '{' => tokens.push(Tok::LBrace),
            '}' => tokens.push(Tok::RBrace),
            '[' => tokens.push(Tok::LBracket),
            ']' => tokens.push(Tok::RBracket),
            ':' => tokens.push(Tok::Colon),
            ',' => tokens.push(Tok::Comma),
            '"' => {
                let mut text = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('"') => text.push('"'),
                            Some('\\') => text.push('\\'),
                            Some(other) => {
                                return Err(ExprError::Parse(format!(
                                    "unsupported escape '\\{other}' in string literal"
                                )))
                            }
                            None => break,
                        },
                        other => text.push(other),
                    }
                }
                if !closed {
                    return Err(ExprError::Parse("unterminated string literal".to_string()));
                }
                tokens.push(Tok::Str(text));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                ident.push(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        ident.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Tok::Ident(ident));
            }
            other => {
                return Err(ExprError::Parse(format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: Tok, context: &str) -> Result<(), ExprError> {
        match self.advance() {
            Some(found) if found == want => Ok(()),
            _ => Err(ExprError::Parse(context.to_string())),
        }
    }

    fn expect_ident(&mut self, context: &str) -> Result<String, ExprError> {
        match self.advance() {
            Some(Tok::Ident(name)) => Ok(name),
            _ => Err(ExprError::Parse(context.to_string())),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_primary()?;
        while matches!(self.peek(), Some(Tok::Plus)) {
            self.advance();
            let rhs = self.parse_primary()?;
            lhs = Expr::Concat(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Tok::Str(text)) => Ok(Expr::Str(text)),
            Some(Tok::Dollar) => self.parse_task_path(),
            Some(Tok::Ident(name)) => {
                if matches!(self.peek(), Some(Tok::Dot)) {
                    if name != "self" {
                        // Dotted paths are only valid as self.<field> or
                        // $.<task>.output.<field>.
                        return Err(ExprError::UnknownVariable);
                    }
                    self.advance();
                    let field = self.expect_ident("expected field name after 'self.'")?;
                    if matches!(self.peek(), Some(Tok::Dot)) {
                        return Err(ExprError::Parse(
                            "self reference takes a single field".to_string(),
                        ));
                    }
                    Ok(Expr::SelfField(field))
                } else {
                    Ok(Expr::Param(name))
                }
            }
            Some(Tok::LBrace) => self.parse_map_index(),
            Some(other) => Err(ExprError::Parse(format!("unexpected token {other:?}"))),
            None => Err(ExprError::Parse("empty expression".to_string())),
        }
    }

    fn parse_task_path(&mut self) -> Result<Expr, ExprError> {
        self.expect(Tok::Dot, "expected '.' after '$'")?;
        let task = self.expect_ident("expected task name after '$.'")?;
        self.expect(Tok::Dot, "expected '.output.<field>' after task name")?;
        let section = self.expect_ident("expected 'output' after task name")?;
        if section == "input" {
            return Err(ExprError::Parse(format!(
                "'$.{task}.input' references another task's input; only outputs can be referenced"
            )));
        }
        if section != "output" {
            return Err(ExprError::Parse(format!(
                "expected 'output' after task name, found '{section}'"
            )));
        }
        self.expect(Tok::Dot, "expected field name after 'output'")?;
        let field = self.expect_ident("expected output field name")?;
        if matches!(self.peek(), Some(Tok::Dot)) {
            return Err(ExprError::Parse(
                "output reference path is too deep; use $.<task>.output.<field>".to_string(),
            ));
        }
        Ok(Expr::TaskOutput { task, field })
    }

    /// Parse `{key: expr, ...}[expr]`; the opening brace is already consumed.
    fn parse_map_index(&mut self) -> Result<Expr, ExprError> {
        let mut entries: Vec<(String, Expr)> = Vec::new();

        if matches!(self.peek(), Some(Tok::RBrace)) {
            self.advance();
        } else {
            loop {
                let key = match self.advance() {
                    Some(Tok::Ident(name)) => name,
                    Some(Tok::Str(text)) => text,
                    _ => {
                        return Err(ExprError::Parse(
                            "expected map key (identifier or string)".to_string(),
                        ))
                    }
                };
                if entries.iter().any(|(existing, _)| *existing == key) {
                    return Err(ExprError::Parse(format!("duplicate map key '{key}'")));
                }
                self.expect(Tok::Colon, "expected ':' after map key")?;
                let value = self.parse_expr()?;
                entries.push((key, value));

                match self.advance() {
                    Some(Tok::Comma) => {
                        // Trailing comma before the closing brace is fine.
                        if matches!(self.peek(), Some(Tok::RBrace)) {
                            self.advance();
                            break;
                        }
                    }
                    Some(Tok::RBrace) => break,
                    _ => {
                        return Err(ExprError::Parse(
                            "expected ',' or '}' in map literal".to_string(),
                        ))
                    }
                }
            }
        }

        self.expect(
            Tok::LBracket,
            "map literal must be indexed with [<expr>]",
        )?;
        let key = self.parse_expr()?;
        self.expect(Tok::RBracket, "expected ']' after map index")?;
        Ok(Expr::MapIndex {
            entries,
            key: Box::new(key),
        })
    }
}

/// Parse one marker's text into an expression tree
pub fn parse(marker: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(marker)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Parse(format!(
            "unexpected trailing tokens after expression: {:?}",
            &parser.tokens[parser.pos..]
        )));
    }
    Ok(expr)
}

/// Process-wide cache of parsed expressions, keyed by marker text
static PARSE_CACHE: Lazy<DashMap<String, Arc<Expr>>> = Lazy::new(DashMap::new);

/// Parse with caching; identical marker text shares one parsed tree
pub fn parse_cached(marker: &str) -> Result<Arc<Expr>, ExprError> {
    if let Some(cached) = PARSE_CACHE.get(marker) {
        return Ok(Arc::clone(&cached));
    }
    let expr = Arc::new(parse(marker)?);
    PARSE_CACHE.insert(marker.to_string(), Arc::clone(&expr));
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_param() {
        assert_eq!(parse("locale").unwrap(), Expr::Param("locale".to_string()));
    }

    #[test]
    fn parse_self_field() {
        assert_eq!(
            parse("self.model").unwrap(),
            Expr::SelfField("model".to_string())
        );
    }

    #[test]
    fn parse_task_output_ref() {
        assert_eq!(
            parse("$.fetch_data.output.train").unwrap(),
            Expr::TaskOutput {
                task: "fetch_data".to_string(),
                field: "train".to_string(),
            }
        );
    }

    #[test]
    fn parse_string_literal_with_escapes() {
        assert_eq!(
            parse(r#""a \"b\" \\ c""#).unwrap(),
            Expr::Str(r#"a "b" \ c"#.to_string())
        );
    }

    #[test]
    fn concat_is_left_associative() {
        let expr = parse(r#"locale + "-" + self.model"#).unwrap();
        match expr {
            Expr::Concat(left, right) => {
                assert!(matches!(*left, Expr::Concat(_, _)));
                assert_eq!(*right, Expr::SelfField("model".to_string()));
            }
            other => panic!("expected Concat, got {other:?}"),
        }
    }

    #[test]
    fn parse_map_index() {
        let expr = parse(
            "{train: $.fetch_data.output.train, dev: $.fetch_data.output.dev}[analysis_fork]",
        )
        .unwrap();
        match expr {
            Expr::MapIndex { entries, key } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].0, "train");
                assert_eq!(entries[1].0, "dev");
                assert_eq!(*key, Expr::Param("analysis_fork".to_string()));
            }
            other => panic!("expected MapIndex, got {other:?}"),
        }
    }

    #[test]
    fn map_index_accepts_quoted_keys_and_trailing_comma() {
        let expr = parse(r#"{"train": "a", "dev": "b",}["dev"]"#).unwrap();
        match expr {
            Expr::MapIndex { entries, key } => {
                assert_eq!(entries[1].0, "dev");
                assert_eq!(*key, Expr::Str("dev".to_string()));
            }
            other => panic!("expected MapIndex, got {other:?}"),
        }
    }

    #[test]
    fn map_literal_without_index_is_an_error() {
        assert!(matches!(
            parse("{train: \"a\"}"),
            Err(ExprError::Parse(msg)) if msg.contains("indexed")
        ));
    }

    #[test]
    fn duplicate_map_key_is_an_error() {
        assert!(matches!(
            parse(r#"{a: "x", a: "y"}[k]"#),
            Err(ExprError::Parse(msg)) if msg.contains("duplicate")
        ));
    }

    #[test]
    fn input_reference_is_rejected() {
        let err = parse("$.train.input.model").unwrap_err();
        assert!(matches!(err, ExprError::Parse(msg) if msg.contains("input")));
    }

    #[test]
    fn deep_output_path_is_rejected() {
        assert!(parse("$.train.output.model.layers").is_err());
    }

    #[test]
    fn dotted_identifier_is_unknown_variable() {
        assert!(matches!(
            parse("config.model"),
            Err(ExprError::UnknownVariable)
        ));
    }

    #[test]
    fn self_path_takes_a_single_field() {
        assert!(parse("self.config.model").is_err());
    }

    #[test]
    fn empty_marker_is_an_error() {
        assert!(parse("   ").is_err());
    }

    #[test]
    fn trailing_tokens_are_rejected() {
        assert!(parse("locale locale").is_err());
    }

    #[test]
    fn unterminated_string_is_rejected() {
        assert!(parse("\"abc").is_err());
    }

    #[test]
    fn cache_reuse() {
        let first = parse_cached("$.fetch_data.output.dev").unwrap();
        let second = parse_cached("$.fetch_data.output.dev").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn for_each_task_ref_walks_nested_forms() {
        let expr = parse(
            "{train: $.a.output.x, dev: $.b.output.y}[$.c.output.fork] + $.d.output.tail",
        )
        .unwrap();
        let mut seen = Vec::new();
        expr.for_each_task_ref(&mut |task, field| seen.push((task.to_string(), field.to_string())));
        let tasks: Vec<_> = seen.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(tasks, vec!["a", "b", "c", "d"]);
    }
}
