//! Test-and-set selection expressions.
//!
//! A condition guards an update with a predicate over the currently stored
//! document, e.g. `music.plays > 100` or `id.user == 42 and state == 'live'`.
//! The supported grammar is comparisons joined by `and`:
//!
//! ```text
//! selection  := comparison ( "and" comparison )*
//! comparison := path op literal
//! op         := == | != | <= | >= | < | >
//! path       := ident ( "." ident )*
//! literal    := number | 'string' | "string" | true | false | null
//! ```
//!
//! A leading `id` or document-type qualifier on the path is stripped before
//! field lookup. A comparison against an absent field evaluates to false.

use crate::document::fields::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Parse failure for a selection expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("unexpected character {found:?} at offset {offset}")]
    UnexpectedCharacter { found: char, offset: usize },

    #[error("unterminated string literal at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("expected {expected} at offset {offset}")]
    Expected {
        expected: &'static str,
        offset: usize,
    },

    #[error("trailing input at offset {offset}")]
    TrailingInput { offset: usize },

    #[error("empty selection")]
    Empty,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// One parsed comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Dotted field path, qualifier already stripped at evaluation time.
    pub path: String,
    /// The operator.
    pub op: CompareOp,
    /// The literal operand.
    pub literal: Value,
}

/// A parsed selection: comparisons joined by `and`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    comparisons: Vec<Comparison>,
    source: String,
}

impl Selection {
    /// Parse a selection expression.
    pub fn parse(source: &str) -> Result<Self, SelectionError> {
        let mut parser = Parser::new(source);
        let comparisons = parser.parse_selection()?;
        Ok(Self {
            comparisons,
            source: source.to_string(),
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a document. All comparisons must hold.
    pub fn evaluate(&self, document: &Document) -> bool {
        self.comparisons
            .iter()
            .all(|c| evaluate_comparison(c, document))
    }

    /// The parsed comparisons.
    pub fn comparisons(&self) -> &[Comparison] {
        &self.comparisons
    }
}

impl std::fmt::Display for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

fn evaluate_comparison(comparison: &Comparison, document: &Document) -> bool {
    let path = strip_qualifier(&comparison.path, &document.doc_type);
    let Some(actual) = document.field_path(path) else {
        return false;
    };
    match comparison.op {
        CompareOp::Eq => values_equal(actual, &comparison.literal),
        CompareOp::Ne => !values_equal(actual, &comparison.literal),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let Some(ordering) = compare_values(actual, &comparison.literal) else {
                return false;
            };
            match comparison.op {
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }
        }
    }
}

/// Strip a leading `id.` or `<doctype>.` qualifier from a path.
fn strip_qualifier<'a>(path: &'a str, doc_type: &str) -> &'a str {
    if let Some(rest) = path.strip_prefix("id.") {
        return rest;
    }
    if let Some(rest) = path.strip_prefix(doc_type) {
        if let Some(rest) = rest.strip_prefix('.') {
            return rest;
        }
    }
    path
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            input: source.as_bytes(),
            pos: 0,
        }
    }

    fn parse_selection(&mut self) -> Result<Vec<Comparison>, SelectionError> {
        self.skip_whitespace();
        if self.at_end() {
            return Err(SelectionError::Empty);
        }
        let mut comparisons = vec![self.parse_comparison()?];
        loop {
            self.skip_whitespace();
            if self.at_end() {
                return Ok(comparisons);
            }
            if self.take_keyword("and") {
                comparisons.push(self.parse_comparison()?);
            } else {
                return Err(SelectionError::TrailingInput { offset: self.pos });
            }
        }
    }

    fn parse_comparison(&mut self) -> Result<Comparison, SelectionError> {
        self.skip_whitespace();
        let path = self.parse_path()?;
        self.skip_whitespace();
        let op = self.parse_op()?;
        self.skip_whitespace();
        let literal = self.parse_literal()?;
        Ok(Comparison { path, op, literal })
    }

    fn parse_path(&mut self) -> Result<String, SelectionError> {
        let start = self.pos;
        while let Some(&b) = self.input.get(self.pos) {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(SelectionError::Expected {
                expected: "field path",
                offset: start,
            });
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn parse_op(&mut self) -> Result<CompareOp, SelectionError> {
        let two = self.peek_two();
        let op = match two {
            Some((b'=', b'=')) => Some((CompareOp::Eq, 2)),
            Some((b'!', b'=')) => Some((CompareOp::Ne, 2)),
            Some((b'<', b'=')) => Some((CompareOp::Le, 2)),
            Some((b'>', b'=')) => Some((CompareOp::Ge, 2)),
            Some((b'<', _)) => Some((CompareOp::Lt, 1)),
            Some((b'>', _)) => Some((CompareOp::Gt, 1)),
            _ => match self.input.get(self.pos) {
                Some(b'<') => Some((CompareOp::Lt, 1)),
                Some(b'>') => Some((CompareOp::Gt, 1)),
                _ => None,
            },
        };
        match op {
            Some((op, len)) => {
                self.pos += len;
                Ok(op)
            }
            None => Err(SelectionError::Expected {
                expected: "comparison operator",
                offset: self.pos,
            }),
        }
    }

    fn parse_literal(&mut self) -> Result<Value, SelectionError> {
        match self.input.get(self.pos) {
            None => Err(SelectionError::Expected {
                expected: "literal",
                offset: self.pos,
            }),
            Some(&q) if q == b'\'' || q == b'"' => self.parse_string(q),
            Some(b'-') | Some(b'0'..=b'9') => self.parse_number(),
            Some(_) => {
                if self.take_keyword("true") {
                    Ok(Value::Bool(true))
                } else if self.take_keyword("false") {
                    Ok(Value::Bool(false))
                } else if self.take_keyword("null") {
                    Ok(Value::Null)
                } else {
                    Err(SelectionError::UnexpectedCharacter {
                        found: self.input[self.pos] as char,
                        offset: self.pos,
                    })
                }
            }
        }
    }

    fn parse_string(&mut self, quote: u8) -> Result<Value, SelectionError> {
        let start = self.pos;
        self.pos += 1;
        let content_start = self.pos;
        while let Some(&b) = self.input.get(self.pos) {
            if b == quote {
                let content =
                    String::from_utf8_lossy(&self.input[content_start..self.pos]).into_owned();
                self.pos += 1;
                return Ok(Value::String(content));
            }
            self.pos += 1;
        }
        Err(SelectionError::UnterminatedString { offset: start })
    }

    fn parse_number(&mut self) -> Result<Value, SelectionError> {
        let start = self.pos;
        if self.input.get(self.pos) == Some(&b'-') {
            self.pos += 1;
        }
        let mut saw_dot = false;
        while let Some(&b) = self.input.get(self.pos) {
            if b.is_ascii_digit() {
                self.pos += 1;
            } else if b == b'.' && !saw_dot {
                saw_dot = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.input[start..self.pos]).unwrap_or("");
        if saw_dot {
            text.parse::<f64>()
                .ok()
                .and_then(|f| serde_json::Number::from_f64(f))
                .map(Value::Number)
                .ok_or(SelectionError::Expected {
                    expected: "number",
                    offset: start,
                })
        } else {
            text.parse::<i64>()
                .map(Value::from)
                .map_err(|_| SelectionError::Expected {
                    expected: "number",
                    offset: start,
                })
        }
    }

    fn take_keyword(&mut self, keyword: &str) -> bool {
        let bytes = keyword.as_bytes();
        let end = self.pos + bytes.len();
        if self.input.len() >= end && &self.input[self.pos..end] == bytes {
            // Keyword must not run into an identifier tail.
            let boundary = self
                .input
                .get(end)
                .map_or(true, |&b| !(b.is_ascii_alphanumeric() || b == b'_'));
            if boundary {
                self.pos = end;
                self.skip_whitespace();
                return true;
            }
        }
        false
    }

    fn skip_whitespace(&mut self) {
        while self.input.get(self.pos).is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek_two(&self) -> Option<(u8, u8)> {
        match (self.input.get(self.pos), self.input.get(self.pos + 1)) {
            (Some(&a), Some(&b)) => Some((a, b)),
            _ => None,
        }
    }
}
