//! Predicate filter engine
//!
//! Filter expressions come in two forms:
//!
//! ```text
//! field=value     exact string match
//! field~regex     regular expression match, e.g. arch~(amd64|i386)
//! ```
//!
//! A [`FilterSet`] is the conjunction of its predicates. Regex predicates
//! are always anchored at both ends: `arch~amd` does not match `amd64`.
//! A predicate never matches a record that lacks its field, even when the
//! expected value is empty.

use crate::catalog::FlattenedRecord;
use crate::error::{MirrorError, Result};
use regex::Regex;
use std::fmt;

/// A single field predicate
#[derive(Debug, Clone)]
pub enum Predicate {
    /// `field=value`
    Exact { field: String, value: String },
    /// `field~pattern`, compiled as `^(?:pattern)$`
    Regex {
        field: String,
        pattern: String,
        compiled: Regex,
    },
}

impl Predicate {
    /// Parse a filter expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let op_pos = expr
            .find(['=', '~'])
            .ok_or_else(|| MirrorError::MalformedFilter(expr.to_string()))?;
        let field = expr[..op_pos].trim();
        let rhs = expr[op_pos + 1..].trim();

        if field.is_empty() || !field.chars().all(is_field_char) {
            return Err(MirrorError::MalformedFilter(expr.to_string()));
        }

        match &expr[op_pos..op_pos + 1] {
            "=" => Ok(Predicate::Exact {
                field: field.to_string(),
                value: rhs.to_string(),
            }),
            _ => {
                if rhs.is_empty() {
                    return Err(MirrorError::MalformedFilter(expr.to_string()));
                }
                let compiled = Regex::new(&format!("^(?:{})$", rhs)).map_err(|source| {
                    MirrorError::InvalidPattern {
                        expr: expr.to_string(),
                        source,
                    }
                })?;
                Ok(Predicate::Regex {
                    field: field.to_string(),
                    pattern: rhs.to_string(),
                    compiled,
                })
            }
        }
    }

    /// Field this predicate inspects
    pub fn field(&self) -> &str {
        match self {
            Predicate::Exact { field, .. } | Predicate::Regex { field, .. } => field,
        }
    }

    /// Evaluate against one flattened record.
    pub fn matches(&self, record: &FlattenedRecord) -> bool {
        let Some(actual) = record.get_str(self.field()) else {
            return false;
        };
        match self {
            Predicate::Exact { value, .. } => actual == *value,
            Predicate::Regex { compiled, .. } => compiled.is_match(&actual),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Exact { field, value } => write!(f, "{}={}", field, value),
            Predicate::Regex { field, pattern, .. } => write!(f, "{}~{}", field, pattern),
        }
    }
}

fn is_field_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

/// Conjunction of predicates. The empty set accepts everything.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    predicates: Vec<Predicate>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every expression, failing on the first malformed one.
    pub fn parse<S: AsRef<str>>(exprs: &[S]) -> Result<Self> {
        let predicates = exprs
            .iter()
            .map(|e| Predicate::parse(e.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { predicates })
    }

    pub fn push(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Predicate> {
        self.predicates.iter()
    }

    /// True iff every predicate matches.
    pub fn evaluate(&self, record: &FlattenedRecord) -> bool {
        self.predicates.iter().all(|p| p.matches(record))
    }
}

impl fmt::Display for FilterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.predicates.iter().map(|p| p.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Build the `arch~(a|b|...)` predicate used by `mirror`.
pub fn arch_predicate<S: AsRef<str>>(arches: &[S]) -> Result<Predicate> {
    let alternatives: Vec<String> = arches.iter().map(|a| regex::escape(a.as_ref())).collect();
    Predicate::parse(&format!("arch~({})", alternatives.join("|")))
}
