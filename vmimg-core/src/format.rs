//! Percent-style output templates for query results
//!
//! `%(field)[flags][width][.precision]conv` where flags are any of `-`, `0`,
//! ` `, `+` and conv is `s`, `r` or `d`. `%%` is a literal percent sign.

use crate::catalog::FlattenedRecord;
use crate::error::{MirrorError, Result};
use serde_json::Value;
use std::iter::Peekable;
use std::str::{Chars, FromStr};

/// Template used when none is given
pub const DEFAULT_FORMAT: &str = "%(release)-7s %(arch)-8s %(version_name)s %(ftype)-10s %(path)s";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Str,
    Repr,
    Int,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Directive {
    field: String,
    left: bool,
    zero: bool,
    sign: Option<char>,
    width: usize,
    precision: Option<usize>,
    conversion: Conversion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Directive),
}

/// A parsed output template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(template: &str) -> Result<Self> {
        let bad = |reason: &str| MirrorError::Format {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => literal.push('%'),
                Some('(') => {
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some(')') => break,
                            Some(ch) => field.push(ch),
                            None => return Err(bad("unterminated field name")),
                        }
                    }
                    if field.is_empty() {
                        return Err(bad("empty field name"));
                    }
                    let directive = parse_directive(field, &mut chars).map_err(|r| bad(&r))?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(directive));
                }
                Some(other) => {
                    return Err(bad(&format!("only named directives are supported, found %{}", other)));
                }
                None => return Err(bad("trailing %")),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Field names referenced by the template, in order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(d) => Some(d.field.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn render(&self, record: &FlattenedRecord) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field(d) => out.push_str(&self.render_field(d, record)?),
            }
        }
        Ok(out)
    }

    fn render_field(&self, d: &Directive, record: &FlattenedRecord) -> Result<String> {
        let value = record
            .get(&d.field)
            .filter(|v| !v.is_null())
            .ok_or_else(|| MirrorError::MissingField {
                field: d.field.clone(),
            })?;

        let body = match d.conversion {
            Conversion::Str => truncate(scalar_text(value), d.precision),
            Conversion::Repr => truncate(repr(value), d.precision),
            Conversion::Int => {
                let n = int_value(value).ok_or_else(|| MirrorError::Format {
                    template: self.source.clone(),
                    reason: format!("%d needs a number, field {:?} is {}", d.field, value),
                })?;
                let mut digits = n.unsigned_abs().to_string();
                if let Some(p) = d.precision {
                    if digits.len() < p {
                        digits = format!("{}{}", "0".repeat(p - digits.len()), digits);
                    }
                }
                let sign = if n < 0 {
                    "-".to_string()
                } else {
                    d.sign.map(String::from).unwrap_or_default()
                };
                if d.zero && !d.left && sign.len() + digits.len() < d.width {
                    let fill = d.width - sign.len() - digits.len();
                    format!("{}{}{}", sign, "0".repeat(fill), digits)
                } else {
                    format!("{}{}", sign, digits)
                }
            }
        };
        Ok(pad(body, d.width, d.left))
    }
}

impl FromStr for Template {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Parse and render in one go.
pub fn render(template: &str, record: &FlattenedRecord) -> Result<String> {
    Template::parse(template)?.render(record)
}

fn parse_directive(field: String, chars: &mut Peekable<Chars<'_>>) -> std::result::Result<Directive, String> {
    let mut left = false;
    let mut zero = false;
    let mut sign = None;
    while let Some(&f) = chars.peek() {
        match f {
            '-' => left = true,
            '0' => zero = true,
            '+' => sign = Some('+'),
            ' ' => {
                if sign.is_none() {
                    sign = Some(' ');
                }
            }
            _ => break,
        }
        chars.next();
    }
    let width = take_number(chars).unwrap_or(0);
    let precision = if chars.peek() == Some(&'.') {
        chars.next();
        Some(take_number(chars).unwrap_or(0))
    } else {
        None
    };
    let conversion = match chars.next() {
        Some('s') => Conversion::Str,
        Some('r') => Conversion::Repr,
        Some('d') | Some('i') => Conversion::Int,
        Some(c) => return Err(format!("unsupported conversion {:?} for field {:?}", c, field)),
        None => return Err(format!("missing conversion for field {:?}", field)),
    };
    Ok(Directive {
        field,
        left,
        zero,
        sign,
        width,
        precision,
        conversion,
    })
}

fn take_number(chars: &mut Peekable<Chars<'_>>) -> Option<usize> {
    let mut n: Option<usize> = None;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        n = Some(n.unwrap_or(0).saturating_mul(10).saturating_add(d as usize));
        chars.next();
    }
    n
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn repr(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        other => other.to_string(),
    }
}

fn int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn truncate(s: String, precision: Option<usize>) -> String {
    match precision {
        Some(p) if s.chars().count() > p => s.chars().take(p).collect(),
        _ => s,
    }
}

fn pad(s: String, width: usize, left: bool) -> String {
    let len = s.chars().count();
    if len >= width {
        return s;
    }
    let fill = " ".repeat(width - len);
    if left {
        s + &fill
    } else {
        fill + &s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> FlattenedRecord {
        let mut r = FlattenedRecord::new();
        r.insert("release", json!("focal"));
        r.insert("arch", json!("amd64"));
        r.insert("version_name", json!("20200423"));
        r.insert("ftype", json!("root-image.gz"));
        r.insert("path", json!("focal/amd64/20200423/root-image.gz"));
        r.insert("size", json!(1234));
        r.insert("neg", json!(-5));
        r
    }

    #[test]
    fn test_default_format() {
        let line = render(DEFAULT_FORMAT, &record()).unwrap();
        assert_eq!(
            line,
            "focal   amd64    20200423 root-image.gz focal/amd64/20200423/root-image.gz"
        );
    }

    #[test]
    fn test_width_and_alignment() {
        let r = record();
        assert_eq!(render("[%(arch)8s]", &r).unwrap(), "[   amd64]");
        assert_eq!(render("[%(arch)-8s]", &r).unwrap(), "[amd64   ]");
        assert_eq!(render("[%(release).3s]", &r).unwrap(), "[foc]");
        assert_eq!(render("100%% %(arch)r", &r).unwrap(), "100% 'amd64'");
    }

    #[test]
    fn test_integer_conversion() {
        let r = record();
        assert_eq!(render("%(size)08d", &r).unwrap(), "00001234");
        assert_eq!(render("%(size)+d", &r).unwrap(), "+1234");
        assert_eq!(render("%(neg)05d", &r).unwrap(), "-0005");
        assert_eq!(render("%(size)-6d|", &r).unwrap(), "1234  |");
        assert_eq!(render("%(size)s", &r).unwrap(), "1234");
        assert!(matches!(
            render("%(arch)d", &r),
            Err(MirrorError::Format { .. })
        ));
    }

    #[test]
    fn test_missing_field() {
        let err = render("%(subarch)s", &record()).unwrap_err();
        match err {
            MirrorError::MissingField { field } => assert_eq!(field, "subarch"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_templates() {
        for bad in ["%(arch", "%s", "%(arch)", "%(arch)x", "50%", "%()s"] {
            assert!(
                matches!(Template::parse(bad), Err(MirrorError::Format { .. })),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn test_fields_listed_in_order() {
        let t: Template = DEFAULT_FORMAT.parse().unwrap();
        let fields: Vec<_> = t.fields().collect();
        assert_eq!(fields, vec!["release", "arch", "version_name", "ftype", "path"]);
        assert_eq!(t.as_str(), DEFAULT_FORMAT);
    }
}
