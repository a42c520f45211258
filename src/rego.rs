//! Serde model of the policy engine's partial evaluation output.
//!
//! Terms use the engine's JSON encoding, `{"type": "...", "value": ...}`.
//! Only the shapes that can show up in residual queries are modelled.

use serde::Deserialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawTerm")]
pub enum Term {
    Null,
    Boolean(bool),
    Number(serde_json::Number),
    String(String),
    Var(String),
    Ref(Vec<Term>),
    Call(Vec<Term>),
    Array(Vec<Term>),
    Set(Vec<Term>),
    Object(Vec<(Term, Term)>),
}

#[derive(Deserialize)]
struct RawTerm {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: serde_json::Value,
}

impl TryFrom<RawTerm> for Term {
    type Error = serde_json::Error;

    fn try_from(raw: RawTerm) -> Result<Self, Self::Error> {
        use serde_json::from_value;

        Ok(match raw.kind.as_str() {
            "null" => Term::Null,
            "boolean" => Term::Boolean(from_value(raw.value)?),
            "number" => Term::Number(from_value(raw.value)?),
            "string" => Term::String(from_value(raw.value)?),
            "var" => Term::Var(from_value(raw.value)?),
            "ref" => Term::Ref(from_value(raw.value)?),
            "call" => Term::Call(from_value(raw.value)?),
            "array" => Term::Array(from_value(raw.value)?),
            "set" => Term::Set(from_value(raw.value)?),
            "object" => Term::Object(from_value(raw.value)?),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "unknown term type `{}`",
                    other
                )))
            }
        })
    }
}

impl Term {
    pub fn var(name: impl Into<String>) -> Self {
        Term::Var(name.into())
    }

    pub fn string(value: impl Into<String>) -> Self {
        Term::String(value.into())
    }

    pub fn number(value: i64) -> Self {
        Term::Number(value.into())
    }

    /// Builds a reference like `data.pg.users[$0].id` from a var head and
    /// string segments, with `[name]` segments becoming vars.
    pub fn reference(path: &[&str]) -> Self {
        let mut segments = Vec::with_capacity(path.len());
        for (i, part) in path.iter().enumerate() {
            if i == 0 {
                segments.push(Term::var(*part));
            } else if let Some(var) = part.strip_prefix('[').and_then(|p| p.strip_suffix(']')) {
                segments.push(Term::var(var));
            } else {
                segments.push(Term::string(*part));
            }
        }
        Term::Ref(segments)
    }

    pub fn as_ref_segments(&self) -> Option<&[Term]> {
        match self {
            Term::Ref(segments) => Some(segments),
            _ => None,
        }
    }

    /// Name of a reference or var segment as it appears in a path.
    pub fn segment_name(&self) -> Option<&str> {
        match self {
            Term::Var(name) | Term::String(name) => Some(name),
            _ => None,
        }
    }

    /// Dotted name of an operator reference, e.g. `internal.member_2`.
    pub fn operator_name(&self) -> Option<String> {
        let segments = self.as_ref_segments()?;
        let mut parts = Vec::with_capacity(segments.len());
        for segment in segments {
            parts.push(segment.segment_name()?);
        }
        Some(parts.join("."))
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn write_terms(f: &mut fmt::Formatter<'_>, terms: &[Term]) -> fmt::Result {
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", term)?;
    }
    Ok(())
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Null => write!(f, "null"),
            Term::Boolean(b) => write!(f, "{}", b),
            Term::Number(n) => write!(f, "{}", n),
            Term::String(s) => write!(f, "{:?}", s),
            Term::Var(v) => write!(f, "{}", v),
            Term::Ref(segments) => {
                for (i, segment) in segments.iter().enumerate() {
                    match segment {
                        Term::Var(v) if i == 0 => write!(f, "{}", v)?,
                        Term::String(s) if i > 0 && is_identifier(s) => write!(f, ".{}", s)?,
                        other => write!(f, "[{}]", other)?,
                    }
                }
                Ok(())
            }
            Term::Call(terms) => match terms.split_first() {
                Some((op, args)) => {
                    write!(f, "{}(", op)?;
                    write_terms(f, args)?;
                    write!(f, ")")
                }
                None => write!(f, "()"),
            },
            Term::Array(items) => {
                write!(f, "[")?;
                write_terms(f, items)?;
                write!(f, "]")
            }
            Term::Set(items) => {
                write!(f, "{{")?;
                write_terms(f, items)?;
                write!(f, "}}")
            }
            Term::Object(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Terms of an expression: either an operator call or a single term.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ExprTerms {
    Call(Vec<Term>),
    Term(Term),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Expr {
    #[serde(default)]
    pub index: usize,
    pub terms: ExprTerms,
    #[serde(default)]
    pub negated: bool,
}

impl Expr {
    pub fn call(operator: &str, args: Vec<Term>) -> Self {
        let mut terms = Vec::with_capacity(args.len() + 1);
        terms.push(Term::reference(&[operator]));
        terms.extend(args);
        Self {
            index: 0,
            terms: ExprTerms::Call(terms),
            negated: false,
        }
    }

    pub fn operator(&self) -> Option<String> {
        match &self.terms {
            ExprTerms::Call(terms) => terms.first()?.operator_name(),
            ExprTerms::Term(_) => None,
        }
    }

    pub fn operands(&self) -> &[Term] {
        match &self.terms {
            ExprTerms::Call(terms) if !terms.is_empty() => &terms[1..],
            _ => &[],
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "not ")?;
        }
        match &self.terms {
            ExprTerms::Call(terms) => match terms.split_first() {
                Some((op, args)) => {
                    write!(f, "{}(", op)?;
                    write_terms(f, args)?;
                    write!(f, ")")
                }
                None => Ok(()),
            },
            ExprTerms::Term(term) => write!(f, "{}", term),
        }
    }
}

/// One disjunct of the residual policy: all expressions must hold.
pub type Body = Vec<Expr>;

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct PartialQueries {
    #[serde(default)]
    pub queries: Vec<Body>,
    #[serde(default)]
    pub support: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct CompileResponse {
    result: PartialQueries,
}

impl PartialQueries {
    /// Accepts either the bare object or the `{"result": ...}` envelope
    /// returned by the compile API.
    pub fn from_json_str(input: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(input)?;
        if value.get("result").is_some() {
            let response: CompileResponse = serde_json::from_value(value)?;
            return Ok(response.result);
        }
        serde_json::from_value(value)
    }
}
