//! Rewrites datastore references in residual policy bodies.
//!
//! `data.<ds>.<table>[<iter>].<column>` becomes `data.<table>.<column>`,
//! iterator-headed references (`<iter>.<column>`) are expanded, and local
//! variable declarations `eq(<var>, <ref>)` are inlined into later
//! expressions.

use crate::error::TranslationError;
use crate::rego::{Body, Expr, ExprTerms, Term};
use std::collections::HashMap;

/// Per-body bookkeeping; reset for every body.
#[derive(Debug, Default)]
struct BodyScope {
    /// iterator var -> canonical prefix `[data, <table>]`
    table_vars: HashMap<String, Vec<Term>>,
    /// table -> iterator var that first bound it
    table_names: HashMap<String, String>,
    /// local var -> declared reference
    local_vars: HashMap<String, Term>,
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    datastore: String,
}

impl Preprocessor {
    pub fn new(datastore: impl Into<String>) -> Self {
        Self {
            datastore: datastore.into(),
        }
    }

    pub fn process(&self, queries: &[Body]) -> Result<Vec<Body>, TranslationError> {
        let mut transformed = Vec::with_capacity(queries.len());
        for body in queries {
            transformed.push(self.process_body(body)?);
        }
        Ok(transformed)
    }

    fn process_body(&self, body: &Body) -> Result<Body, TranslationError> {
        let mut scope = BodyScope::default();
        let mut exprs = Vec::with_capacity(body.len());

        for expr in body {
            tracing::trace!(expr = %expr, "preprocessing expression");
            match &expr.terms {
                ExprTerms::Call(terms) if !terms.is_empty() => {
                    let mut rewritten = Vec::with_capacity(terms.len());
                    rewritten.push(terms[0].clone());
                    for operand in &terms[1..] {
                        rewritten.push(self.transform_refs(operand, &mut scope)?);
                    }

                    if let Some((var, reference)) = local_declaration(&rewritten) {
                        scope.local_vars.insert(var, reference);
                        continue;
                    }

                    let mut substituted = Vec::with_capacity(rewritten.len());
                    substituted.push(rewritten[0].clone());
                    for operand in &rewritten[1..] {
                        substituted.push(substitute_vars(operand, &scope)?);
                    }
                    exprs.push(Expr {
                        index: exprs.len(),
                        terms: ExprTerms::Call(substituted),
                        negated: expr.negated,
                    });
                }
                ExprTerms::Call(_) => {}
                ExprTerms::Term(term) => {
                    let term = self.transform_refs(term, &mut scope)?;
                    exprs.push(Expr {
                        index: exprs.len(),
                        terms: ExprTerms::Term(substitute_vars(&term, &scope)?),
                        negated: expr.negated,
                    });
                }
            }
        }
        Ok(exprs)
    }

    fn transform_refs(&self, term: &Term, scope: &mut BodyScope) -> Result<Term, TranslationError> {
        match term {
            Term::Ref(segments) => self.transform_ref(term, segments, scope),
            Term::Call(terms) => {
                let mut out = Vec::with_capacity(terms.len());
                for (i, t) in terms.iter().enumerate() {
                    if i == 0 {
                        out.push(t.clone());
                    } else {
                        out.push(self.transform_refs(t, scope)?);
                    }
                }
                Ok(Term::Call(out))
            }
            Term::Array(items) => Ok(Term::Array(
                items
                    .iter()
                    .map(|t| self.transform_refs(t, scope))
                    .collect::<Result<_, _>>()?,
            )),
            Term::Set(items) => Ok(Term::Set(
                items
                    .iter()
                    .map(|t| self.transform_refs(t, scope))
                    .collect::<Result<_, _>>()?,
            )),
            other => Ok(other.clone()),
        }
    }

    fn transform_ref(
        &self,
        term: &Term,
        segments: &[Term],
        scope: &mut BodyScope,
    ) -> Result<Term, TranslationError> {
        if segments.len() <= 1 {
            return Ok(term.clone());
        }

        let head = segments[0].segment_name().unwrap_or_default();
        if let Some(prefix) = scope.table_vars.get(head) {
            let mut expanded = prefix.clone();
            expanded.extend_from_slice(&segments[1..]);
            return Ok(Term::Ref(expanded));
        }

        if head != "data" || segments.len() < 4 {
            return Err(TranslationError::InvalidReference(term.to_string()));
        }

        let datastore = segments[1].segment_name().unwrap_or_default();
        if datastore != self.datastore {
            return Err(TranslationError::ReferenceMismatch {
                reference: term.to_string(),
                expected: self.datastore.clone(),
                found: datastore.to_string(),
            });
        }

        let row_id = match &segments[3] {
            Term::Var(v) => v.clone(),
            _ => return Err(TranslationError::UnsupportedRowIdentifier(term.to_string())),
        };

        let table = segments[2]
            .segment_name()
            .ok_or_else(|| TranslationError::InvalidReference(term.to_string()))?
            .to_string();

        if let Some(bound) = scope.table_names.get(&table) {
            if *bound != row_id {
                return Err(TranslationError::SelfLink {
                    table,
                    first: bound.clone(),
                    second: row_id,
                });
            }
        }

        let prefix = vec![segments[0].clone(), Term::String(table.clone())];
        scope.table_vars.insert(row_id.clone(), prefix.clone());
        scope.table_names.insert(table, row_id);

        let mut rewritten = prefix;
        rewritten.extend_from_slice(&segments[4..]);
        Ok(Term::Ref(rewritten))
    }
}

/// `eq(<var>, <ref>)` declares a local variable.
fn local_declaration(terms: &[Term]) -> Option<(String, Term)> {
    if terms.len() != 3 {
        return None;
    }
    if terms[0].operator_name().as_deref() != Some("eq") {
        return None;
    }
    match (&terms[1], &terms[2]) {
        (Term::Var(var), reference @ Term::Ref(_)) => Some((var.clone(), reference.clone())),
        _ => None,
    }
}

fn substitute_vars(term: &Term, scope: &BodyScope) -> Result<Term, TranslationError> {
    match term {
        Term::Var(v) => scope
            .local_vars
            .get(v)
            .cloned()
            .ok_or_else(|| TranslationError::UndefinedVariable(v.clone())),
        Term::Call(terms) => {
            let mut out = Vec::with_capacity(terms.len());
            for (i, t) in terms.iter().enumerate() {
                if i == 0 {
                    out.push(t.clone());
                } else {
                    out.push(substitute_vars(t, scope)?);
                }
            }
            Ok(Term::Call(out))
        }
        other => Ok(other.clone()),
    }
}
