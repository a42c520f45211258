//! Builds the Query-AST from preprocessed bodies.

use crate::ast::{
    Attribute, Call, Clause, Condition, Conjunction, Constant, Entity, Join, Link, Operand, Query,
    Union,
};
use crate::error::TranslationError;
use crate::rego::{Body, Expr, Term};
use crate::stack::OperandStack;
use indexmap::{IndexMap, IndexSet};

#[derive(Debug, Clone, Default)]
pub struct Processor {
    skip_unknown: bool,
}

/// Accumulators for a single body.
#[derive(Debug, Default)]
struct BodyState {
    from: Option<Entity>,
    /// linked entity -> relations joining it to earlier entities
    linked: IndexMap<String, Vec<Clause>>,
    conjunctions: Vec<Clause>,
    /// entities touched by the current expression
    entities: IndexSet<String>,
    operands: OperandStack<Operand>,
}

impl Processor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log and drop unsupported expressions and terms instead of failing.
    pub fn with_skip_unknown(mut self, skip_unknown: bool) -> Self {
        self.skip_unknown = skip_unknown;
        self
    }

    /// One Query per body, in input order.
    pub fn process(&self, bodies: &[Body]) -> Result<Union, TranslationError> {
        let mut clauses = Vec::with_capacity(bodies.len());
        for (index, body) in bodies.iter().enumerate() {
            let query = self.process_body(index, body)?;
            tracing::debug!(body = index, query = %query, "processed body");
            clauses.push(query);
        }
        Ok(Union { clauses })
    }

    fn process_body(&self, index: usize, body: &Body) -> Result<Query, TranslationError> {
        let mut state = BodyState::default();

        for expr in body {
            self.translate_expr(expr, &mut state)?;
        }

        let from = state
            .from
            .ok_or(TranslationError::MissingRootEntity(index))?;

        let joins = state
            .linked
            .into_iter()
            .map(|(name, mut relations)| {
                let condition = match relations.len() {
                    0 => None,
                    1 => relations.pop().map(|clause| Condition { clause }),
                    _ => Some(Condition {
                        clause: Clause::Conjunction(Conjunction { clauses: relations }),
                    }),
                };
                Join {
                    entity: Entity::new(name),
                    condition,
                }
            })
            .collect();

        Ok(Query {
            from,
            link: Link { joins },
            condition: Condition {
                clause: Clause::Conjunction(Conjunction {
                    clauses: state.conjunctions,
                }),
            },
        })
    }

    fn unsupported(&self, err: TranslationError) -> Result<(), TranslationError> {
        if self.skip_unknown {
            tracing::warn!(error = %err, "skipping unsupported node");
            Ok(())
        } else {
            Err(err)
        }
    }

    fn translate_expr(&self, expr: &Expr, state: &mut BodyState) -> Result<(), TranslationError> {
        let operator = match expr.operator() {
            Some(op) if !expr.negated => op,
            _ => return self.unsupported(TranslationError::UnsupportedExpression(expr.to_string())),
        };

        state.entities.clear();
        state.operands.push_frame();
        for term in expr.operands() {
            self.translate_term(term, state)?;
        }
        let operands = state.operands.pop_frame()?;
        let relation = Clause::Call(Call::new(operator, operands));

        if state.entities.len() > 1 {
            // attach to the entity introduced last so the predicate only
            // refers to tables that are already joined
            let target = state
                .entities
                .iter()
                .filter_map(|name| state.linked.get_index_of(name))
                .max();
            match target.and_then(|i| state.linked.get_index_mut(i)) {
                Some((_, relations)) => relations.push(relation),
                None => state.conjunctions.push(relation),
            }
        } else {
            state.conjunctions.push(relation);
        }
        state.entities.clear();
        Ok(())
    }

    fn translate_term(&self, term: &Term, state: &mut BodyState) -> Result<(), TranslationError> {
        match term {
            Term::Boolean(b) => {
                state
                    .operands
                    .append_to_top(Operand::Constant(Constant::classify(&b.to_string())))
            }
            Term::Number(n) => {
                state
                    .operands
                    .append_to_top(Operand::Constant(Constant::classify(&n.to_string())))
            }
            Term::String(s) => state
                .operands
                .append_to_top(Operand::Constant(Constant::string(s))),
            Term::Ref(segments) if segments.len() == 3 => {
                let (Some(entity), Some(column)) =
                    (segments[1].segment_name(), segments[2].segment_name())
                else {
                    return self.unsupported(TranslationError::UnsupportedTerm(term.to_string()));
                };
                let entity = entity.replace('"', "");
                let column = column.replace('"', "");
                self.see_entity(&entity, state);
                state
                    .operands
                    .append_to_top(Operand::Attribute(Attribute::new(entity, column)))
            }
            Term::Call(terms) => {
                let Some(operator) = terms.first().and_then(Term::operator_name) else {
                    return self.unsupported(TranslationError::UnsupportedTerm(term.to_string()));
                };
                state.operands.push_frame();
                for arg in &terms[1..] {
                    self.translate_term(arg, state)?;
                }
                let operands = state.operands.pop_frame()?;
                state
                    .operands
                    .append_to_top(Operand::Call(Call::new(operator, operands)))
            }
            other => self.unsupported(TranslationError::UnsupportedTerm(other.to_string())),
        }
    }

    fn see_entity(&self, name: &str, state: &mut BodyState) {
        state.entities.insert(name.to_string());
        match &state.from {
            None => state.from = Some(Entity::new(name)),
            Some(from) if from.name == name => {}
            Some(_) => {
                if !state.linked.contains_key(name) {
                    state.linked.insert(name.to_string(), Vec::new());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ConstantKind;

    fn att(table: &str, col: &str) -> Term {
        Term::reference(&["data", table, col])
    }

    #[test]
    fn test_single_entity_body() {
        let body = vec![Expr::call("eq", vec![att("users", "id"), Term::number(5)])];
        let union = Processor::new().process(&[body]).unwrap();
        assert_eq!(union.clauses.len(), 1);

        let query = &union.clauses[0];
        assert_eq!(query.from, Entity::new("users"));
        assert!(query.link.joins.is_empty());
        assert_eq!(
            query.condition.to_string(),
            "cond(conj(eq(att(users.id), 5)))"
        );
    }

    #[test]
    fn test_constants_are_classified() {
        let body = vec![Expr::call(
            "eq",
            vec![att("users", "name"), Term::string("5")],
        )];
        let union = Processor::new().process(&[body]).unwrap();
        let Clause::Conjunction(conj) = &union.clauses[0].condition.clause else {
            panic!("expected conjunction");
        };
        let Clause::Call(call) = &conj.clauses[0] else {
            panic!("expected call");
        };
        let Operand::Constant(constant) = &call.operands[1] else {
            panic!("expected constant");
        };
        assert_eq!(constant.kind, ConstantKind::Integer);
    }

    #[test]
    fn test_join_relation_attached_to_latest_entity() {
        let body = vec![
            Expr::call("eq", vec![att("apps", "owner"), att("users", "id")]),
            Expr::call("eq", vec![att("users", "name"), Term::string("bob")]),
            Expr::call("eq", vec![att("rights", "app"), att("apps", "id")]),
            Expr::call("eq", vec![att("rights", "level"), Term::number(3)]),
        ];
        let union = Processor::new().process(&[body]).unwrap();
        let query = &union.clauses[0];

        assert_eq!(query.from, Entity::new("apps"));
        assert_eq!(
            query.link.to_string(),
            "link([users on cond(eq(att(apps.owner), att(users.id))), rights on cond(eq(att(rights.app), att(apps.id)))])"
        );
        assert_eq!(
            query.condition.to_string(),
            "cond(conj(eq(att(users.name), \"bob\"), eq(att(rights.level), 3)))"
        );
    }

    #[test]
    fn test_linked_entity_without_relation() {
        let body = vec![
            Expr::call("eq", vec![att("users", "id"), Term::number(1)]),
            Expr::call("eq", vec![att("apps", "id"), Term::number(2)]),
        ];
        let union = Processor::new().process(&[body]).unwrap();
        let joins = &union.clauses[0].link.joins;
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].entity, Entity::new("apps"));
        assert!(joins[0].condition.is_none());
    }

    #[test]
    fn test_nested_calls() {
        let body = vec![Expr::call(
            "eq",
            vec![
                Term::Call(vec![Term::reference(&["abs"]), att("users", "balance")]),
                Term::number(3),
            ],
        )];
        let union = Processor::new().process(&[body]).unwrap();
        assert_eq!(
            union.clauses[0].condition.to_string(),
            "cond(conj(eq(abs(att(users.balance)), 3)))"
        );
    }

    #[test]
    fn test_unsupported_expression() {
        let body = vec![Expr {
            index: 0,
            terms: crate::rego::ExprTerms::Term(att("users", "active")),
            negated: false,
        }];
        let err = Processor::new().process(&[body.clone()]).unwrap_err();
        assert!(matches!(err, TranslationError::UnsupportedExpression(_)));

        let mut negated = Expr::call("eq", vec![att("users", "id"), Term::number(1)]);
        negated.negated = true;
        let err = Processor::new().process(&[vec![negated]]).unwrap_err();
        assert!(matches!(err, TranslationError::UnsupportedExpression(_)));
    }

    #[test]
    fn test_skip_unknown() {
        let body = vec![
            Expr {
                index: 0,
                terms: crate::rego::ExprTerms::Term(att("users", "active")),
                negated: false,
            },
            Expr::call("eq", vec![att("users", "id"), Term::Null]),
        ];
        let union = Processor::new()
            .with_skip_unknown(true)
            .process(&[body])
            .unwrap();
        assert_eq!(
            union.clauses[0].condition.to_string(),
            "cond(conj(eq(att(users.id))))"
        );
    }

    #[test]
    fn test_unsupported_term() {
        let body = vec![Expr::call("eq", vec![att("users", "id"), Term::Null])];
        let err = Processor::new().process(&[body]).unwrap_err();
        assert_eq!(err, TranslationError::UnsupportedTerm("null".to_string()));
    }

    #[test]
    fn test_missing_root_entity() {
        let body = vec![Expr::call("eq", vec![Term::number(1), Term::number(1)])];
        let err = Processor::new().process(&[body]).unwrap_err();
        assert_eq!(err, TranslationError::MissingRootEntity(0));
    }

    #[test]
    fn test_one_query_per_body() {
        let first = vec![Expr::call("eq", vec![att("users", "id"), Term::number(1)])];
        let second = vec![Expr::call("eq", vec![att("apps", "id"), Term::number(2)])];
        let union = Processor::new().process(&[first, second]).unwrap();
        assert_eq!(union.clauses.len(), 2);
        assert_eq!(union.clauses[0].from.name, "users");
        assert_eq!(union.clauses[1].from.name, "apps");
    }
}
