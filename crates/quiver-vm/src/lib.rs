//! # Quiver VM
//!
//! Compiles boolean predicate expressions against one of five fixed
//! environments and evaluates them over JSON values.
//!
//! A [`Program`] is immutable once compiled and may be shared freely.
//! [`eval`] returns true iff **all** supplied programs evaluate to boolean
//! true; an empty program list is vacuously true; a missing-key selection
//! makes that program false (soft miss) while any other runtime error
//! propagates as [`Error::Internal`].

use std::sync::Arc;

use quiver_types::{Error, Result};
use serde_json::Value;

mod ast;
mod env;
mod eval;
mod parser;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use env::{auth_env, change_env, connection_env, doc_env, message_env};

/// The five expression environments, each declaring a single root
/// variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvKind {
    Doc,
    Connection,
    Auth,
    Message,
    Change,
}

impl EnvKind {
    pub const fn root_var(self) -> &'static str {
        match self {
            EnvKind::Doc => "doc",
            EnvKind::Connection => "connection",
            EnvKind::Auth => "request",
            EnvKind::Message => "message",
            EnvKind::Change => "change",
        }
    }
}

/// A compiled expression bound to its environment.
#[derive(Debug, Clone)]
pub struct Program {
    env: EnvKind,
    source: String,
    expr: Arc<Expr>,
}

impl Program {
    pub fn env(&self) -> EnvKind {
        self.env
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Compile a single expression, failing with
/// [`Error::InvalidExpression`] on parse errors or references to
/// variables the environment does not declare.
pub fn program(env: EnvKind, source: &str) -> Result<Program> {
    if source.trim().is_empty() {
        return Err(Error::InvalidExpression("empty expression".to_string()));
    }
    let expr = parser::parse(source)?;
    for root in expr.root_idents() {
        if root != env.root_var() {
            return Err(Error::InvalidExpression(format!(
                "unknown variable {:?} (environment declares {:?})",
                root,
                env.root_var()
            )));
        }
    }
    Ok(Program { env, source: source.to_string(), expr: Arc::new(expr) })
}

/// Compile a batch of expressions, skipping empty strings.
pub fn programs(env: EnvKind, sources: &[String]) -> Result<Vec<Program>> {
    let mut out = Vec::new();
    for source in sources {
        if source.trim().is_empty() {
            continue;
        }
        out.push(program(env, source)?);
    }
    Ok(out)
}

/// True iff every program evaluates to boolean true against `value`.
pub fn eval(value: &Value, programs: &[Program]) -> Result<bool> {
    for program in programs {
        match eval::eval(&program.expr, value) {
            Ok(Value::Bool(true)) => {}
            Ok(_) => return Ok(false),
            Err(eval::EvalError::NoSuchKey(_)) => return Ok(false),
            Err(eval::EvalError::Runtime(msg)) => return Err(Error::Internal(msg)),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use quiver_types::{Doc, Ref};
    use serde_json::json;

    use super::*;

    fn eval_one(env: EnvKind, source: &str, value: &Value) -> Result<bool> {
        let program = program(env, source).unwrap();
        eval(value, &[program])
    }

    fn dog(weight: i64) -> Value {
        json!({"doc": {
            "ref": {"gtype": "dog", "gid": "charlie"},
            "attributes": {"name": "Charlie", "weight": weight, "tags": ["good", "loud"]},
            "metadata": {"version": 1, "sequence": 1},
        }})
    }

    #[test]
    fn test_comparison_operators() {
        let value = dog(25);
        assert!(eval_one(EnvKind::Doc, "doc.attributes.weight > 20", &value).unwrap());
        assert!(!eval_one(EnvKind::Doc, "doc.attributes.weight < 20", &value).unwrap());
        assert!(eval_one(EnvKind::Doc, "doc.attributes.weight >= 25", &value).unwrap());
        assert!(eval_one(EnvKind::Doc, "doc.attributes.name == 'Charlie'", &value).unwrap());
        assert!(eval_one(EnvKind::Doc, "doc.attributes.name != \"Rex\"", &value).unwrap());
    }

    #[test]
    fn test_boolean_operators() {
        let value = dog(25);
        assert!(eval_one(
            EnvKind::Doc,
            "doc.attributes.weight > 20 && doc.attributes.name == 'Charlie'",
            &value
        )
        .unwrap());
        assert!(eval_one(
            EnvKind::Doc,
            "doc.attributes.weight > 100 || doc.attributes.name.contains('Charl')",
            &value
        )
        .unwrap());
        assert!(!eval_one(EnvKind::Doc, "!(doc.attributes.weight > 20)", &value).unwrap());
    }

    #[test]
    fn test_arithmetic() {
        let value = dog(25);
        assert!(eval_one(EnvKind::Doc, "doc.attributes.weight * 2 == 50", &value).unwrap());
        assert!(eval_one(EnvKind::Doc, "doc.attributes.weight - 5 == 4 * 5", &value).unwrap());
        assert!(eval_one(EnvKind::Doc, "doc.attributes.weight / 2 == 12", &value).unwrap());
        assert!(eval_one(EnvKind::Doc, "doc.attributes.weight + 0.5 == 25.5", &value).unwrap());
        assert!(eval_one(EnvKind::Doc, "-doc.attributes.weight == 0 - 25", &value).unwrap());
    }

    #[test]
    fn test_division_by_zero_is_runtime_error() {
        let err = eval_one(EnvKind::Doc, "doc.attributes.weight / 0 == 1", &dog(25)).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_methods() {
        let value = dog(25);
        assert!(eval_one(EnvKind::Doc, "doc.attributes.name.contains('Charl')", &value).unwrap());
        assert!(eval_one(EnvKind::Doc, "doc.attributes.name.startsWith('Ch')", &value).unwrap());
        assert!(eval_one(EnvKind::Doc, "doc.attributes.name.endsWith('lie')", &value).unwrap());
        assert!(eval_one(EnvKind::Doc, "doc.attributes.tags.size() == 2", &value).unwrap());
        assert!(eval_one(EnvKind::Doc, "doc.attributes.tags.contains('good')", &value).unwrap());
        assert!(eval_one(EnvKind::Doc, "doc.attributes.size() == 3", &value).unwrap());
    }

    #[test]
    fn test_membership() {
        let value = dog(25);
        assert!(eval_one(EnvKind::Doc, "'loud' in doc.attributes.tags", &value).unwrap());
        assert!(!eval_one(EnvKind::Doc, "'quiet' in doc.attributes.tags", &value).unwrap());
        assert!(eval_one(EnvKind::Doc, "'weight' in doc.attributes", &value).unwrap());
    }

    #[test]
    fn test_missing_key_is_soft_miss() {
        let value = dog(25);
        assert!(!eval_one(EnvKind::Doc, "doc.attributes.color == 'brown'", &value).unwrap());
        assert!(!eval_one(EnvKind::Doc, "doc.attributes.color.size() > 0", &value).unwrap());
    }

    #[test]
    fn test_empty_program_list_is_vacuously_true() {
        assert!(eval(&dog(1), &[]).unwrap());
    }

    #[test]
    fn test_all_programs_must_pass() {
        let value = dog(25);
        let ps = programs(
            EnvKind::Doc,
            &["doc.attributes.weight > 20".to_string(), "doc.attributes.weight > 30".to_string()],
        )
        .unwrap();
        assert!(!eval(&value, &ps).unwrap());
    }

    #[test]
    fn test_programs_skip_empty_sources() {
        let ps = programs(
            EnvKind::Doc,
            &["".to_string(), "doc.attributes.weight > 20".to_string()],
        )
        .unwrap();
        assert_eq!(ps.len(), 1);
    }

    #[test]
    fn test_compile_rejects_parse_errors() {
        assert!(matches!(
            program(EnvKind::Doc, "doc.attributes.weight >"),
            Err(Error::InvalidExpression(_))
        ));
        assert!(matches!(program(EnvKind::Doc, ""), Err(Error::InvalidExpression(_))));
    }

    #[test]
    fn test_compile_rejects_unknown_root_variable() {
        assert!(matches!(
            program(EnvKind::Doc, "connection.attributes.weight > 20"),
            Err(Error::InvalidExpression(_))
        ));
        assert!(program(EnvKind::Connection, "connection.directed == true").is_ok());
    }

    #[test]
    fn test_auth_environment() {
        let value = json!({"request": {
            "method": "DelDoc",
            "user": {"ref": {"gtype": "user", "gid": "alice@x"},
                     "attributes": {"email": "alice@x"}},
            "timestamp": "2024-01-01T00:00:00Z",
            "request": {"gtype": "dog", "gid": "charlie"},
        }});
        assert!(!eval_one(EnvKind::Auth, "request.method != 'DelDoc'", &value).unwrap());
        assert!(eval_one(
            EnvKind::Auth,
            "request.user.attributes.email == 'alice@x'",
            &value
        )
        .unwrap());
    }

    #[test]
    fn test_change_environment() {
        let value = json!({"change": {
            "method": "CreateDoc",
            "identity": {"ref": {"gtype": "user", "gid": "alice@x"}},
            "timestamp": "2024-01-01T00:00:00Z",
            "doc_changes": [{"after": {"ref": {"gtype": "dog", "gid": "charlie"}}}],
            "connection_changes": [],
        }});
        assert!(eval_one(EnvKind::Change, "change.doc_changes.size() > 0", &value).unwrap());
        assert!(!eval_one(
            EnvKind::Change,
            "change.connection_changes.size() > 0",
            &value
        )
        .unwrap());
    }

    #[test]
    fn test_env_builders_wrap_root_var() {
        let doc = Doc::new(Ref::new("dog", "charlie"));
        let value = doc_env(&doc).unwrap();
        assert!(value.get("doc").is_some());
        assert!(eval_one(EnvKind::Doc, "doc.ref.gtype == 'dog'", &value).unwrap());
    }
}
