//! Expression AST produced by the parser and walked by the evaluator.

use std::collections::BTreeSet;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// A bare root variable reference (`doc`, `request`, ...).
    Ident(String),
    Select {
        target: Box<Expr>,
        field: String,
    },
    Call {
        target: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Every root variable the expression references. Compilation checks
    /// these against the environment's single declared root.
    pub fn root_idents(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_roots(&mut out);
        out
    }

    fn collect_roots<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ident(name) => {
                out.insert(name.as_str());
            }
            Expr::Select { target, .. } => target.collect_roots(out),
            Expr::Call { target, args, .. } => {
                target.collect_roots(out);
                for arg in args {
                    arg.collect_roots(out);
                }
            }
            Expr::Unary { expr, .. } => expr.collect_roots(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_roots(out);
                rhs.collect_roots(out);
            }
        }
    }
}
