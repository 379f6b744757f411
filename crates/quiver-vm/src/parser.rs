//! Expression parser implementation using pest.

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use quiver_types::{Error, Result};
use serde_json::Value;

use crate::ast::{BinaryOp, Expr, UnaryOp};

#[derive(Parser)]
#[grammar = "expr.pest"]
pub struct ExprParser;

/// Parse an expression from source text.
pub fn parse(source: &str) -> Result<Expr> {
    let mut pairs = ExprParser::parse(Rule::expression, source)
        .map_err(|e| Error::InvalidExpression(e.to_string()))?;
    let expression = pairs
        .next()
        .ok_or_else(|| Error::InvalidExpression("empty parse".to_string()))?;
    let or_expr = expression
        .into_inner()
        .next()
        .ok_or_else(|| Error::InvalidExpression("expected expression".to_string()))?;
    parse_expr(or_expr)
}

fn parse_expr(pair: Pair<Rule>) -> Result<Expr> {
    match pair.as_rule() {
        Rule::or_expr
        | Rule::and_expr
        | Rule::eq_expr
        | Rule::rel_expr
        | Rule::add_expr
        | Rule::mul_expr => parse_binary_chain(pair),
        Rule::unary_expr => parse_unary(pair),
        Rule::postfix_expr => parse_postfix(pair),
        Rule::primary => parse_primary(pair),
        other => Err(Error::InvalidExpression(format!("unexpected rule: {:?}", other))),
    }
}

/// Left-fold an `operand (op operand)*` chain into nested binary nodes.
fn parse_binary_chain(pair: Pair<Rule>) -> Result<Expr> {
    let mut inner = pair.into_inner();
    let first = inner
        .next()
        .ok_or_else(|| Error::InvalidExpression("expected operand".to_string()))?;
    let mut lhs = parse_expr(first)?;

    while let Some(op_pair) = inner.next() {
        let op = binary_op(&op_pair)?;
        let rhs_pair = inner
            .next()
            .ok_or_else(|| Error::InvalidExpression("operator without operand".to_string()))?;
        let rhs = parse_expr(rhs_pair)?;
        lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
    }
    Ok(lhs)
}

fn binary_op(pair: &Pair<Rule>) -> Result<BinaryOp> {
    let op = match (pair.as_rule(), pair.as_str()) {
        (Rule::or_op, _) => BinaryOp::Or,
        (Rule::and_op, _) => BinaryOp::And,
        (Rule::eq_op, "==") => BinaryOp::Eq,
        (Rule::eq_op, "!=") => BinaryOp::Ne,
        (Rule::rel_op, "<") => BinaryOp::Lt,
        (Rule::rel_op, "<=") => BinaryOp::Le,
        (Rule::rel_op, ">") => BinaryOp::Gt,
        (Rule::rel_op, ">=") => BinaryOp::Ge,
        (Rule::rel_op, "in") => BinaryOp::In,
        (Rule::add_op, "+") => BinaryOp::Add,
        (Rule::add_op, "-") => BinaryOp::Sub,
        (Rule::mul_op, "*") => BinaryOp::Mul,
        (Rule::mul_op, "/") => BinaryOp::Div,
        (rule, text) => {
            return Err(Error::InvalidExpression(format!(
                "unexpected operator {:?} {:?}",
                rule, text
            )))
        }
    };
    Ok(op)
}

fn parse_unary(pair: Pair<Rule>) -> Result<Expr> {
    let mut ops = Vec::new();
    let mut operand = None;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::unary_op => ops.push(match inner.as_str() {
                "!" => UnaryOp::Not,
                _ => UnaryOp::Neg,
            }),
            _ => operand = Some(parse_expr(inner)?),
        }
    }
    let mut expr =
        operand.ok_or_else(|| Error::InvalidExpression("expected operand".to_string()))?;
    for op in ops.into_iter().rev() {
        expr = Expr::Unary { op, expr: Box::new(expr) };
    }
    Ok(expr)
}

fn parse_postfix(pair: Pair<Rule>) -> Result<Expr> {
    let mut inner = pair.into_inner();
    let primary = inner
        .next()
        .ok_or_else(|| Error::InvalidExpression("expected primary expression".to_string()))?;
    let mut expr = parse_primary(primary)?;

    for op in inner {
        let mut parts = op.into_inner();
        let field = parts
            .next()
            .ok_or_else(|| Error::InvalidExpression("expected field name".to_string()))?
            .as_str()
            .to_string();
        match parts.next() {
            Some(call) => {
                let args = call.into_inner().map(parse_expr).collect::<Result<Vec<_>>>()?;
                expr = Expr::Call { target: Box::new(expr), method: field, args };
            }
            None => {
                expr = Expr::Select { target: Box::new(expr), field };
            }
        }
    }
    Ok(expr)
}

fn parse_primary(pair: Pair<Rule>) -> Result<Expr> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| Error::InvalidExpression("expected primary expression".to_string()))?;
    match inner.as_rule() {
        Rule::literal => parse_literal(inner),
        Rule::ident => Ok(Expr::Ident(inner.as_str().to_string())),
        Rule::or_expr => parse_expr(inner),
        other => Err(Error::InvalidExpression(format!("unexpected primary: {:?}", other))),
    }
}

fn parse_literal(pair: Pair<Rule>) -> Result<Expr> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| Error::InvalidExpression("expected literal".to_string()))?;
    let value = match inner.as_rule() {
        Rule::string => {
            let raw = inner.as_str();
            Value::String(raw[1..raw.len() - 1].to_string())
        }
        Rule::float => {
            let parsed: f64 = inner
                .as_str()
                .parse()
                .map_err(|_| Error::InvalidExpression(format!("bad float: {}", inner.as_str())))?;
            serde_json::Number::from_f64(parsed)
                .map(Value::Number)
                .ok_or_else(|| Error::InvalidExpression(format!("bad float: {}", parsed)))?
        }
        Rule::int => {
            let parsed: i64 = inner
                .as_str()
                .parse()
                .map_err(|_| Error::InvalidExpression(format!("bad int: {}", inner.as_str())))?;
            Value::from(parsed)
        }
        Rule::boolean => Value::Bool(inner.as_str() == "true"),
        Rule::null => Value::Null,
        other => return Err(Error::InvalidExpression(format!("unexpected literal: {:?}", other))),
    };
    Ok(Expr::Literal(value))
}
