//! Two-token comparison expressions used by conditional steps.
//!
//! An expression is an operator followed by a numeric literal, e.g. `">= 5"`.
//! Count-mode and number-reading steps evaluate it against a measurement each
//! scan cycle.

use crate::error::DetectError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl CmpOp {
    fn parse(token: &str) -> Option<Self> {
        match token {
            ">" => Some(CmpOp::Gt),
            "<" => Some(CmpOp::Lt),
            ">=" => Some(CmpOp::Ge),
            "<=" => Some(CmpOp::Le),
            "==" => Some(CmpOp::Eq),
            "!=" => Some(CmpOp::Ne),
            _ => None,
        }
    }
}

/// A parsed comparison, ready to evaluate against measurements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    pub op: CmpOp,
    pub value: f64,
}

impl Comparison {
    /// Parse an `"op value"` expression.
    ///
    /// Fails with [`DetectError::InvalidExpression`] when the token count is
    /// not exactly two, the operator is unrecognized, or the literal does not
    /// parse. Callers treat that as a local step failure, not a crash.
    pub fn parse(input: &str) -> Result<Self, DetectError> {
        let tokens: Vec<&str> = input.split_whitespace().collect();
        if tokens.len() != 2 {
            return Err(DetectError::InvalidExpression(input.to_string()));
        }
        let op = CmpOp::parse(tokens[0])
            .ok_or_else(|| DetectError::InvalidExpression(input.to_string()))?;
        let value: f64 = tokens[1]
            .parse()
            .map_err(|_| DetectError::InvalidExpression(input.to_string()))?;
        Ok(Self { op, value })
    }

    pub fn evaluate(&self, measured: f64) -> bool {
        match self.op {
            CmpOp::Gt => measured > self.value,
            CmpOp::Lt => measured < self.value,
            CmpOp::Ge => measured >= self.value,
            CmpOp::Le => measured <= self.value,
            CmpOp::Eq => measured == self.value,
            CmpOp::Ne => measured != self.value,
        }
    }
}

/// Parse and evaluate in one call.
pub fn evaluate(expression: &str, measured: f64) -> Result<bool, DetectError> {
    Ok(Comparison::parse(expression)?.evaluate(measured))
}
