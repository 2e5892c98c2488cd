// Expression Engine Evaluator
// Evaluates AST expressions against workflow contexts (github, matrix, steps, ...)

use crate::expression::functions::BuiltinFunctions;
use crate::expression::lexer::{extract_expressions, strip_expression_wrapper, Segment};
use crate::expression::parser::{BinaryOp, Expr, ExprParser};

use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// Evaluation error
#[derive(Debug, Clone)]
pub struct EvalError {
    pub message: String,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation error: {}", self.message)
    }
}

impl std::error::Error for EvalError {}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Job status as seen by `success()`, `failure()` and `cancelled()`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStatusContext {
    pub failed: bool,
    pub cancelled: bool,
}

impl JobStatusContext {
    /// Value of `job.status`
    pub fn as_str(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.failed {
            "failure"
        } else {
            "success"
        }
    }
}

/// Context for expression evaluation
#[derive(Debug, Clone, Default)]
pub struct ExpressionContext {
    /// Event and workflow metadata (`github.ref`, `github.event_name`, ...)
    pub github: Map<String, Value>,

    /// Environment visible to the step
    pub env: Map<String, Value>,

    /// Matrix assignment of the current job instance
    pub matrix: Map<String, Value>,

    /// Completed steps by id: `{outputs, outcome, conclusion}`
    pub steps: Map<String, Value>,

    /// Composite action inputs
    pub inputs: Map<String, Value>,

    /// Runner facts (`runner.os`, `runner.temp`)
    pub runner: Map<String, Value>,

    /// Status of the surrounding job
    pub job: JobStatusContext,
}

impl ExpressionContext {
    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        let map = match name {
            "github" => &self.github,
            "env" => &self.env,
            "matrix" => &self.matrix,
            "steps" => &self.steps,
            "inputs" => &self.inputs,
            "runner" => &self.runner,
            "job" => {
                let mut job = Map::new();
                job.insert(
                    "status".to_string(),
                    Value::String(self.job.as_str().to_string()),
                );
                return Ok(Value::Object(job));
            }
            other => return Err(EvalError::new(format!("unknown context '{}'", other))),
        };
        Ok(Value::Object(map.clone()))
    }
}

/// Expression evaluator
pub struct Evaluator<'a> {
    context: &'a ExpressionContext,
    functions: BuiltinFunctions,
}

impl<'a> Evaluator<'a> {
    pub fn new(context: &'a ExpressionContext) -> Self {
        Self {
            context,
            functions: BuiltinFunctions::new(),
        }
    }

    /// Evaluate an expression
    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(number(*n)),
            Expr::String(s) => Ok(Value::String(s.clone())),

            Expr::Context(name) => self.context.lookup(name),

            Expr::FunctionCall { name, args } => {
                let values = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.functions.call(name, values, &self.context.job)
            }

            Expr::Member { object, property } => {
                let obj = self.eval(object)?;
                Ok(member(&obj, property))
            }

            Expr::Index { object, index } => {
                let obj = self.eval(object)?;
                let idx = self.eval(index)?;
                Ok(match (&obj, &idx) {
                    (Value::Array(items), Value::Number(n)) => n
                        .as_f64()
                        .filter(|f| *f >= 0.0)
                        .and_then(|f| items.get(f as usize).cloned())
                        .unwrap_or(Value::Null),
                    _ => member(&obj, &value_to_string(&idx)),
                })
            }

            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&self.eval(inner)?))),

            Expr::Binary { op, left, right } => match op {
                // && and || short-circuit and yield the deciding operand
                BinaryOp::And => {
                    let left_val = self.eval(left)?;
                    if !is_truthy(&left_val) {
                        return Ok(left_val);
                    }
                    self.eval(right)
                }
                BinaryOp::Or => {
                    let left_val = self.eval(left)?;
                    if is_truthy(&left_val) {
                        return Ok(left_val);
                    }
                    self.eval(right)
                }
                _ => {
                    let left_val = self.eval(left)?;
                    let right_val = self.eval(right)?;
                    Ok(Value::Bool(compare_op(*op, &left_val, &right_val)))
                }
            },
        }
    }
}

/// Facade combining parsing and evaluation
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpressionEngine;

impl ExpressionEngine {
    /// Parse and evaluate a bare expression (no `${{ }}`)
    pub fn evaluate(source: &str, context: &ExpressionContext) -> Result<Value, EvalError> {
        let expr = ExprParser::parse_str(source).map_err(|e| EvalError::new(e.to_string()))?;
        Evaluator::new(context).eval(&expr)
    }

    /// Evaluate an `if:` condition.
    ///
    /// An empty condition means `success()`. A condition with no status check
    /// function is evaluated as `success() && (<condition>)`.
    pub fn evaluate_condition(
        condition: Option<&str>,
        context: &ExpressionContext,
    ) -> Result<bool, EvalError> {
        let source = condition.map(strip_expression_wrapper).unwrap_or("");
        if source.is_empty() {
            return Ok(!context.job.failed && !context.job.cancelled);
        }

        let expr = ExprParser::parse_str(source).map_err(|e| EvalError::new(e.to_string()))?;
        let expr = if expr.has_status_check() {
            expr
        } else {
            Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(Expr::FunctionCall {
                    name: "success".to_string(),
                    args: Vec::new(),
                }),
                right: Box::new(expr),
            }
        };

        Ok(is_truthy(&Evaluator::new(context).eval(&expr)?))
    }

    /// Replace every `${{ }}` in `input` with its evaluated string form
    pub fn interpolate(input: &str, context: &ExpressionContext) -> Result<String, EvalError> {
        if !input.contains("${{") {
            return Ok(input.to_string());
        }

        let segments = extract_expressions(input).map_err(|e| EvalError::new(e.to_string()))?;
        let mut result = String::with_capacity(input.len());

        for segment in segments {
            match segment {
                Segment::Literal(text) => result.push_str(&text),
                Segment::Expression(source) => {
                    let value = Self::evaluate(&source, context)?;
                    result.push_str(&value_to_string(&value));
                }
            }
        }

        Ok(result)
    }

    /// Check that every `${{ }}` in `input` parses
    pub fn validate(input: &str) -> Result<(), EvalError> {
        for segment in extract_expressions(input).map_err(|e| EvalError::new(e.to_string()))? {
            if let Segment::Expression(source) = segment {
                ExprParser::parse_str(&source).map_err(|e| EvalError::new(e.to_string()))?;
            }
        }
        Ok(())
    }
}

fn member(obj: &Value, property: &str) -> Value {
    match obj {
        Value::Object(map) => map
            .get(property)
            .or_else(|| {
                // Context keys are case-insensitive
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(property))
                    .map(|(_, v)| v)
            })
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Truthiness: null, false, 0, NaN and '' are falsy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String form used for interpolation and environment values
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

/// Loose equality: strings compare case-insensitively, mixed types as numbers
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        (Value::Null, Value::Null) => true,
        (Value::Array(_), _) | (Value::Object(_), _) | (_, Value::Array(_)) | (_, Value::Object(_)) => {
            a == b
        }
        _ => {
            let (x, y) = (to_number(a), to_number(b));
            !x.is_nan() && !y.is_nan() && x == y
        }
    }
}

fn compare_op(op: BinaryOp, a: &Value, b: &Value) -> bool {
    match op {
        BinaryOp::Eq => values_equal(a, b),
        BinaryOp::Ne => !values_equal(a, b),
        _ => {
            let ordering = match (a, b) {
                (Value::String(x), Value::String(y)) => {
                    Some(x.to_lowercase().cmp(&y.to_lowercase()))
                }
                _ => to_number(a).partial_cmp(&to_number(b)),
            };
            match (op, ordering) {
                (_, None) => false,
                (BinaryOp::Lt, Some(o)) => o == Ordering::Less,
                (BinaryOp::Le, Some(o)) => o != Ordering::Greater,
                (BinaryOp::Gt, Some(o)) => o == Ordering::Greater,
                (BinaryOp::Ge, Some(o)) => o != Ordering::Less,
                _ => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExpressionContext {
        let mut ctx = ExpressionContext::default();
        ctx.github.insert("ref".to_string(), json!("refs/heads/main"));
        ctx.github.insert("event_name".to_string(), json!("pull_request"));
        ctx.github.insert("workflow".to_string(), json!("CI"));
        ctx.matrix.insert("os".to_string(), json!("ubuntu-22.04"));
        ctx.matrix.insert("node".to_string(), json!(18));
        ctx.steps.insert(
            "version".to_string(),
            json!({"outputs": {"value": "1.2.3"}, "outcome": "success", "conclusion": "success"}),
        );
        ctx
    }

    #[test]
    fn test_evaluate_references() {
        let ctx = context();
        assert_eq!(
            ExpressionEngine::evaluate("steps.version.outputs.value", &ctx).unwrap(),
            json!("1.2.3")
        );
        assert_eq!(
            ExpressionEngine::evaluate("matrix['os']", &ctx).unwrap(),
            json!("ubuntu-22.04")
        );
        assert_eq!(
            ExpressionEngine::evaluate("steps.missing.outputs.value", &ctx).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_unknown_context_is_error() {
        assert!(ExpressionEngine::evaluate("secrets.TOKEN", &context()).is_err());
    }

    #[test]
    fn test_loose_equality() {
        let ctx = context();
        let eval = |s: &str| ExpressionEngine::evaluate(s, &ctx).unwrap();
        assert_eq!(eval("github.event_name == 'PULL_REQUEST'"), json!(true));
        assert_eq!(eval("matrix.node == '18'"), json!(true));
        assert_eq!(eval("matrix.node >= 16"), json!(true));
        assert_eq!(eval("null == 0"), json!(true));
        assert_eq!(eval("'abc' == 1"), json!(false));
    }

    #[test]
    fn test_logical_operators_yield_operand() {
        let ctx = context();
        assert_eq!(
            ExpressionEngine::evaluate("matrix.missing || 'fallback'", &ctx).unwrap(),
            json!("fallback")
        );
        assert_eq!(
            ExpressionEngine::evaluate("!matrix.missing && matrix.os", &ctx).unwrap(),
            json!("ubuntu-22.04")
        );
    }

    #[test]
    fn test_condition_defaults_to_success() {
        let mut ctx = context();
        assert!(ExpressionEngine::evaluate_condition(None, &ctx).unwrap());
        ctx.job.failed = true;
        assert!(!ExpressionEngine::evaluate_condition(None, &ctx).unwrap());
    }

    #[test]
    fn test_condition_implicit_success() {
        let mut ctx = context();
        let cond = Some("github.ref == 'refs/heads/main'");
        assert!(ExpressionEngine::evaluate_condition(cond, &ctx).unwrap());
        ctx.job.failed = true;
        assert!(!ExpressionEngine::evaluate_condition(cond, &ctx).unwrap());
        assert!(ExpressionEngine::evaluate_condition(Some("${{ failure() }}"), &ctx).unwrap());
        assert!(ExpressionEngine::evaluate_condition(Some("always()"), &ctx).unwrap());
    }

    #[test]
    fn test_condition_cancelled() {
        let mut ctx = context();
        ctx.job.cancelled = true;
        assert!(!ExpressionEngine::evaluate_condition(Some("failure()"), &ctx).unwrap());
        assert!(ExpressionEngine::evaluate_condition(Some("cancelled()"), &ctx).unwrap());
    }

    #[test]
    fn test_interpolate() {
        let ctx = context();
        assert_eq!(
            ExpressionEngine::interpolate("${{ github.workflow }}-${{ github.ref }}", &ctx)
                .unwrap(),
            "CI-refs/heads/main"
        );
        assert_eq!(
            ExpressionEngine::interpolate("node ${{ matrix.node }} on ${{ matrix.os }}", &ctx)
                .unwrap(),
            "node 18 on ubuntu-22.04"
        );
        assert_eq!(
            ExpressionEngine::interpolate("plain text", &ctx).unwrap(),
            "plain text"
        );
    }

    #[test]
    fn test_job_status_context() {
        let mut ctx = context();
        assert_eq!(
            ExpressionEngine::evaluate("job.status", &ctx).unwrap(),
            json!("success")
        );
        ctx.job.failed = true;
        assert_eq!(
            ExpressionEngine::evaluate("job.status", &ctx).unwrap(),
            json!("failure")
        );
    }

    #[test]
    fn test_validate() {
        assert!(ExpressionEngine::validate("${{ matrix.os }}").is_ok());
        assert!(ExpressionEngine::validate("${{ matrix. }}").is_err());
    }

    #[test]
    fn test_value_to_string() {
        assert_eq!(value_to_string(&json!(3.0)), "3");
        assert_eq!(value_to_string(&json!(1.5)), "1.5");
        assert_eq!(value_to_string(&Value::Null), "");
        assert_eq!(value_to_string(&json!(["a"])), "[\"a\"]");
    }
}
