// Built-in Expression Functions
// String helpers, JSON conversion and job status checks

use crate::expression::evaluator::{value_to_string, values_equal, EvalError, JobStatusContext};

use serde_json::Value;

/// Built-in function dispatcher
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinFunctions;

impl BuiltinFunctions {
    pub fn new() -> Self {
        Self
    }

    /// Call a built-in by (case-insensitive) name
    pub fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        status: &JobStatusContext,
    ) -> Result<Value, EvalError> {
        match name.to_ascii_lowercase().as_str() {
            // Status checks
            "success" => {
                expect_args(name, &args, 0)?;
                Ok(Value::Bool(!status.failed && !status.cancelled))
            }
            "failure" => {
                expect_args(name, &args, 0)?;
                Ok(Value::Bool(status.failed && !status.cancelled))
            }
            "cancelled" => {
                expect_args(name, &args, 0)?;
                Ok(Value::Bool(status.cancelled))
            }
            "always" => {
                expect_args(name, &args, 0)?;
                Ok(Value::Bool(true))
            }

            // Strings
            "contains" => self.fn_contains(args),
            "startswith" => {
                expect_args(name, &args, 2)?;
                let (s, prefix) = lowered_pair(&args);
                Ok(Value::Bool(s.starts_with(&prefix)))
            }
            "endswith" => {
                expect_args(name, &args, 2)?;
                let (s, suffix) = lowered_pair(&args);
                Ok(Value::Bool(s.ends_with(&suffix)))
            }
            "format" => self.fn_format(args),
            "join" => self.fn_join(args),

            // JSON
            "tojson" => {
                expect_args(name, &args, 1)?;
                serde_json::to_string_pretty(&args[0])
                    .map(Value::String)
                    .map_err(|e| EvalError::new(format!("toJSON failed: {}", e)))
            }
            "fromjson" => {
                expect_args(name, &args, 1)?;
                serde_json::from_str(&value_to_string(&args[0]))
                    .map_err(|e| EvalError::new(format!("fromJSON failed: {}", e)))
            }

            _ => Err(EvalError::new(format!("unknown function '{}'", name))),
        }
    }

    fn fn_contains(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        expect_args("contains", &args, 2)?;
        match &args[0] {
            Value::Array(items) => Ok(Value::Bool(
                items.iter().any(|item| values_equal(item, &args[1])),
            )),
            haystack => {
                let haystack = value_to_string(haystack).to_lowercase();
                let needle = value_to_string(&args[1]).to_lowercase();
                Ok(Value::Bool(haystack.contains(&needle)))
            }
        }
    }

    /// `format('{0}-{1}', a, b)`; `{{` and `}}` escape literal braces
    fn fn_format(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        let Some((template, rest)) = args.split_first() else {
            return Err(EvalError::new("format expects at least 1 argument"));
        };
        let template = value_to_string(template);
        let mut result = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    result.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    result.push('}');
                }
                '{' => {
                    let mut digits = String::new();
                    for d in chars.by_ref() {
                        if d == '}' {
                            break;
                        }
                        digits.push(d);
                    }
                    let index: usize = digits.parse().map_err(|_| {
                        EvalError::new(format!("format: invalid placeholder '{{{}}}'", digits))
                    })?;
                    let value = rest.get(index).ok_or_else(|| {
                        EvalError::new(format!("format: missing argument {}", index))
                    })?;
                    result.push_str(&value_to_string(value));
                }
                other => result.push(other),
            }
        }

        Ok(Value::String(result))
    }

    fn fn_join(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        if args.is_empty() || args.len() > 2 {
            return Err(EvalError::new("join expects 1 or 2 arguments"));
        }
        let separator = args
            .get(1)
            .map(value_to_string)
            .unwrap_or_else(|| ",".to_string());

        match &args[0] {
            Value::Array(items) => Ok(Value::String(
                items
                    .iter()
                    .map(value_to_string)
                    .collect::<Vec<_>>()
                    .join(&separator),
            )),
            other => Ok(Value::String(value_to_string(other))),
        }
    }
}

fn expect_args(name: &str, args: &[Value], count: usize) -> Result<(), EvalError> {
    if args.len() != count {
        return Err(EvalError::new(format!(
            "{}() expects {} argument(s), got {}",
            name,
            count,
            args.len()
        )));
    }
    Ok(())
}

fn lowered_pair(args: &[Value]) -> (String, String) {
    (
        value_to_string(&args[0]).to_lowercase(),
        value_to_string(&args[1]).to_lowercase(),
    )
}
