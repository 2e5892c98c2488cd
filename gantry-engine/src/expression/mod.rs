// Expression Engine Module
// `${{ }}` expressions for conditions, templated values and concurrency keys

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use evaluator::{
    is_truthy, value_to_string, values_equal, EvalError, Evaluator, ExpressionContext,
    ExpressionEngine, JobStatusContext,
};
pub use functions::BuiltinFunctions;
pub use lexer::{extract_expressions, strip_expression_wrapper, LexError, Lexer, Segment, Token};
pub use parser::{BinaryOp, Expr, ExprParser, ParseExprError};
