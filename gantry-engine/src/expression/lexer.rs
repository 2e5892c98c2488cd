// Expression Engine Lexer
// Tokenizes `${{ }}` expressions and splits templated strings into segments

use std::fmt;

/// Token types for workflow expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    String(String),

    Identifier(String),

    // Operators
    Eq,  // ==
    Ne,  // !=
    Lt,  // <
    Le,  // <=
    Gt,  // >
    Ge,  // >=
    And, // &&
    Or,  // ||
    Not, // !
    Dot, // .
    Comma,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Eof => write!(f, "EOF"),
        }
    }
}

/// Lexer error
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lex error at position {}: {}", self.position, self.message)
    }
}

impl std::error::Error for LexError {}

/// Lexer for workflow expressions
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }

        Ok(tokens)
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };

        self.position = pos;

        match ch {
            '.' => {
                self.advance();
                Ok(Token::Dot)
            }
            ',' => {
                self.advance();
                Ok(Token::Comma)
            }
            '(' => {
                self.advance();
                Ok(Token::LParen)
            }
            ')' => {
                self.advance();
                Ok(Token::RParen)
            }
            '[' => {
                self.advance();
                Ok(Token::LBracket)
            }
            ']' => {
                self.advance();
                Ok(Token::RBracket)
            }
            '=' => {
                self.advance();
                if self.consume('=') {
                    Ok(Token::Eq)
                } else {
                    Err(self.error("expected '==', found single '='"))
                }
            }
            '!' => {
                self.advance();
                if self.consume('=') {
                    Ok(Token::Ne)
                } else {
                    Ok(Token::Not)
                }
            }
            '<' => {
                self.advance();
                if self.consume('=') {
                    Ok(Token::Le)
                } else {
                    Ok(Token::Lt)
                }
            }
            '>' => {
                self.advance();
                if self.consume('=') {
                    Ok(Token::Ge)
                } else {
                    Ok(Token::Gt)
                }
            }
            '&' => {
                self.advance();
                if self.consume('&') {
                    Ok(Token::And)
                } else {
                    Err(self.error("expected '&&'"))
                }
            }
            '|' => {
                self.advance();
                if self.consume('|') {
                    Ok(Token::Or)
                } else {
                    Err(self.error("expected '||'"))
                }
            }
            '\'' => self.read_string(),
            '-' | '0'..='9' => self.read_number(),
            c if c.is_alphabetic() || c == '_' => Ok(self.read_identifier()),
            other => Err(self.error(&format!("unexpected character '{}'", other))),
        }
    }

    fn advance(&mut self) -> Option<char> {
        self.chars.next().map(|(_, c)| c)
    }

    fn consume(&mut self, expected: char) -> bool {
        if matches!(self.chars.peek(), Some(&(_, c)) if c == expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some(&(_, c)) if c.is_whitespace()) {
            self.advance();
        }
    }

    /// Single-quoted string; a doubled quote is an escaped quote
    fn read_string(&mut self) -> Result<Token, LexError> {
        self.advance();
        let mut value = String::new();

        loop {
            match self.advance() {
                Some('\'') => {
                    if self.consume('\'') {
                        value.push('\'');
                    } else {
                        return Ok(Token::String(value));
                    }
                }
                Some(c) => value.push(c),
                None => return Err(self.error("unterminated string literal")),
            }
        }
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let mut text = String::new();

        if self.consume('-') {
            text.push('-');
        }

        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' || c == 'x' || c.is_ascii_hexdigit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let parsed = if let Some(hex) = text.strip_prefix("0x") {
            i64::from_str_radix(hex, 16).ok().map(|n| n as f64)
        } else {
            text.parse::<f64>().ok()
        };

        parsed
            .map(Token::Number)
            .ok_or_else(|| self.error(&format!("invalid number '{}'", text)))
    }

    /// Identifiers may contain dashes (`steps.setup-rust.outputs`)
    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();

        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                ident.push(c);
                self.advance();
            } else {
                break;
            }
        }

        match ident.as_str() {
            "null" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Identifier(ident),
        }
    }

    fn error(&self, message: &str) -> LexError {
        LexError {
            message: message.to_string(),
            position: self.position,
        }
    }
}

/// A piece of a templated string
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text copied as-is
    Literal(String),
    /// Expression source found between `${{` and `}}`
    Expression(String),
}

/// Split a string into literal text and `${{ }}` expressions.
///
/// String literals inside an expression may contain `}}`, so the closing
/// delimiter is searched for outside of quotes.
pub fn extract_expressions(input: &str) -> Result<Vec<Segment>, LexError> {
    let mut segments = Vec::new();
    let mut rest = input;
    let mut offset = 0;

    while let Some(start) = rest.find("${{") {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }

        let body = &rest[start + 3..];
        let end = find_closing(body).ok_or_else(|| LexError {
            message: "unterminated '${{' expression".to_string(),
            position: offset + start,
        })?;

        segments.push(Segment::Expression(body[..end].trim().to_string()));

        let consumed = start + 3 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }

    Ok(segments)
}

fn find_closing(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut in_string = false;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b'}' if !in_string && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }

    None
}

/// Strip a surrounding `${{ }}` if the whole string is one expression
pub fn strip_expression_wrapper(input: &str) -> &str {
    let trimmed = input.trim();
    match trimmed
        .strip_prefix("${{")
        .and_then(|s| s.strip_suffix("}}"))
    {
        Some(inner) if !inner.contains("${{") => inner.trim(),
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        Lexer::new(input).tokenize().unwrap()
    }

    #[test]
    fn test_tokenize_comparison() {
        assert_eq!(
            tokens("github.event_name == 'pull_request'"),
            vec![
                Token::Identifier("github".to_string()),
                Token::Dot,
                Token::Identifier("event_name".to_string()),
                Token::Eq,
                Token::String("pull_request".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_dashed_identifier() {
        let toks = tokens("steps.setup-rust.outputs.version");
        assert_eq!(toks[2], Token::Identifier("setup-rust".to_string()));
    }

    #[test]
    fn test_tokenize_escaped_quote() {
        assert_eq!(tokens("'it''s'")[0], Token::String("it's".to_string()));
    }

    #[test]
    fn test_tokenize_numbers() {
        assert_eq!(tokens("42")[0], Token::Number(42.0));
        assert_eq!(tokens("-1.5")[0], Token::Number(-1.5));
        assert_eq!(tokens("0xff")[0], Token::Number(255.0));
    }

    #[test]
    fn test_tokenize_operators() {
        assert_eq!(
            tokens("!a && b || c != d"),
            vec![
                Token::Not,
                Token::Identifier("a".to_string()),
                Token::And,
                Token::Identifier("b".to_string()),
                Token::Or,
                Token::Identifier("c".to_string()),
                Token::Ne,
                Token::Identifier("d".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_single_equals_is_error() {
        assert!(Lexer::new("a = b").tokenize().is_err());
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("'abc").tokenize().unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_extract_expressions() {
        let segments =
            extract_expressions("${{ github.workflow }}-${{ github.ref }}").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Expression("github.workflow".to_string()),
                Segment::Literal("-".to_string()),
                Segment::Expression("github.ref".to_string()),
            ]
        );
    }

    #[test]
    fn test_extract_expression_with_braces_in_string() {
        let segments = extract_expressions("x ${{ format('{0}}}', 'a') }} y").unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(
            segments[1],
            Segment::Expression("format('{0}}}', 'a')".to_string())
        );
    }

    #[test]
    fn test_extract_unterminated() {
        assert!(extract_expressions("${{ matrix.os").is_err());
    }

    #[test]
    fn test_strip_wrapper() {
        assert_eq!(strip_expression_wrapper("${{ failure() }}"), "failure()");
        assert_eq!(strip_expression_wrapper("  always() "), "always()");
    }
}
