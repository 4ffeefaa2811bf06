//! Tokenizer for the filter expression language.

use crate::ParseError;

/// A lexical token plus its byte offset in the source (for error messages).
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    True,
    False,
    Nil,
    // operators
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Question,
    Colon,
    // string / membership keywords
    StartsWith,
    EndsWith,
    Contains,
    In,
    // punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

impl TokenKind {
    /// Human-readable name for diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier `{name}`"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Int(n) => format!("integer `{n}`"),
            TokenKind::Float(x) => format!("float `{x}`"),
            other => format!("`{other:?}`"),
        }
    }
}

/// Tokenize an expression.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos] as char;
        let start = pos;

        match c {
            ' ' | '\t' | '\r' | '\n' => {
                pos += 1;
            }
            '(' => {
                tokens.push(Token { kind: TokenKind::LParen, offset: start });
                pos += 1;
            }
            ')' => {
                tokens.push(Token { kind: TokenKind::RParen, offset: start });
                pos += 1;
            }
            '[' => {
                tokens.push(Token { kind: TokenKind::LBracket, offset: start });
                pos += 1;
            }
            ']' => {
                tokens.push(Token { kind: TokenKind::RBracket, offset: start });
                pos += 1;
            }
            ',' => {
                tokens.push(Token { kind: TokenKind::Comma, offset: start });
                pos += 1;
            }
            '.' => {
                tokens.push(Token { kind: TokenKind::Dot, offset: start });
                pos += 1;
            }
            '?' => {
                tokens.push(Token { kind: TokenKind::Question, offset: start });
                pos += 1;
            }
            ':' => {
                tokens.push(Token { kind: TokenKind::Colon, offset: start });
                pos += 1;
            }
            '+' => {
                tokens.push(Token { kind: TokenKind::Plus, offset: start });
                pos += 1;
            }
            '-' => {
                tokens.push(Token { kind: TokenKind::Minus, offset: start });
                pos += 1;
            }
            '*' => {
                tokens.push(Token { kind: TokenKind::Star, offset: start });
                pos += 1;
            }
            '/' => {
                tokens.push(Token { kind: TokenKind::Slash, offset: start });
                pos += 1;
            }
            '%' => {
                tokens.push(Token { kind: TokenKind::Percent, offset: start });
                pos += 1;
            }
            '=' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::EqEq, offset: start });
                    pos += 2;
                } else {
                    return Err(ParseError::unexpected_char('=', start));
                }
            }
            '!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::NotEq, offset: start });
                    pos += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Not, offset: start });
                    pos += 1;
                }
            }
            '<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Le, offset: start });
                    pos += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Lt, offset: start });
                    pos += 1;
                }
            }
            '>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Ge, offset: start });
                    pos += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Gt, offset: start });
                    pos += 1;
                }
            }
            '&' => {
                if bytes.get(pos + 1) == Some(&b'&') {
                    tokens.push(Token { kind: TokenKind::AndAnd, offset: start });
                    pos += 2;
                } else {
                    return Err(ParseError::unexpected_char('&', start));
                }
            }
            '|' => {
                if bytes.get(pos + 1) == Some(&b'|') {
                    tokens.push(Token { kind: TokenKind::OrOr, offset: start });
                    pos += 2;
                } else {
                    return Err(ParseError::unexpected_char('|', start));
                }
            }
            '"' => {
                let (literal, next) = lex_string(source, pos)?;
                tokens.push(Token { kind: TokenKind::Str(literal), offset: start });
                pos = next;
            }
            _ if c.is_ascii_digit() => {
                let (kind, next) = lex_number(source, pos)?;
                tokens.push(Token { kind, offset: start });
                pos = next;
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = pos + 1;
                while end < bytes.len()
                    && ((bytes[end] as char).is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                let word = &source[pos..end];
                let kind = match word {
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    "nil" => TokenKind::Nil,
                    "startsWith" => TokenKind::StartsWith,
                    "endsWith" => TokenKind::EndsWith,
                    "contains" => TokenKind::Contains,
                    "in" => TokenKind::In,
                    "and" => TokenKind::AndAnd,
                    "or" => TokenKind::OrOr,
                    "not" => TokenKind::Not,
                    _ => TokenKind::Ident(word.to_string()),
                };
                tokens.push(Token { kind, offset: start });
                pos = end;
            }
            other => return Err(ParseError::unexpected_char(other, start)),
        }
    }

    Ok(tokens)
}

/// Lex a double-quoted string with `\"`, `\\`, `\n`, `\t` escapes.
fn lex_string(source: &str, start: usize) -> Result<(String, usize), ParseError> {
    let bytes = source.as_bytes();
    let mut out = String::new();
    let mut pos = start + 1;
    while pos < bytes.len() {
        match bytes[pos] {
            b'"' => return Ok((out, pos + 1)),
            b'\\' => {
                let escaped = bytes.get(pos + 1).copied().ok_or_else(|| {
                    ParseError::new("unterminated string literal", start)
                })?;
                match escaped {
                    b'"' => out.push('"'),
                    b'\\' => out.push('\\'),
                    b'n' => out.push('\n'),
                    b't' => out.push('\t'),
                    other => {
                        return Err(ParseError::new(
                            format!("unknown escape `\\{}`", other as char),
                            pos,
                        ))
                    }
                }
                pos += 2;
            }
            _ => {
                // Multi-byte characters pass through untouched.
                let ch = source[pos..].chars().next().unwrap_or('\u{FFFD}');
                out.push(ch);
                pos += ch.len_utf8();
            }
        }
    }
    Err(ParseError::new("unterminated string literal", start))
}

fn lex_number(source: &str, start: usize) -> Result<(TokenKind, usize), ParseError> {
    let bytes = source.as_bytes();
    let mut end = start;
    let mut is_float = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => end += 1,
            // A dot is part of the number only when a digit follows;
            // otherwise it is field access on an integer (not supported,
            // caught by the parser).
            b'.' if !is_float
                && bytes
                    .get(end + 1)
                    .is_some_and(|b| b.is_ascii_digit()) =>
            {
                is_float = true;
                end += 1;
            }
            _ => break,
        }
    }
    let text = &source[start..end];
    let kind = if is_float {
        TokenKind::Float(
            text.parse()
                .map_err(|_| ParseError::new(format!("bad float literal `{text}`"), start))?,
        )
    } else {
        TokenKind::Int(
            text.parse()
                .map_err(|_| ParseError::new(format!("bad integer literal `{text}`"), start))?,
        )
    };
    Ok((kind, end))
}
