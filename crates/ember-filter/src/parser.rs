//! Recursive-descent parser producing [`Expr`] trees.
//!
//! Precedence, loosest first: ternary, `||`, `&&`, comparisons and string
//! operators, `+ -`, `* / %`, unary, postfix (field access, indexing,
//! calls).

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::token::{tokenize, Token, TokenKind};
use crate::ParseError;

pub fn parse(source: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    if let Some(token) = parser.peek() {
        return Err(ParseError::new(
            format!("trailing input at {}", token.kind.describe()),
            token.offset,
        ));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn end_offset(&self) -> usize {
        self.tokens.last().map_or(0, |t| t.offset + 1)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().map(|t| &t.kind) == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), ParseError> {
        match self.advance() {
            Some(token) if &token.kind == kind => Ok(()),
            Some(token) => Err(ParseError::new(
                format!(
                    "expected {}, found {}",
                    kind.describe(),
                    token.kind.describe()
                ),
                token.offset,
            )),
            None => Err(ParseError::new(
                format!("expected {}, found end of input", kind.describe()),
                self.end_offset(),
            )),
        }
    }

    fn ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.or()?;
        if self.eat(&TokenKind::Question) {
            let then = self.ternary()?;
            self.expect(&TokenKind::Colon)?;
            let otherwise = self.ternary()?;
            return Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.and()?;
        while self.eat(&TokenKind::OrOr) {
            let right = self.and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.comparison()?;
        while self.eat(&TokenKind::AndAnd) {
            let right = self.comparison()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.additive()?;
        let op = match self.peek().map(|t| &t.kind) {
            Some(TokenKind::EqEq) => BinaryOp::Eq,
            Some(TokenKind::NotEq) => BinaryOp::NotEq,
            Some(TokenKind::Lt) => BinaryOp::Lt,
            Some(TokenKind::Le) => BinaryOp::Le,
            Some(TokenKind::Gt) => BinaryOp::Gt,
            Some(TokenKind::Ge) => BinaryOp::Ge,
            Some(TokenKind::StartsWith) => BinaryOp::StartsWith,
            Some(TokenKind::EndsWith) => BinaryOp::EndsWith,
            Some(TokenKind::Contains) => BinaryOp::Contains,
            Some(TokenKind::In) => BinaryOp::In,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                Some(TokenKind::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&TokenKind::Not) {
            let operand = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        if self.eat(&TokenKind::Minus) {
            let operand = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                match self.advance() {
                    Some(Token {
                        kind: TokenKind::Ident(field),
                        ..
                    }) => expr = Expr::Field(Box::new(expr), field),
                    Some(token) => {
                        return Err(ParseError::new(
                            format!("expected field name, found {}", token.kind.describe()),
                            token.offset,
                        ))
                    }
                    None => {
                        return Err(ParseError::new(
                            "expected field name, found end of input",
                            self.end_offset(),
                        ))
                    }
                }
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.ternary()?;
                self.expect(&TokenKind::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance().ok_or_else(|| {
            ParseError::new("expected expression, found end of input", self.end_offset())
        })?;
        match token.kind {
            TokenKind::Nil => Ok(Expr::Nil),
            TokenKind::True => Ok(Expr::Bool(true)),
            TokenKind::False => Ok(Expr::Bool(false)),
            TokenKind::Int(n) => Ok(Expr::Int(n)),
            TokenKind::Float(x) => Ok(Expr::Float(x)),
            TokenKind::Str(s) => Ok(Expr::Str(s)),
            TokenKind::Ident(name) => {
                // A call only ever follows a bare identifier (the five
                // typed helpers); everything else is a variable.
                if self.eat(&TokenKind::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&TokenKind::RParen) {
                        loop {
                            args.push(self.ternary()?);
                            if self.eat(&TokenKind::RParen) {
                                break;
                            }
                            self.expect(&TokenKind::Comma)?;
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            TokenKind::LParen => {
                let inner = self.ternary()?;
                self.expect(&TokenKind::RParen)?;
                Ok(inner)
            }
            other => Err(ParseError::new(
                format!("expected expression, found {}", other.describe()),
                token.offset,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_field_chains_and_calls() {
        let expr = parse(r#"AsInt(Tags["n"]) >= 3 && Target.User.Nick == "B""#).unwrap();
        match expr {
            Expr::Binary(BinaryOp::And, left, right) => {
                assert!(matches!(*left, Expr::Binary(BinaryOp::Ge, _, _)));
                assert!(matches!(*right, Expr::Binary(BinaryOp::Eq, _, _)));
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn ternary_is_right_associative() {
        let expr = parse("true ? 1 : false ? 2 : 3").unwrap();
        match expr {
            Expr::Ternary(_, then, otherwise) => {
                assert_eq!(*then, Expr::Int(1));
                assert!(matches!(*otherwise, Expr::Ternary(_, _, _)));
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn precedence_of_arithmetic() {
        let expr = parse("1 + 2 * 3 == 7").unwrap();
        assert!(matches!(expr, Expr::Binary(BinaryOp::Eq, _, _)));
    }

    #[test]
    fn starts_with_operator() {
        let expr = parse(r#"Target.Client.ClientLanguage startsWith "de""#).unwrap();
        assert!(matches!(expr, Expr::Binary(BinaryOp::StartsWith, _, _)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("1 +").is_err());
        assert!(parse("(1").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("x.1").is_err());
    }
}
