//! Expression parser
//!
//! Recursive descent over the token stream. Precedence, lowest first:
//! `or`, `and`, `not`, comparisons and `in`, `+ - ~`, `* / %`, unary minus,
//! filters (`|`), primaries.

use std::fmt;
use std::ops::Range;

use super::lexer::{tokenize, Token};
use crate::common::{Error, Result};
use crate::value::Value;

/// Filters understood by the evaluator
pub const FILTERS: &[&str] = &[
    "default", "int", "float", "string", "bool", "lower", "upper", "trim", "length", "join",
    "replace",
];

/// One step of a dotted path
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    pub fn as_key(&self) -> Option<&str> {
        match self {
            Segment::Key(k) => Some(k),
            Segment::Index(_) => None,
        }
    }
}

/// Render a path back to its dotted form for diagnostics
pub fn path_to_string(path: &[Segment]) -> String {
    let mut out = String::new();
    for (i, seg) in path.iter().enumerate() {
        match seg {
            Segment::Key(k) if i == 0 => out.push_str(k),
            Segment::Key(k) if is_plain_identifier(k) => {
                out.push('.');
                out.push_str(k);
            }
            Segment::Key(k) => {
                out.push_str(&format!("['{}']", k));
            }
            Segment::Index(n) => out.push_str(&format!("[{}]", n)),
        }
    }
    out
}

fn is_plain_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

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
    NotIn,
    Add,
    Sub,
    Concat,
    Mul,
    Div,
    Rem,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "not in",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Concat => "~",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        };
        f.write_str(s)
    }
}

/// Parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Path(Vec<Segment>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Filter {
        input: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Visit every path in the expression
    pub fn walk_paths<'a>(&'a self, visit: &mut dyn FnMut(&'a [Segment])) {
        match self {
            Expr::Literal(_) => {}
            Expr::List(items) => items.iter().for_each(|e| e.walk_paths(visit)),
            Expr::Path(path) => visit(path),
            Expr::Unary(_, inner) => inner.walk_paths(visit),
            Expr::Binary(_, lhs, rhs) => {
                lhs.walk_paths(visit);
                rhs.walk_paths(visit);
            }
            Expr::Filter { input, args, .. } => {
                input.walk_paths(visit);
                args.iter().for_each(|e| e.walk_paths(visit));
            }
        }
    }
}

/// Parse a complete expression
pub fn parse_expression(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(Error::template_syntax(source, "empty expression"));
    }
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let expr = parser.or_expr()?;
    if let Some((token, span)) = parser.tokens.get(parser.pos) {
        return Err(parser.error(format!(
            "unexpected {:?} at offset {}",
            token, span.start
        )));
    }
    Ok(expr)
}

struct Parser<'src> {
    source: &'src str,
    tokens: Vec<(Token, Range<usize>)>,
    pos: usize,
}

impl<'src> Parser<'src> {
    fn error(&self, message: impl Into<String>) -> Error {
        Error::template_syntax(self.source, message)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(match self.peek() {
                Some(found) => self.error(format!("expected {}, found {:?}", what, found)),
                None => self.error(format!("expected {}, found end of expression", what)),
            })
        }
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::Or) {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.not_expr()?;
        while self.eat(&Token::And) {
            let rhs = self.not_expr()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            let inner = self.not_expr()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            Some(Token::In) => BinaryOp::In,
            Some(Token::Not) if self.peek_at(1) == Some(&Token::In) => {
                self.pos += 1;
                BinaryOp::NotIn
            }
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                Some(Token::Tilde) => BinaryOp::Concat,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Minus) {
            let inner = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        self.filtered()
    }

    fn filtered(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        while self.eat(&Token::Pipe) {
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                other => return Err(self.error(format!("expected filter name, found {:?}", other))),
            };
            if !FILTERS.contains(&name.as_str()) {
                return Err(self.error(format!("unknown filter '{}'", name)));
            }
            let mut args = Vec::new();
            if self.eat(&Token::LParen) && !self.eat(&Token::RParen) {
                loop {
                    args.push(self.or_expr()?);
                    if self.eat(&Token::RParen) {
                        break;
                    }
                    self.expect(Token::Comma, "',' or ')'")?;
                }
            }
            expr = Expr::Filter {
                input: Box::new(expr),
                name,
                args,
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(root)) => self.path(root),
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.or_expr()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma, "',' or ']'")?;
                    }
                }
                Ok(Expr::List(items))
            }
            Some(other) => Err(self.error(format!("unexpected {:?}", other))),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn path(&mut self, root: String) -> Result<Expr> {
        let mut segments = vec![Segment::Key(root)];
        loop {
            if self.eat(&Token::Dot) {
                match self.advance() {
                    Some(Token::Ident(key)) => segments.push(Segment::Key(key)),
                    Some(Token::Int(i)) => segments.push(Segment::Index(to_index(i, self)?)),
                    // keywords are valid attribute names after a dot
                    Some(Token::In) => segments.push(Segment::Key("in".into())),
                    Some(Token::Not) => segments.push(Segment::Key("not".into())),
                    Some(Token::And) => segments.push(Segment::Key("and".into())),
                    Some(Token::Or) => segments.push(Segment::Key("or".into())),
                    other => {
                        return Err(
                            self.error(format!("expected attribute name, found {:?}", other))
                        )
                    }
                }
            } else if self.eat(&Token::LBracket) {
                match self.advance() {
                    Some(Token::Str(key)) => segments.push(Segment::Key(key)),
                    Some(Token::Int(i)) => segments.push(Segment::Index(to_index(i, self)?)),
                    other => {
                        return Err(
                            self.error(format!("expected string or index, found {:?}", other))
                        )
                    }
                }
                self.expect(Token::RBracket, "']'")?;
            } else {
                return Ok(Expr::Path(segments));
            }
        }
    }
}

fn to_index(i: i64, parser: &Parser<'_>) -> Result<usize> {
    usize::try_from(i).map_err(|_| parser.error(format!("invalid index {}", i)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(parts: &[&str]) -> Expr {
        Expr::Path(parts.iter().map(|p| Segment::Key(p.to_string())).collect())
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expression("a + b * 2 > 3 and not c").unwrap();
        let Expr::Binary(BinaryOp::And, lhs, rhs) = expr else {
            panic!("expected 'and' at the top");
        };
        assert!(matches!(*lhs, Expr::Binary(BinaryOp::Gt, _, _)));
        assert_eq!(*rhs, Expr::Unary(UnaryOp::Not, Box::new(path(&["c"]))));
    }

    #[test]
    fn test_filter_binds_tighter_than_arithmetic() {
        let expr = parse_expression("x | int + 1").unwrap();
        let Expr::Binary(BinaryOp::Add, lhs, _) = expr else {
            panic!("expected addition");
        };
        assert!(matches!(*lhs, Expr::Filter { ref name, .. } if name == "int"));
    }

    #[test]
    fn test_bracket_and_index_paths() {
        let expr = parse_expression("steps['build-model'].outputs.files[0]").unwrap();
        assert_eq!(
            expr,
            Expr::Path(vec![
                Segment::Key("steps".into()),
                Segment::Key("build-model".into()),
                Segment::Key("outputs".into()),
                Segment::Key("files".into()),
                Segment::Index(0),
            ])
        );
        let Expr::Path(p) = expr else { unreachable!() };
        assert_eq!(path_to_string(&p), "steps['build-model'].outputs.files[0]");
    }

    #[test]
    fn test_not_in() {
        let expr = parse_expression("'x' not in items").unwrap();
        assert!(matches!(expr, Expr::Binary(BinaryOp::NotIn, _, _)));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse_expression("").is_err());
        assert!(parse_expression("a +").is_err());
        assert!(parse_expression("(a").is_err());
        assert!(parse_expression("a | shout").is_err());
        assert!(parse_expression("a b").is_err());
    }
}
