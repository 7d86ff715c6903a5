//! Arithmetic/boolean expressions over channel metrics.
//!
//! The grammar admits numeric literals, the metric placeholders, parentheses,
//! arithmetic (`+ - * / // % **`), comparisons (chainable, `a < b < c`) and
//! boolean operators (`and or not`, also spelled `&& || !`). There are no
//! other identifiers and no calls, so nothing outside the metric snapshot
//! can be reached.
//!
//! Precedence, loosest first:
//!
//! ```text
//! or  ->  and  ->  not  ->  comparison  ->  + -  ->  * / // %  ->  unary -  ->  **
//! ```

use super::{ChannelMetrics, Metric};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("expression is empty")]
    Empty,
    #[error("unexpected character {ch:?} at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("unknown identifier {0:?}")]
    UnknownIdentifier(String),
    #[error("unexpected {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("division by zero")]
    DivisionByZero,
    #[error("expression nests deeper than {} levels", MAX_NESTING)]
    TooDeep,
    #[error("expression has more than {} tokens", MAX_TOKENS)]
    TooLong,
}

/// Bound on parenthesised, `not`, unary and `**` nesting.
pub const MAX_NESTING: usize = 32;
/// Bound on the size of an expression, which also bounds the depth of the
/// left-associative chains evaluated recursively.
pub const MAX_TOKENS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Metric(Metric),
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    StarStar,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Not,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Num(n) => format!("number {}", n),
            Token::Metric(m) => format!("placeholder {}", m.name()),
            other => format!("{:?}", other),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, PolicyError> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|&(_, c)| c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || matches!(chars[i].1, '.' | '_')) {
                i += 1;
            }
            let raw: String = chars[start..i].iter().map(|&(_, c)| c).collect();
            let value = raw
                .replace('_', "")
                .parse::<f64>()
                .map_err(|_| PolicyError::InvalidNumber(raw.clone()))?;
            tokens.push(Token::Num(value));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().map(|&(_, c)| c).collect();
            let token = match word.as_str() {
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                _ => Token::Metric(
                    Metric::from_name(&word).ok_or(PolicyError::UnknownIdentifier(word))?,
                ),
            };
            tokens.push(token);
            continue;
        }

        let (token, width) = match (c, next) {
            ('*', Some('*')) => (Token::StarStar, 2),
            ('/', Some('/')) => (Token::SlashSlash, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('!', _) => (Token::Not, 1),
            _ => return Err(PolicyError::UnexpectedChar { ch: c, offset }),
        };
        tokens.push(token);
        i += width;
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Num(f64),
    Metric(Metric),
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Compare(Box<Node>, Vec<(CmpOp, Node)>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, PolicyError>,
    ) -> Result<T, PolicyError> {
        if self.depth >= MAX_NESTING {
            return Err(PolicyError::TooDeep);
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> Result<Node, PolicyError> {
        let mut node = self.and()?;
        while self.eat(Token::Or) {
            node = Node::Or(Box::new(node), Box::new(self.and()?));
        }
        Ok(node)
    }

    fn and(&mut self) -> Result<Node, PolicyError> {
        let mut node = self.not()?;
        while self.eat(Token::And) {
            node = Node::And(Box::new(node), Box::new(self.not()?));
        }
        Ok(node)
    }

    fn not(&mut self) -> Result<Node, PolicyError> {
        if self.eat(Token::Not) {
            return Ok(Node::Not(Box::new(self.nested(Self::not)?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Node, PolicyError> {
        let first = self.sum()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::Le) => CmpOp::Le,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::Ge) => CmpOp::Ge,
                Some(Token::Eq) => CmpOp::Eq,
                Some(Token::Ne) => CmpOp::Ne,
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.sum()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Node::Compare(Box::new(first), rest))
        }
    }

    fn sum(&mut self) -> Result<Node, PolicyError> {
        let mut node = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(node),
            };
            self.pos += 1;
            node = Node::Binary(op, Box::new(node), Box::new(self.term()?));
        }
    }

    fn term(&mut self) -> Result<Node, PolicyError> {
        let mut node = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::SlashSlash) => BinOp::FloorDiv,
                Some(Token::Percent) => BinOp::Mod,
                _ => return Ok(node),
            };
            self.pos += 1;
            node = Node::Binary(op, Box::new(node), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<Node, PolicyError> {
        if self.eat(Token::Minus) {
            return Ok(Node::Neg(Box::new(self.nested(Self::unary)?)));
        }
        if self.eat(Token::Plus) {
            return self.nested(Self::unary);
        }
        self.power()
    }

    // `**` binds tighter than unary minus on its left and is right-associative.
    fn power(&mut self) -> Result<Node, PolicyError> {
        let base = self.atom()?;
        if self.eat(Token::StarStar) {
            let exponent = self.nested(Self::unary)?;
            return Ok(Node::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Node, PolicyError> {
        match self.advance() {
            Some(Token::Num(n)) => Ok(Node::Num(n)),
            Some(Token::Metric(m)) => Ok(Node::Metric(m)),
            Some(Token::LParen) => {
                let inner = self.nested(Self::or)?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(PolicyError::UnexpectedToken(other.describe())),
                    None => Err(PolicyError::UnexpectedEnd),
                }
            }
            Some(other) => Err(PolicyError::UnexpectedToken(other.describe())),
            None => Err(PolicyError::UnexpectedEnd),
        }
    }
}

/// A compiled continuation expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    root: Node,
}

impl Expression {
    /// Compile `text`, stripping an optional `IF(...)` guard wrapper first.
    pub fn compile(text: &str) -> Result<Self, PolicyError> {
        let body = strip_guard(text.trim());
        let tokens = tokenize(body)?;
        if tokens.is_empty() {
            return Err(PolicyError::Empty);
        }
        if tokens.len() > MAX_TOKENS {
            return Err(PolicyError::TooLong);
        }

        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.or()?;
        if let Some(extra) = parser.peek() {
            return Err(PolicyError::UnexpectedToken(extra.describe()));
        }
        Ok(Self { root })
    }

    /// Evaluate against a metric snapshot; a non-zero result is true.
    pub fn evaluate(&self, metrics: &ChannelMetrics) -> Result<bool, PolicyError> {
        Ok(truthy(eval(&self.root, metrics)?))
    }

    /// Raw numeric result, booleans as 1/0.
    #[cfg(test)]
    pub fn value(&self, metrics: &ChannelMetrics) -> Result<f64, PolicyError> {
        eval(&self.root, metrics)
    }
}

fn strip_guard(text: &str) -> &str {
    text.strip_prefix("IF(")
        .and_then(|rest| rest.strip_suffix(')'))
        .unwrap_or(text)
}

fn truthy(v: f64) -> bool {
    v != 0.0
}

fn from_bool(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn eval(node: &Node, metrics: &ChannelMetrics) -> Result<f64, PolicyError> {
    Ok(match node {
        Node::Num(n) => *n,
        Node::Metric(m) => metrics.get(*m) as f64,
        Node::Neg(inner) => -eval(inner, metrics)?,
        Node::Not(inner) => from_bool(!truthy(eval(inner, metrics)?)),
        // `and`/`or` short-circuit and yield an operand, not a bool.
        Node::And(lhs, rhs) => {
            let l = eval(lhs, metrics)?;
            if truthy(l) {
                eval(rhs, metrics)?
            } else {
                l
            }
        }
        Node::Or(lhs, rhs) => {
            let l = eval(lhs, metrics)?;
            if truthy(l) {
                l
            } else {
                eval(rhs, metrics)?
            }
        }
        Node::Compare(first, rest) => {
            let mut left = eval(first, metrics)?;
            for (op, node) in rest {
                let right = eval(node, metrics)?;
                let holds = match op {
                    CmpOp::Lt => left < right,
                    CmpOp::Le => left <= right,
                    CmpOp::Gt => left > right,
                    CmpOp::Ge => left >= right,
                    CmpOp::Eq => left == right,
                    CmpOp::Ne => left != right,
                };
                if !holds {
                    return Ok(0.0);
                }
                left = right;
            }
            1.0
        }
        Node::Binary(op, lhs, rhs) => {
            let l = eval(lhs, metrics)?;
            let r = eval(rhs, metrics)?;
            match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Pow => l.powf(r),
                BinOp::Div | BinOp::FloorDiv | BinOp::Mod if r == 0.0 => {
                    return Err(PolicyError::DivisionByZero)
                }
                BinOp::Div => l / r,
                BinOp::FloorDiv => (l / r).floor(),
                // Sign follows the divisor.
                BinOp::Mod => l - r * (l / r).floor(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> ChannelMetrics {
        ChannelMetrics {
            local_available: 100_000,
            remote_available: 900_000,
            capacity_available: 1_000_000,
            local_available_percentage: 10,
            remote_available_percentage: 90,
            local_fee_rate: 250,
            local_fee_base: 1000,
            remote_fee_rate: 50,
            remote_fee_base: 0,
        }
    }

    fn eval_str(text: &str) -> Result<bool, PolicyError> {
        Expression::compile(text)?.evaluate(&metrics())
    }

    fn value_of(text: &str) -> f64 {
        Expression::compile(text).unwrap().value(&metrics()).unwrap()
    }

    #[test]
    fn test_simple_comparison() {
        assert!(eval_str("LOCAL_AVAILABLE_PERCENTAGE < 20").unwrap());
        assert!(!eval_str("LOCAL_AVAILABLE_PERCENTAGE > 20").unwrap());
    }

    #[test]
    fn test_guard_wrapper_stripped() {
        assert!(eval_str("IF(LOCAL_AVAILABLE_PERCENTAGE < 20)").unwrap());
        assert!(eval_str("  IF(REMOTE_FEE_RATE <= 50)  ").unwrap());
    }

    #[test]
    fn test_no_whitespace_needed() {
        assert!(eval_str("LOCAL_AVAILABLE<REMOTE_AVAILABLE").unwrap());
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(value_of("1 + 2 * 3"), 7.0);
        assert_eq!(value_of("(1 + 2) * 3"), 9.0);
        assert_eq!(value_of("-2 ** 2"), -4.0);
        assert_eq!(value_of("2 ** 3 ** 2"), 512.0);
        assert_eq!(value_of("7 // 2"), 3.0);
        assert_eq!(value_of("-7 // 2"), -4.0);
        assert_eq!(value_of("-7 % 3"), 2.0);
        assert_eq!(value_of("50_000 / 2"), 25_000.0);
        assert_eq!(value_of(".5 + 0.25"), 0.75);
    }

    #[test]
    fn test_boolean_operators() {
        assert!(eval_str("LOCAL_FEE_RATE > 100 and REMOTE_FEE_RATE < 100").unwrap());
        assert!(eval_str("LOCAL_FEE_RATE > 1000 or REMOTE_FEE_RATE < 100").unwrap());
        assert!(eval_str("not LOCAL_FEE_RATE > 1000").unwrap());
        assert!(eval_str("LOCAL_FEE_RATE > 100 && !(REMOTE_FEE_BASE > 0)").unwrap());
        assert!(!eval_str("LOCAL_FEE_RATE > 1000 || REMOTE_FEE_RATE > 1000").unwrap());
    }

    #[test]
    fn test_chained_comparison() {
        assert!(eval_str("5 < LOCAL_AVAILABLE_PERCENTAGE < 20").unwrap());
        assert!(!eval_str("10 < LOCAL_AVAILABLE_PERCENTAGE < 20").unwrap());
        assert!(eval_str("CAPACITY_AVAILABLE == LOCAL_AVAILABLE + REMOTE_AVAILABLE").unwrap());
    }

    #[test]
    fn test_and_or_yield_operands() {
        assert_eq!(value_of("0 or 7"), 7.0);
        assert_eq!(value_of("3 and 0"), 0.0);
    }

    #[test]
    fn test_bare_arithmetic_truthiness() {
        assert!(eval_str("LOCAL_FEE_BASE").unwrap());
        assert!(!eval_str("REMOTE_FEE_BASE").unwrap());
        assert!(!eval_str("LOCAL_FEE_RATE - 250").unwrap());
    }

    #[test]
    fn test_rejects_names_and_calls() {
        for text in [
            "__import__('os')",
            "eval('1')",
            "exec",
            "open",
            "local_available < 5",
            "True",
        ] {
            let err = Expression::compile(text).unwrap_err();
            assert!(
                matches!(err, PolicyError::UnknownIdentifier(_)),
                "{} gave {:?}",
                text,
                err
            );
        }
    }

    #[test]
    fn test_rejects_foreign_syntax() {
        assert!(matches!(
            Expression::compile("LOCAL_AVAILABLE.real").unwrap_err(),
            PolicyError::UnexpectedChar { ch: '.', .. } | PolicyError::UnknownIdentifier(_)
        ));
        assert!(matches!(
            Expression::compile("[1, 2]").unwrap_err(),
            PolicyError::UnexpectedChar { ch: '[', .. }
        ));
        assert!(matches!(
            Expression::compile("LOCAL_AVAILABLE = 5").unwrap_err(),
            PolicyError::UnexpectedChar { ch: '=', .. }
        ));
    }

    #[test]
    fn test_malformed_expressions() {
        assert_eq!(Expression::compile("").unwrap_err(), PolicyError::Empty);
        assert_eq!(Expression::compile("IF()").unwrap_err(), PolicyError::Empty);
        assert_eq!(
            Expression::compile("1 +").unwrap_err(),
            PolicyError::UnexpectedEnd
        );
        assert_eq!(
            Expression::compile("(1 + 2").unwrap_err(),
            PolicyError::UnexpectedEnd
        );
        assert!(matches!(
            Expression::compile("1 2").unwrap_err(),
            PolicyError::UnexpectedToken(_)
        ));
        assert!(matches!(
            Expression::compile("1.2.3").unwrap_err(),
            PolicyError::InvalidNumber(_)
        ));
    }

    #[test]
    fn test_nesting_is_bounded() {
        let nested = |n: usize| format!("{}1{}", "(".repeat(n), ")".repeat(n));
        assert_eq!(value_of(&nested(MAX_NESTING)), 1.0);
        assert_eq!(
            Expression::compile(&nested(MAX_NESTING + 1)).unwrap_err(),
            PolicyError::TooDeep
        );
        assert_eq!(
            Expression::compile(&format!("{}1", "not ".repeat(40))).unwrap_err(),
            PolicyError::TooDeep
        );
        assert_eq!(
            Expression::compile(&format!("{}1", "-".repeat(40))).unwrap_err(),
            PolicyError::TooDeep
        );
        assert_eq!(
            Expression::compile(&format!("1{}", " ** 1".repeat(40))).unwrap_err(),
            PolicyError::TooDeep
        );
    }

    #[test]
    fn test_huge_expressions_fail_instead_of_crashing() {
        let deep = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        assert!(Expression::compile(&deep).is_err());
        let long = format!("1{}", " + 1".repeat(100_000));
        assert_eq!(Expression::compile(&long).unwrap_err(), PolicyError::TooLong);
    }

    #[test]
    fn test_division_by_zero_is_error() {
        let expr = Expression::compile("LOCAL_AVAILABLE / REMOTE_FEE_BASE > 1").unwrap();
        assert_eq!(expr.evaluate(&metrics()), Err(PolicyError::DivisionByZero));
    }
}
