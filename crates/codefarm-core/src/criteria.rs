//! Tag criteria: boolean expressions over slave tags.
//!
//! A criteria string is a list of tag names joined by `AND` / `OR`
//! (also `and`/`&&`, `or`/`||`), optionally grouped with parentheses.
//! `AND` binds tighter than `OR`. An empty criteria matches every slave.
//!
//! ```text
//! linux AND (x86_64 OR aarch64)
//! ```

use std::collections::HashSet;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CriteriaError {
    #[error("unexpected end of criteria")]
    UnexpectedEnd,

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("missing operator between '{0}' and '{1}'")]
    MissingOperator(String, String),

    #[error("unbalanced parenthesis")]
    Unbalanced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Tag(String),
    And,
    Or,
    Open,
    Close,
}

impl Token {
    fn text(&self) -> String {
        match self {
            Token::Tag(tag) => tag.clone(),
            Token::And => "AND".to_string(),
            Token::Or => "OR".to_string(),
            Token::Open => "(".to_string(),
            Token::Close => ")".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Any,
    Tag(String),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    fn eval(&self, tags: &HashSet<&str>) -> bool {
        match self {
            Expr::Any => true,
            Expr::Tag(tag) => tags.contains(tag.as_str()),
            Expr::And(terms) => terms.iter().all(|t| t.eval(tags)),
            Expr::Or(terms) => terms.iter().any(|t| t.eval(tags)),
        }
    }
}

/// A parsed, immutable tag criteria.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCriteria {
    source: String,
    expr: Expr,
}

impl TagCriteria {
    /// Parse a criteria string.
    pub fn parse(criteria: &str) -> Result<Self, CriteriaError> {
        let tokens = tokenize(criteria);
        let expr = if tokens.is_empty() {
            Expr::Any
        } else {
            let mut parser = Parser { tokens, pos: 0 };
            let expr = parser.parse_or()?;
            if let Some(token) = parser.peek() {
                return Err(match token {
                    Token::Close => CriteriaError::Unbalanced,
                    other => CriteriaError::UnexpectedToken(other.text()),
                });
            }
            expr
        };

        Ok(Self {
            source: criteria.to_string(),
            expr,
        })
    }

    /// Criteria matching every slave.
    pub fn any() -> Self {
        Self {
            source: String::new(),
            expr: Expr::Any,
        }
    }

    /// Whether the criteria places no constraint at all.
    pub fn is_any(&self) -> bool {
        self.expr == Expr::Any
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate the criteria against a tag set.
    pub fn matches<I, S>(&self, tags: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let owned: Vec<S> = tags.into_iter().collect();
        let set: HashSet<&str> = owned.iter().map(|t| t.as_ref()).collect();
        self.expr.eval(&set)
    }
}

impl FromStr for TagCriteria {
    type Err = CriteriaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for TagCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    let flush = |word: &mut String, tokens: &mut Vec<Token>| {
        if word.is_empty() {
            return;
        }
        let token = match word.as_str() {
            "AND" | "and" | "&&" => Token::And,
            "OR" | "or" | "||" => Token::Or,
            _ => Token::Tag(word.clone()),
        };
        tokens.push(token);
        word.clear();
    };

    for c in input.chars() {
        match c {
            '(' | ')' => {
                flush(&mut word, &mut tokens);
                tokens.push(if c == '(' { Token::Open } else { Token::Close });
            }
            c if c.is_whitespace() => flush(&mut word, &mut tokens),
            c => word.push(c),
        }
    }
    flush(&mut word, &mut tokens);

    tokens
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, CriteriaError> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, CriteriaError> {
        let mut terms = vec![self.parse_primary()?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                    terms.push(self.parse_primary()?);
                }
                Some(next @ (Token::Tag(_) | Token::Open)) => {
                    let prev = self.tokens[self.pos - 1].text();
                    return Err(CriteriaError::MissingOperator(prev, next.text()));
                }
                _ => break,
            }
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, CriteriaError> {
        match self.next() {
            Some(Token::Tag(tag)) => Ok(Expr::Tag(tag)),
            Some(Token::Open) => {
                let expr = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(expr),
                    Some(other) => Err(CriteriaError::UnexpectedToken(other.text())),
                    None => Err(CriteriaError::Unbalanced),
                }
            }
            Some(Token::Close) => Err(CriteriaError::Unbalanced),
            Some(other) => Err(CriteriaError::UnexpectedToken(other.text())),
            None => Err(CriteriaError::UnexpectedEnd),
        }
    }
}
