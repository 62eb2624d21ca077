// elspeth-core/src/runtime/condition.rs
// ============================================================================
// Module: ELSPETH Trigger Conditions
// Description: Sandboxed boolean expressions for aggregation triggers.
// Purpose: Evaluate operator-only conditions over a fixed set of names.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! Aggregation triggers may carry a condition such as
//! `row['batch_count'] >= 50 and row['batch_age_seconds'] > 5`. The
//! expression language is deliberately tiny: numeric comparisons joined by
//! `and` / `or`, optionally negated with `not`, over a fixed environment of
//! names. There is no function call, no attribute access, and no assignment;
//! unknown names fail evaluation. Parse and evaluation errors are reported
//! as values so the engine can record them as validation errors instead of
//! crashing the run.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while parsing or evaluating a condition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    /// The expression could not be parsed.
    #[error("condition parse error: {0}")]
    Parse(String),
    /// The expression references a name outside the allowed environment.
    #[error("condition references unknown name '{0}'")]
    UnknownName(String),
    /// The expression combined values of incompatible types.
    #[error("condition type error: {0}")]
    Type(String),
}

// ============================================================================
// SECTION: Tokens
// ============================================================================

/// Lexical token of the condition language.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Numeric literal.
    Number(f64),
    /// Environment name (`batch_count` or `row['batch_count']`).
    Name(String),
    /// Comparison operator.
    Compare(Comparison),
    /// `and` / `&&`.
    And,
    /// `or` / `||`.
    Or,
    /// `not` / `!`.
    Not,
    /// Opening parenthesis.
    LeftParen,
    /// Closing parenthesis.
    RightParen,
}

/// Comparison operators supported by conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `<`
    Lt,
}

/// Tokenizes a condition string.
#[allow(
    clippy::too_many_lines,
    reason = "The lexer is one linear match over characters; splitting it would obscure the token set."
)]
fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut index = 0;
    while index < chars.len() {
        let ch = chars[index];
        if ch.is_whitespace() {
            index += 1;
            continue;
        }
        match ch {
            '(' => {
                tokens.push(Token::LeftParen);
                index += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                index += 1;
            }
            '=' if chars.get(index + 1) == Some(&'=') => {
                tokens.push(Token::Compare(Comparison::Eq));
                index += 2;
            }
            '!' if chars.get(index + 1) == Some(&'=') => {
                tokens.push(Token::Compare(Comparison::Ne));
                index += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                index += 1;
            }
            '>' if chars.get(index + 1) == Some(&'=') => {
                tokens.push(Token::Compare(Comparison::Ge));
                index += 2;
            }
            '<' if chars.get(index + 1) == Some(&'=') => {
                tokens.push(Token::Compare(Comparison::Le));
                index += 2;
            }
            '>' => {
                tokens.push(Token::Compare(Comparison::Gt));
                index += 1;
            }
            '<' => {
                tokens.push(Token::Compare(Comparison::Lt));
                index += 1;
            }
            '&' if chars.get(index + 1) == Some(&'&') => {
                tokens.push(Token::And);
                index += 2;
            }
            '|' if chars.get(index + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                index += 2;
            }
            _ if ch.is_ascii_digit() || ch == '.' => {
                let start = index;
                while index < chars.len()
                    && (chars[index].is_ascii_digit() || chars[index] == '.')
                {
                    index += 1;
                }
                let literal: String = chars[start..index].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|err| ConditionError::Parse(format!("bad number '{literal}': {err}")))?;
                tokens.push(Token::Number(value));
            }
            _ if ch.is_ascii_alphabetic() || ch == '_' => {
                let start = index;
                while index < chars.len()
                    && (chars[index].is_ascii_alphanumeric() || chars[index] == '_')
                {
                    index += 1;
                }
                let word: String = chars[start..index].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "row" => {
                        // row['name'] subscript form.
                        let name = parse_subscript(&chars, &mut index)?;
                        tokens.push(Token::Name(name));
                    }
                    _ => tokens.push(Token::Name(word)),
                }
            }
            _ => {
                return Err(ConditionError::Parse(format!("unexpected character '{ch}'")));
            }
        }
    }
    Ok(tokens)
}

/// Parses the `['name']` suffix of a `row` subscript.
fn parse_subscript(chars: &[char], index: &mut usize) -> Result<String, ConditionError> {
    if chars.get(*index) != Some(&'[') {
        return Err(ConditionError::Parse("expected [ after 'row'".to_string()));
    }
    *index += 1;
    let quote = chars.get(*index).copied();
    if quote != Some('\'') && quote != Some('"') {
        return Err(ConditionError::Parse("expected quoted name in row[...]".to_string()));
    }
    let quote_char = quote.unwrap_or('\'');
    *index += 1;
    let start = *index;
    while *index < chars.len() && chars[*index] != quote_char {
        *index += 1;
    }
    if *index >= chars.len() {
        return Err(ConditionError::Parse("unterminated row[...] name".to_string()));
    }
    let name: String = chars[start..*index].iter().collect();
    *index += 1;
    if chars.get(*index) != Some(&']') {
        return Err(ConditionError::Parse("expected ] after row name".to_string()));
    }
    *index += 1;
    Ok(name)
}

// ============================================================================
// SECTION: Parser
// ============================================================================

/// Parsed condition expression tree.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    /// Comparison between two operands.
    Compare {
        /// Left operand.
        left: Operand,
        /// Operator.
        op: Comparison,
        /// Right operand.
        right: Operand,
    },
    /// Logical conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Logical disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Logical negation.
    Not(Box<Expr>),
}

/// Comparison operand: a number or an environment name.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    /// Numeric literal.
    Number(f64),
    /// Environment name.
    Name(String),
}

/// A compiled, reusable condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Source text as configured, kept for audit reasons.
    source: String,
    /// Parsed expression tree.
    expr: Expr,
}

impl Condition {
    /// Parses a condition expression.
    ///
    /// # Errors
    ///
    /// Returns [`ConditionError::Parse`] when the input is not a valid
    /// expression of the condition language.
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(input)?;
        let mut cursor = Cursor { tokens, index: 0 };
        let expr = cursor.parse_or()?;
        if cursor.index != cursor.tokens.len() {
            return Err(ConditionError::Parse("trailing tokens after expression".to_string()));
        }
        Ok(Self { source: input.to_string(), expr })
    }

    /// Returns the source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the condition against an environment of numeric names.
    ///
    /// # Errors
    ///
    /// Returns [`ConditionError::UnknownName`] for names outside the
    /// environment.
    pub fn evaluate(&self, env: &BTreeMap<String, f64>) -> Result<bool, ConditionError> {
        eval_expr(&self.expr, env)
    }
}

/// Token cursor for recursive-descent parsing.
struct Cursor {
    /// Token stream.
    tokens: Vec<Token>,
    /// Current position.
    index: usize,
}

impl Cursor {
    /// Peeks the current token.
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index)
    }

    /// Advances and returns the current token.
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).cloned();
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    /// Parses an `or`-expression.
    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.index += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// Parses an `and`-expression.
    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.index += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// Parses a `not`-expression or primary.
    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.index += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    /// Parses a parenthesized expression or a comparison.
    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::LeftParen) {
            self.index += 1;
            let inner = self.parse_or()?;
            if self.next() != Some(Token::RightParen) {
                return Err(ConditionError::Parse("expected closing parenthesis".to_string()));
            }
            return Ok(inner);
        }
        let left = self.parse_operand()?;
        let Some(Token::Compare(op)) = self.peek().cloned() else {
            return Err(ConditionError::Parse(
                "expected comparison operator after operand".to_string(),
            ));
        };
        self.index += 1;
        let right = self.parse_operand()?;
        Ok(Expr::Compare { left, op, right })
    }

    /// Parses a single operand.
    fn parse_operand(&mut self) -> Result<Operand, ConditionError> {
        match self.next() {
            Some(Token::Number(value)) => Ok(Operand::Number(value)),
            Some(Token::Name(name)) => Ok(Operand::Name(name)),
            other => Err(ConditionError::Parse(format!(
                "expected a number or name, found {}",
                token_label(other.as_ref())
            ))),
        }
    }
}

/// Describes a token for parse errors without exposing internals.
fn token_label(token: Option<&Token>) -> &'static str {
    match token {
        None => "end of input",
        Some(Token::Number(_)) => "a number",
        Some(Token::Name(_)) => "a name",
        Some(Token::Compare(_)) => "a comparison operator",
        Some(Token::And) => "'and'",
        Some(Token::Or) => "'or'",
        Some(Token::Not) => "'not'",
        Some(Token::LeftParen) => "'('",
        Some(Token::RightParen) => "')'",
    }
}

// ============================================================================
// SECTION: Evaluation
// ============================================================================

/// Evaluates an expression tree.
fn eval_expr(expr: &Expr, env: &BTreeMap<String, f64>) -> Result<bool, ConditionError> {
    match expr {
        Expr::Compare { left, op, right } => {
            let lhs = eval_operand(left, env)?;
            let rhs = eval_operand(right, env)?;
            Ok(match op {
                Comparison::Eq => (lhs - rhs).abs() < f64::EPSILON,
                Comparison::Ne => (lhs - rhs).abs() >= f64::EPSILON,
                Comparison::Ge => lhs >= rhs,
                Comparison::Le => lhs <= rhs,
                Comparison::Gt => lhs > rhs,
                Comparison::Lt => lhs < rhs,
            })
        }
        Expr::And(left, right) => Ok(eval_expr(left, env)? && eval_expr(right, env)?),
        Expr::Or(left, right) => Ok(eval_expr(left, env)? || eval_expr(right, env)?),
        Expr::Not(inner) => Ok(!eval_expr(inner, env)?),
    }
}

/// Resolves an operand to a number.
fn eval_operand(operand: &Operand, env: &BTreeMap<String, f64>) -> Result<f64, ConditionError> {
    match operand {
        Operand::Number(value) => Ok(*value),
        Operand::Name(name) => env
            .get(name)
            .copied()
            .ok_or_else(|| ConditionError::UnknownName(name.clone())),
    }
}
