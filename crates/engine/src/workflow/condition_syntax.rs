//! Step condition parsing and evaluation.
//!
//! A condition is one or more comparisons joined by `&&`:
//!
//! ```text
//! condition  := comparison ( "&&" comparison )*
//! comparison := operand op operand
//! op         := ">" | "<" | ">=" | "<=" | "==" | "!="
//! operand    := identifier | integer | size
//! size       := number unit        (unit: B, KB, MB, GB, TB; 1024-based)
//! ```
//!
//! `||`, `!`, and parentheses are rejected when the workflow loads. At run time
//! a variable without a value makes the whole condition false.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::ValidationError;

static IDENTIFIER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex should compile"));
static NUMBER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?)\s*([KkMmGgTt]?[Bb])?$").expect("number regex should compile")
});

/// Read access to the numeric variables a condition may reference.
pub trait ConditionScope {
    fn numeric_variable(&self, name: &str) -> Option<i64>;
}

impl ConditionScope for HashMap<String, i64> {
    fn numeric_variable(&self, name: &str) -> Option<i64> {
        self.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Equal,
    NotEqual,
}

impl ComparisonOperator {
    fn as_str(&self) -> &'static str {
        match self {
            ComparisonOperator::Greater => ">",
            ComparisonOperator::Less => "<",
            ComparisonOperator::GreaterOrEqual => ">=",
            ComparisonOperator::LessOrEqual => "<=",
            ComparisonOperator::Equal => "==",
            ComparisonOperator::NotEqual => "!=",
        }
    }

    fn apply(&self, left: i64, right: i64) -> bool {
        match self {
            ComparisonOperator::Greater => left > right,
            ComparisonOperator::Less => left < right,
            ComparisonOperator::GreaterOrEqual => left >= right,
            ComparisonOperator::LessOrEqual => left <= right,
            ComparisonOperator::Equal => left == right,
            ComparisonOperator::NotEqual => left != right,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Variable(String),
    /// Integer literal; size literals are normalised to bytes.
    Literal(i64),
}

impl Operand {
    fn resolve(&self, scope: &dyn ConditionScope) -> Option<i64> {
        match self {
            Operand::Variable(name) => scope.numeric_variable(name),
            Operand::Literal(value) => Some(*value),
        }
    }

    /// Variable name, when this operand is one.
    pub fn variable(&self) -> Option<&str> {
        match self {
            Operand::Variable(name) => Some(name),
            Operand::Literal(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub left: Operand,
    pub operator: ComparisonOperator,
    pub right: Operand,
}

impl Comparison {
    fn evaluate(&self, scope: &dyn ConditionScope) -> Option<bool> {
        let left = self.left.resolve(scope)?;
        let right = self.right.resolve(scope)?;
        Some(self.operator.apply(left, right))
    }
}

/// A parsed condition: all comparisons must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    source: String,
    comparisons: Vec<Comparison>,
}

impl Condition {
    pub fn parse(expression: &str) -> Result<Self, ValidationError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::condition(expression, "expression cannot be empty"));
        }
        if contains_operator(trimmed, "||") {
            return Err(ValidationError::condition(expression, "unsupported operator '||'"));
        }
        if trimmed.contains(['(', ')']) {
            return Err(ValidationError::condition(expression, "parentheses are not supported"));
        }
        if contains_negation(trimmed) {
            return Err(ValidationError::condition(expression, "unsupported operator '!'"));
        }

        let parts = split_expression(trimmed, "&&");
        if parts.iter().any(|part| part.is_empty()) {
            return Err(ValidationError::condition(expression, "'&&' requires a comparison on both sides"));
        }
        let comparisons = parts
            .into_iter()
            .map(|part| parse_comparison(expression, part))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: trimmed.to_string(),
            comparisons,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn comparisons(&self) -> &[Comparison] {
        &self.comparisons
    }

    /// True when every comparison holds; false as soon as a variable is missing.
    pub fn evaluate(&self, scope: &dyn ConditionScope) -> bool {
        for comparison in &self.comparisons {
            match comparison.evaluate(scope) {
                Some(true) => continue,
                Some(false) | None => return false,
            }
        }
        true
    }

    /// Variable names referenced by this condition.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.comparisons
            .iter()
            .flat_map(|comparison| [comparison.left.variable(), comparison.right.variable()])
            .flatten()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Validates a condition expression without keeping the parse.
pub fn validate_condition_expression(expression: &str) -> Result<(), ValidationError> {
    Condition::parse(expression).map(|_| ())
}

/// Evaluates an optional condition; an absent condition always holds.
pub fn eval_condition(expression: Option<&str>, scope: &dyn ConditionScope) -> Result<bool, ValidationError> {
    match expression.map(str::trim) {
        None | Some("") => Ok(true),
        Some(expression) => Ok(Condition::parse(expression)?.evaluate(scope)),
    }
}

/// Parses a size or integer literal (`50MB`, `1.5GB`, `42`) into an integer.
pub fn parse_size_literal(text: &str) -> Option<i64> {
    let captures = NUMBER_PATTERN.captures(text.trim())?;
    let magnitude: f64 = captures[1].parse().ok()?;
    let multiplier = match captures.get(2).map(|unit| unit.as_str().to_ascii_uppercase()) {
        None => 1.0,
        Some(unit) => match unit.as_str() {
            "B" => 1.0,
            "KB" => 1024.0,
            "MB" => 1024.0 * 1024.0,
            "GB" => 1024.0 * 1024.0 * 1024.0,
            "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
            _ => return None,
        },
    };
    let value = (magnitude * multiplier).round();
    if value > i64::MAX as f64 { None } else { Some(value as i64) }
}

fn parse_comparison(expression: &str, part: &str) -> Result<Comparison, ValidationError> {
    let Some((position, operator)) = find_comparison_operator(part) else {
        return Err(ValidationError::condition(
            expression,
            format!("'{part}' is not a comparison"),
        ));
    };
    let left_text = part[..position].trim();
    let right_text = part[position + operator.as_str().len()..].trim();
    if left_text.is_empty() || right_text.is_empty() {
        return Err(ValidationError::condition(
            expression,
            "comparison must include both left and right operands",
        ));
    }
    if find_comparison_operator(right_text).is_some() {
        return Err(ValidationError::condition(expression, "chained comparisons are not supported"));
    }

    Ok(Comparison {
        left: parse_operand(expression, left_text)?,
        operator,
        right: parse_operand(expression, right_text)?,
    })
}

fn parse_operand(expression: &str, text: &str) -> Result<Operand, ValidationError> {
    if IDENTIFIER_PATTERN.is_match(text) {
        return Ok(Operand::Variable(text.to_string()));
    }
    if let Some(value) = parse_size_literal(text) {
        return Ok(Operand::Literal(value));
    }
    Err(ValidationError::condition(
        expression,
        format!("unsupported operand '{text}'; expected a variable, integer, or size such as 50MB"),
    ))
}

fn find_comparison_operator(text: &str) -> Option<(usize, ComparisonOperator)> {
    let bytes = text.as_bytes();
    for (index, byte) in bytes.iter().enumerate() {
        let followed_by_equals = bytes.get(index + 1) == Some(&b'=');
        let operator = match (byte, followed_by_equals) {
            (b'>', true) => ComparisonOperator::GreaterOrEqual,
            (b'<', true) => ComparisonOperator::LessOrEqual,
            (b'=', true) => ComparisonOperator::Equal,
            (b'!', true) => ComparisonOperator::NotEqual,
            (b'>', false) => ComparisonOperator::Greater,
            (b'<', false) => ComparisonOperator::Less,
            _ => continue,
        };
        return Some((index, operator));
    }
    None
}

fn contains_negation(expression: &str) -> bool {
    let bytes = expression.as_bytes();
    bytes
        .iter()
        .enumerate()
        .any(|(index, byte)| *byte == b'!' && bytes.get(index + 1) != Some(&b'='))
}

fn split_expression<'a>(expression: &'a str, operator: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    while let Some(relative_index) = find_top_level_operator(&expression[start..], operator) {
        let absolute_index = start + relative_index;
        parts.push(expression[start..absolute_index].trim());
        start = absolute_index + operator.len();
    }
    parts.push(expression[start..].trim());
    parts
}

fn contains_operator(expression: &str, operator: &str) -> bool {
    find_top_level_operator(expression, operator).is_some()
}

fn find_top_level_operator(expression: &str, operator: &str) -> Option<usize> {
    expression
        .char_indices()
        .find(|(index, _)| expression[*index..].starts_with(operator))
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(values: &[(&str, i64)]) -> HashMap<String, i64> {
        values.iter().map(|(name, value)| (name.to_string(), *value)).collect()
    }

    #[test]
    fn compares_size_literals() {
        let condition = Condition::parse("total_size > 50MB").expect("parse");
        assert!(condition.evaluate(&scope(&[("total_size", 60 * 1024 * 1024)])));
        assert!(!condition.evaluate(&scope(&[("total_size", 10 * 1024 * 1024)])));
    }

    #[test]
    fn conjunction_requires_every_comparison() {
        let condition = Condition::parse("image_count >= 10 && total_size <= 1GB").expect("parse");
        let small_batch = scope(&[("image_count", 12), ("total_size", 1024)]);
        let few_images = scope(&[("image_count", 3), ("total_size", 1024)]);
        assert!(condition.evaluate(&small_batch));
        assert!(!condition.evaluate(&few_images));
    }

    #[test]
    fn missing_variable_makes_condition_false() {
        let condition = Condition::parse("image_count > 0 && unknown_metric != 3").expect("parse");
        assert!(!condition.evaluate(&scope(&[("image_count", 5)])));
    }

    #[test]
    fn all_operators_are_supported() {
        let values = scope(&[("n", 5)]);
        for (expression, expected) in [
            ("n > 4", true),
            ("n < 4", false),
            ("n >= 5", true),
            ("n <= 4", false),
            ("n == 5", true),
            ("n != 5", false),
            ("6 > n", true),
        ] {
            let condition = Condition::parse(expression).expect("parse");
            assert_eq!(condition.evaluate(&values), expected, "{expression}");
        }
    }

    #[test]
    fn size_units_are_case_insensitive_and_binary() {
        assert_eq!(parse_size_literal("1kb"), Some(1024));
        assert_eq!(parse_size_literal("2MB"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size_literal("1.5GB"), Some(1_610_612_736));
        assert_eq!(parse_size_literal("7B"), Some(7));
        assert_eq!(parse_size_literal("12"), Some(12));
        assert_eq!(parse_size_literal("12XB"), None);
    }

    #[test]
    fn rejects_unsupported_operators() {
        let error = Condition::parse("image_count > 1 || total_size > 1MB").expect_err("or is rejected");
        assert!(error.to_string().contains("unsupported operator"));
        let error = Condition::parse("!image_count").expect_err("negation is rejected");
        assert!(error.to_string().contains("unsupported operator"));
        assert!(Condition::parse("(image_count > 1)").is_err());
    }

    #[test]
    fn rejects_malformed_comparisons() {
        for bad in ["", "image_count", "image_count >", "> 3", "a > b > c", "a && ", "a = 3", "name == \"x\""] {
            assert!(Condition::parse(bad).is_err(), "expected '{bad}' to be rejected");
        }
    }

    #[test]
    fn absent_condition_holds() {
        assert!(eval_condition(None, &scope(&[])).expect("evaluate"));
        assert!(eval_condition(Some("  "), &scope(&[])).expect("evaluate"));
    }

    #[test]
    fn lists_referenced_variables() {
        let condition = Condition::parse("image_count > 0 && 1MB < total_size").expect("parse");
        let names: Vec<&str> = condition.variables().collect();
        assert_eq!(names, vec!["image_count", "total_size"]);
    }
}
