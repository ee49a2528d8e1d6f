//! # Label Selectors
//!
//! Parses the `--loki-label-selector` flag into a `kube::core::Selector`.
//!
//! The grammar is the one `kubectl -l` accepts:
//! - equality: `app=loki`, `app==loki`
//! - inequality: `tier!=cache`
//! - existence: `app`, `!canary`
//! - set-based: `env in (prod, staging)`, `env notin (dev)`
//!
//! Requirements are comma separated and all of them must hold. `kube` has no
//! string parser for selectors, so only the parsing lives here; matching and
//! rendering come from `kube::core::{Selector, SelectorExt}`.

use kube::core::{Expression, Selector, SelectorExt};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("label selector must not be empty")]
    Empty,
    #[error("invalid label selector requirement '{0}'")]
    InvalidRequirement(String),
    #[error("invalid label key '{0}'")]
    InvalidKey(String),
    #[error("unbalanced parentheses in label selector '{0}'")]
    UnbalancedParentheses(String),
}

fn parse_expression(raw: &str) -> Result<Expression, SelectorError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SelectorError::InvalidRequirement(raw.to_string()));
    }

    if let Some(key) = raw.strip_prefix('!') {
        return Ok(Expression::DoesNotExist(validate_key(key.trim())?));
    }

    // Set-based requirements have the shape `<key> <op> (<values>)`
    if let Some(open) = raw.find('(') {
        let close = raw
            .rfind(')')
            .filter(|close| *close == raw.len() - 1 && *close > open)
            .ok_or_else(|| SelectorError::UnbalancedParentheses(raw.to_string()))?;
        let head: Vec<&str> = raw[..open].split_whitespace().collect();
        let values: BTreeSet<String> = raw[open + 1..close]
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        return match head.as_slice() {
            [key, "in"] => Ok(Expression::In(validate_key(key)?, values)),
            [key, "notin"] => Ok(Expression::NotIn(validate_key(key)?, values)),
            _ => Err(SelectorError::InvalidRequirement(raw.to_string())),
        };
    }

    if let Some((key, value)) = raw.split_once("!=") {
        return Ok(Expression::NotEqual(
            validate_key(key.trim())?,
            value.trim().to_string(),
        ));
    }

    if let Some((key, value)) = raw.split_once("==").or_else(|| raw.split_once('=')) {
        return Ok(Expression::Equal(
            validate_key(key.trim())?,
            value.trim().to_string(),
        ));
    }

    Ok(Expression::Exists(validate_key(raw)?))
}

fn validate_key(key: &str) -> Result<String, SelectorError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(key.to_string())
    } else {
        Err(SelectorError::InvalidKey(key.to_string()))
    }
}

/// A parsed, non-empty label selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    expressions: Vec<Expression>,
    selector: Selector,
}

impl LabelSelector {
    pub fn expressions(&self) -> &[Expression] {
        &self.expressions
    }

    /// Selector for `ListParams::labels_from`
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Evaluate the selector against an object's labels
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        match labels {
            Some(labels) => self.selector.matches(labels),
            None => self.selector.matches(&BTreeMap::new()),
        }
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.trim().is_empty() {
            return Err(SelectorError::Empty);
        }

        // Split on commas that are not inside a value set
        let mut expressions = Vec::new();
        let mut depth = 0usize;
        let mut start = 0usize;
        for (idx, c) in raw.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| SelectorError::UnbalancedParentheses(raw.to_string()))?;
                }
                ',' if depth == 0 => {
                    expressions.push(parse_expression(&raw[start..idx])?);
                    start = idx + 1;
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err(SelectorError::UnbalancedParentheses(raw.to_string()));
        }
        expressions.push(parse_expression(&raw[start..])?);

        let selector = expressions.iter().cloned().collect::<Selector>();
        Ok(Self {
            expressions,
            selector,
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.selector.fmt(f)
    }
}
