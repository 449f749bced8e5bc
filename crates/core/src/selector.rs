//! Label selectors.
//!
//! Matches a label (or annotation) set against equality and set-based
//! requirements. Selectors can be built programmatically or parsed from the
//! usual string form: `app=web,tier!=db,env in (prod,staging),!legacy`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// Operator for label selector requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    /// Label value must be in the specified set
    In,
    /// Label value must not be in the specified set
    NotIn,
    /// Label must exist (value ignored)
    Exists,
    /// Label must not exist (value ignored)
    DoesNotExist,
}

impl Operator {
    /// Check if a label value matches this operator
    ///
    /// - `label_value`: The actual label value (None if label doesn't exist)
    /// - `values`: The values specified in the requirement
    pub fn matches(self, label_value: Option<&str>, values: &[String]) -> bool {
        match self {
            Self::In => label_value.is_some_and(|v| values.iter().any(|req| req == v)),
            Self::NotIn => {
                label_value.is_none() || !values.iter().any(|req| Some(req.as_str()) == label_value)
            }
            Self::Exists => label_value.is_some(),
            Self::DoesNotExist => label_value.is_none(),
        }
    }
}

/// A single selector requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Requirement {
    /// Check if a label set matches this requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key).map(String::as_str);
        self.operator.matches(value, &self.values)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.iter().join(",")),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.iter().join(",")),
        }
    }
}

/// Selector over a label set. Every part must match; the empty selector
/// matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector matching every label set.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Require `key` to equal `value`.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Add a set-based requirement.
    #[must_use]
    pub fn with_requirement(
        mut self,
        key: impl Into<String>,
        operator: Operator,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.match_expressions.push(Requirement {
            key: key.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Check if a label set matches this selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
            && self.match_expressions.iter().all(|req| req.matches(labels))
    }

    /// Check if this selector is empty (matches everything)
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Parse the string form of a selector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSelector`] for empty terms, bad keys or values,
    /// unknown set operators and unbalanced parentheses.
    pub fn parse(selector: &str) -> Result<Self> {
        let trimmed = selector.trim();
        if trimmed.is_empty() {
            return Ok(Self::everything());
        }

        split_terms(trimmed)
            .map_err(|reason| Error::invalid_selector(selector, reason))?
            .into_iter()
            .try_fold(Self::everything(), |acc, term| {
                parse_term(acc, term).map_err(|reason| Error::invalid_selector(selector, reason))
            })
    }
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels = self.match_labels.iter().map(|(k, v)| format!("{k}={v}"));
        let exprs = self.match_expressions.iter().map(ToString::to_string);
        write!(f, "{}", labels.chain(exprs).join(","))
    }
}

/// Split on commas that are not inside a `( ... )` value set.
fn split_terms(selector: &str) -> std::result::Result<Vec<&str>, String> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (idx, ch) in selector.char_indices() {
        match ch {
            '(' => depth = depth.saturating_add(1),
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced ')'".to_string())?;
            }
            ',' if depth == 0 => {
                terms.push(selector.get(start..idx).unwrap_or_default().trim());
                start = idx.saturating_add(1);
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unterminated value set".to_string());
    }
    terms.push(selector.get(start..).unwrap_or_default().trim());

    if terms.iter().any(|t| t.is_empty()) {
        return Err("empty requirement".to_string());
    }
    Ok(terms)
}

fn parse_term(mut acc: LabelSelector, term: &str) -> std::result::Result<LabelSelector, String> {
    if let Some(key) = term.strip_prefix('!') {
        let key = validate_key(key.trim())?;
        return Ok(acc.with_requirement(key, Operator::DoesNotExist, Vec::<String>::new()));
    }

    if let Some(open) = term.find('(') {
        let head = term.get(..open).unwrap_or_default().trim();
        let body = term
            .get(open.saturating_add(1)..)
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| format!("malformed value set in '{term}'"))?;

        let (key, op) = head
            .split_whitespace()
            .collect_tuple()
            .ok_or_else(|| format!("expected '<key> in|notin (...)' in '{term}'"))?;
        let operator = match op {
            "in" => Operator::In,
            "notin" => Operator::NotIn,
            other => return Err(format!("unknown set operator '{other}'")),
        };
        let values = body
            .split(',')
            .map(|v| validate_value(v.trim()).map(str::to_string))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if values.is_empty() || values.iter().all(String::is_empty) {
            return Err(format!("empty value set for key '{key}'"));
        }
        return Ok(acc.with_requirement(validate_key(key)?, operator, values));
    }

    if let Some((key, value)) = term.split_once("!=") {
        let value = validate_value(value.trim())?;
        return Ok(acc.with_requirement(validate_key(key.trim())?, Operator::NotIn, [value]));
    }

    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        let key = validate_key(key.trim())?.to_string();
        let value = validate_value(value.trim())?.to_string();
        // A second equality on the same key must still be AND-ed with the first.
        return Ok(match acc.match_labels.get(&key) {
            Some(existing) if *existing != value => acc.with_requirement(key, Operator::In, [value]),
            Some(_) => acc,
            None => {
                acc.match_labels.insert(key, value);
                acc
            }
        });
    }

    let key = validate_key(term)?;
    Ok(acc.with_requirement(key, Operator::Exists, Vec::<String>::new()))
}

fn validate_key(key: &str) -> std::result::Result<&str, String> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(key)
    } else {
        Err(format!("invalid key '{key}'"))
    }
}

fn validate_value(value: &str) -> std::result::Result<&str, String> {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Ok(value)
    } else {
        Err(format!("invalid value '{value}'"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_operator_in() {
        let op = Operator::In;
        assert!(op.matches(Some("prod"), &["dev".into(), "prod".into()]));
        assert!(!op.matches(Some("staging"), &["dev".into(), "prod".into()]));
        assert!(!op.matches(None, &["dev".into()]));
    }

    #[test]
    fn test_operator_not_in_matches_missing_label() {
        let op = Operator::NotIn;
        assert!(op.matches(None, &["prod".into()]));
        assert!(op.matches(Some("dev"), &["prod".into()]));
        assert!(!op.matches(Some("prod"), &["prod".into()]));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::everything();
        assert!(selector.is_empty());
        assert!(selector.matches(&BTreeMap::new()));
        assert!(selector.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn test_parse_equality_and_set_terms() {
        let selector = LabelSelector::parse("app=web, tier!=db, env in (prod, staging), !legacy, team").unwrap();

        assert_eq!(selector.match_labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(selector.match_expressions.len(), 4);

        assert!(selector.matches(&labels(&[("app", "web"), ("env", "prod"), ("team", "a")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("env", "prod")])), "team must exist");
        assert!(!selector.matches(&labels(&[("app", "web"), ("env", "dev"), ("team", "a")])));
        assert!(!selector.matches(&labels(&[
            ("app", "web"),
            ("env", "prod"),
            ("team", "a"),
            ("legacy", "true"),
        ])));
        assert!(!selector.matches(&labels(&[
            ("app", "web"),
            ("env", "prod"),
            ("team", "a"),
            ("tier", "db"),
        ])));
    }

    #[test]
    fn test_parse_double_equals() {
        let selector = LabelSelector::parse("app==web").unwrap();
        assert!(selector.matches(&labels(&[("app", "web")])));
    }

    /// Given two equality terms on the same key with different values
    /// When the selector is parsed
    /// Then both must hold, so no label set matches
    #[test]
    fn test_parse_conflicting_equalities_match_nothing() {
        let selector = LabelSelector::parse("app=web,app=db").unwrap();

        assert!(!selector.matches(&labels(&[("app", "db")])));
        assert!(!selector.matches(&labels(&[("app", "web")])));
        assert!(!selector.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_parse_repeated_equality_is_kept_once() {
        let selector = LabelSelector::parse("app=web,app==web").unwrap();

        assert!(selector.match_expressions.is_empty());
        assert!(selector.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        for bad in ["app in (a", "app in a)", "app,,tier", "app ~ (a)", "app in ()", "a b=c", "app=we b"] {
            assert!(
                matches!(LabelSelector::parse(bad), Err(Error::InvalidSelector { .. })),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn test_display_is_reparseable() {
        let selector = LabelSelector::everything()
            .with_label("app", "web")
            .with_requirement("env", Operator::In, ["prod", "staging"])
            .with_requirement("legacy", Operator::DoesNotExist, Vec::<String>::new());

        let reparsed: LabelSelector = selector.to_string().parse().unwrap();
        assert_eq!(reparsed, selector);
    }

    proptest! {
        /// Property: a selector built from exactly the object's own labels always matches it.
        #[test]
        fn prop_selector_from_own_labels_matches(
            pairs in proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,8}", 0..6)
        ) {
            let selector = pairs
                .iter()
                .fold(LabelSelector::everything(), |s, (k, v)| s.with_label(k.clone(), v.clone()));
            prop_assert!(selector.matches(&pairs));
        }

        /// Property: adding a requirement never widens the set of matching label sets.
        #[test]
        fn prop_adding_requirement_narrows(
            pairs in proptest::collection::btree_map("[a-c]{1}", "[x-z]{1}", 0..4),
            key in "[a-c]{1}",
        ) {
            let base = LabelSelector::everything();
            let narrowed = base.clone().with_requirement(key, Operator::Exists, Vec::<String>::new());
            prop_assert!(!narrowed.matches(&pairs) || base.matches(&pairs));
        }
    }
}
