use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::rule::Rule;

/// Opaque precondition token (`ETag`) for conditional writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionToken {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for VersionToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Ordered rules of one segment. Order is what the server sees on the next
/// full-list write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet(Vec<Rule>);

impl RuleSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Rule] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Rule> {
        self.0
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(Rule::key)
    }

    pub fn position(&self, metric: &str) -> Option<usize> {
        self.0.iter().position(|r| r.metric == metric)
    }

    pub fn get(&self, metric: &str) -> Option<&Rule> {
        self.0.iter().find(|r| r.metric == metric)
    }

    pub fn contains(&self, metric: &str) -> bool {
        self.position(metric).is_some()
    }

    /// Append `rule` at the end. Fails if its metric is already present.
    pub fn push(&mut self, rule: Rule) -> Result<(), CoreError> {
        if self.contains(&rule.metric) {
            return Err(CoreError::DuplicateMetric(rule.metric));
        }
        self.0.push(rule);
        Ok(())
    }

    /// Replace the rule with the same metric in place. Returns the previous
    /// value, or `None` (leaving the set untouched) if there was none.
    pub fn replace(&mut self, rule: Rule) -> Option<Rule> {
        let idx = self.position(&rule.metric)?;
        Some(std::mem::replace(&mut self.0[idx], rule))
    }

    /// Remove the rule for `metric`, shifting later rules forward.
    pub fn remove(&mut self, metric: &str) -> Option<Rule> {
        let idx = self.position(metric)?;
        Some(self.0.remove(idx))
    }

    /// Fails with the first metric that appears more than once.
    pub fn check_unique(&self) -> Result<(), CoreError> {
        check_unique(&self.0)
    }
}

/// Reject slices that name the same metric twice.
pub fn check_unique(rules: &[Rule]) -> Result<(), CoreError> {
    let mut seen = HashSet::with_capacity(rules.len());
    for rule in rules {
        if !seen.insert(rule.key()) {
            return Err(CoreError::DuplicateMetric(rule.metric.clone()));
        }
    }
    Ok(())
}

impl From<Vec<Rule>> for RuleSet {
    fn from(rules: Vec<Rule>) -> Self {
        Self(rules)
    }
}

impl FromIterator<Rule> for RuleSet {
    fn from_iter<I: IntoIterator<Item = Rule>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for RuleSet {
    type Item = Rule;
    type IntoIter = std::vec::IntoIter<Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
