use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// Provenance tag stamped on rules written by this library.
pub const MANAGED_BY: &str = "aggsync";

/// How a rule's `metric` is matched against incoming metric names.
///
/// Exact rules match a single name, so their position in a rule set never
/// changes which rule wins. Prefix and suffix rules can overlap; the first
/// one in rule-set order takes precedence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatchType {
    #[default]
    Exact,
    Prefix,
    Suffix,
}

impl MatchType {
    pub fn is_exact(&self) -> bool {
        matches!(self, MatchType::Exact)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Prefix => "prefix",
            MatchType::Suffix => "suffix",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = CoreError;

    /// An empty string is the server's spelling of `exact`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "exact" => Ok(MatchType::Exact),
            "prefix" => Ok(MatchType::Prefix),
            "suffix" => Ok(MatchType::Suffix),
            other => Err(CoreError::InvalidMatchType(other.to_string())),
        }
    }
}

impl Serialize for MatchType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MatchType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            None => Ok(MatchType::Exact),
            Some(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A single metric-aggregation rule, keyed by `metric`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub metric: String,

    #[serde(default, skip_serializing_if = "MatchType::is_exact")]
    pub match_type: MatchType,

    #[serde(default, skip_serializing_if = "is_false")]
    pub drop: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keep_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop_labels: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aggregation_interval: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aggregation_delay: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub managed_by: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub ingest: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Rule {
    /// An exact-match rule for `metric` with every other field empty.
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            ..Self::default()
        }
    }

    pub fn with_match_type(mut self, match_type: MatchType) -> Self {
        self.match_type = match_type;
        self
    }

    pub fn with_aggregations<I, S>(mut self, aggregations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregations = aggregations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_drop_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.drop_labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keep_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keep_labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Stamp the provenance tag so the server can tell who owns the rule.
    pub fn managed(mut self) -> Self {
        self.managed_by = MANAGED_BY.to_string();
        self
    }

    /// Identity of the rule within a rule set.
    pub fn key(&self) -> &str {
        &self.metric
    }

    pub fn is_exact_match(&self) -> bool {
        self.match_type.is_exact()
    }
}
