use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::rule::Rule;

/// Partition identifier. The empty id is the implicit default segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(String);

impl SegmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for the `segment` query parameter; the default segment sends none.
    pub fn as_query(&self) -> Option<&str> {
        if self.is_default() {
            None
        } else {
            Some(&self.0)
        }
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            f.write_str("(default)")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for SegmentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SegmentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<Option<&str>> for SegmentId {
    fn from(s: Option<&str>) -> Self {
        s.map(SegmentId::new).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoApplyConfig {
    pub enabled: bool,
}

/// A segment as described by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub fallback_to_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_apply: Option<AutoApplyConfig>,
}

impl Segment {
    pub fn segment_id(&self) -> SegmentId {
        SegmentId::new(self.id.clone())
    }
}

/// One partition's rules and etag, as returned by the bulk segmented listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentedRuleSet {
    pub etag: String,
    #[serde(default)]
    pub segment: Segment,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub rules: Vec<Rule>,
}

/// The server encodes an empty rule list as `null`.
fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Rule>, D::Error> {
    Ok(Option::<Vec<Rule>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_segment_has_no_query() {
        let id = SegmentId::default();
        assert!(id.is_default());
        assert_eq!(id.as_query(), None);
        assert_eq!(id.to_string(), "(default)");

        let id = SegmentId::from("team-a");
        assert_eq!(id.as_query(), Some("team-a"));
        assert_eq!(SegmentId::from(None), SegmentId::default());
    }

    #[test]
    fn segmented_rule_set_decodes() {
        let sets: Vec<SegmentedRuleSet> = serde_json::from_value(json!([
            {"etag": "e1", "segment": {"id": "", "name": "default"}, "rules": [{"metric": "up"}]},
            {"etag": "e2", "segment": {"id": "s1", "name": "team", "selector": "{team=\"a\"}",
                "fallback_to_default": true, "auto_apply": {"enabled": true}}, "rules": []},
        ]))
        .unwrap();

        assert_eq!(sets.len(), 2);
        assert!(sets[0].segment.segment_id().is_default());
        assert_eq!(sets[0].rules[0].metric, "up");
        assert_eq!(sets[1].segment.segment_id(), SegmentId::from("s1"));
        assert_eq!(sets[1].segment.auto_apply, Some(AutoApplyConfig { enabled: true }));
    }

    #[test]
    fn null_rules_decode_as_empty() {
        let sets: Vec<SegmentedRuleSet> = serde_json::from_value(json!([
            {"etag": "e1", "segment": {"id": "s1"}, "rules": null},
            {"etag": "e2", "segment": {"id": "s2"}},
        ]))
        .unwrap();

        assert!(sets[0].rules.is_empty());
        assert!(sets[1].rules.is_empty());
    }
}
