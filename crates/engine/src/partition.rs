use chrono::{DateTime, Utc};

use aggsync_core::{Rule, RuleSet, VersionToken};

/// Cached view of one segment: the rules as last written or fetched, and the
/// token that guards the next write.
#[derive(Debug, Clone)]
pub struct PartitionState {
    pub(crate) rules: RuleSet,
    pub(crate) etag: VersionToken,
    pub(crate) synced_at: DateTime<Utc>,
}

impl PartitionState {
    pub fn new(rules: impl Into<RuleSet>, etag: VersionToken) -> Self {
        Self {
            rules: rules.into(),
            etag,
            synced_at: Utc::now(),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn etag(&self) -> &VersionToken {
        &self.etag
    }

    /// Adopt the result of a successful remote write.
    pub(crate) fn commit(&mut self, rules: RuleSet, etag: VersionToken) {
        self.rules = rules;
        self.etag = etag;
        self.synced_at = Utc::now();
    }

    pub fn snapshot(&self) -> PartitionSnapshot {
        PartitionSnapshot {
            rules: self.rules.as_slice().to_vec(),
            etag: self.etag.clone(),
            synced_at: self.synced_at,
        }
    }
}

/// Point-in-time copy of a cached partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSnapshot {
    pub rules: Vec<Rule>,
    pub etag: VersionToken,
    /// When the cache last agreed with the remote store.
    pub synced_at: DateTime<Utc>,
}
