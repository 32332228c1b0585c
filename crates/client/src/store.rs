use async_trait::async_trait;

use aggsync_core::{Rule, Segment, SegmentId, SegmentedRuleSet, VersionToken};

use crate::error::StoreError;

/// Authoritative remote home of the rule sets.
///
/// Every write takes the version token the caller last observed and must be
/// rejected with [`StoreError::Conflict`] when it is stale. Every successful
/// read or write hands back the current token. [`StoreError::NotFound`] is
/// kept distinct from other failures so callers can decide between create
/// and update.
///
/// Retrying transient failures is the implementation's job; callers treat
/// each method as a single, possibly slow, possibly failing call.
#[async_trait]
pub trait RemoteRuleStore: Send + Sync {
    /// Every segment's rules and token in one call.
    async fn fetch_segmented(&self) -> Result<Vec<SegmentedRuleSet>, StoreError>;

    /// Ordered rules of `segment` and the token guarding them.
    async fn fetch_all(&self, segment: &SegmentId) -> Result<(Vec<Rule>, VersionToken), StoreError>;

    /// Replace the whole ordered list of `segment` if `token` is current.
    async fn replace_all(
        &self,
        segment: &SegmentId,
        rules: &[Rule],
        token: &VersionToken,
    ) -> Result<VersionToken, StoreError>;

    async fn create_one(
        &self,
        segment: &SegmentId,
        rule: &Rule,
        token: &VersionToken,
    ) -> Result<VersionToken, StoreError>;

    async fn read_one(&self, segment: &SegmentId, metric: &str) -> Result<(Rule, VersionToken), StoreError>;

    async fn update_one(
        &self,
        segment: &SegmentId,
        rule: &Rule,
        token: &VersionToken,
    ) -> Result<VersionToken, StoreError>;

    async fn delete_one(
        &self,
        segment: &SegmentId,
        metric: &str,
        token: &VersionToken,
    ) -> Result<VersionToken, StoreError>;

    async fn list_segments(&self) -> Result<Vec<Segment>, StoreError>;

    /// Register a segment and return it as stored, with its assigned id.
    async fn create_segment(&self, segment: &Segment) -> Result<Segment, StoreError>;

    /// Overwrite name, selector and flags of the segment with `segment.id`.
    async fn update_segment(&self, segment: &Segment) -> Result<(), StoreError>;

    /// Remove a segment together with its rules.
    async fn delete_segment(&self, segment: &SegmentId) -> Result<(), StoreError>;
}
