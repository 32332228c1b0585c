use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use aggsync_core::{Rule, Segment, SegmentId, SegmentedRuleSet, VersionToken};

use crate::error::StoreError;
use crate::store::RemoteRuleStore;

#[derive(Debug, Clone)]
struct Partition {
    segment: Segment,
    rules: Vec<Rule>,
    etag: VersionToken,
}

#[derive(Debug)]
struct Inner {
    partitions: BTreeMap<SegmentId, Partition>,
    version: u64,
    segment_seq: u64,
    writes: usize,
    pending_failure: Option<StoreError>,
}

impl Inner {
    fn next_token(&mut self) -> VersionToken {
        self.version += 1;
        VersionToken::new(format!("v{}", self.version))
    }

    fn partition(&self, segment: &SegmentId) -> Result<&Partition, StoreError> {
        self.partitions.get(segment).ok_or_else(|| StoreError::NotFound {
            body: format!("segment {segment} not found"),
        })
    }

    /// Resolve `segment` for a write guarded by `token`.
    fn guarded(&mut self, segment: &SegmentId, token: &VersionToken) -> Result<&mut Partition, StoreError> {
        let partition = self.partitions.get_mut(segment).ok_or_else(|| StoreError::NotFound {
            body: format!("segment {segment} not found"),
        })?;
        if &partition.etag != token {
            return Err(StoreError::Conflict {
                status: 412,
                body: format!("etag mismatch: current {}, given {}", partition.etag, token),
            });
        }
        Ok(partition)
    }

    /// Stamp a successful write on `segment` and return its new token.
    fn commit(&mut self, segment: &SegmentId) -> VersionToken {
        let token = self.next_token();
        self.writes += 1;
        if let Some(partition) = self.partitions.get_mut(segment) {
            partition.etag = token.clone();
        }
        token
    }
}

/// Authoritative in-process [`RemoteRuleStore`].
///
/// Holds one ordered rule list and etag per segment and enforces the same
/// optimistic-concurrency contract as the HTTP API: every successful write
/// mints a fresh token and a write carrying any other token is rejected with
/// [`StoreError::Conflict`]. Single-rule operations share the partition etag.
///
/// The default segment always exists. Other segments must be added with
/// [`add_segment`](Self::add_segment) or [`seed`](Self::seed).
#[derive(Debug)]
pub struct InMemoryRuleStore {
    inner: Mutex<Inner>,
    segmented_listing: bool,
    latency: Option<Duration>,
}

impl Default for InMemoryRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        let mut inner = Inner {
            partitions: BTreeMap::new(),
            version: 0,
            segment_seq: 0,
            writes: 0,
            pending_failure: None,
        };
        let etag = inner.next_token();
        inner.partitions.insert(
            SegmentId::default(),
            Partition {
                segment: Segment::default(),
                rules: Vec::new(),
                etag,
            },
        );
        Self {
            inner: Mutex::new(inner),
            segmented_listing: true,
            latency: None,
        }
    }

    /// Answer the bulk segmented listing with 404, like servers that predate it.
    pub fn without_segmented_listing(mut self) -> Self {
        self.segmented_listing = false;
        self
    }

    /// Sleep before serving every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a segment with no rules. Existing segments are left alone.
    pub fn add_segment(&self, segment: Segment) -> VersionToken {
        let mut inner = self.lock();
        let id = segment.segment_id();
        if let Some(existing) = inner.partitions.get(&id) {
            return existing.etag.clone();
        }
        let etag = inner.next_token();
        inner.partitions.insert(
            id,
            Partition {
                segment,
                rules: Vec::new(),
                etag: etag.clone(),
            },
        );
        etag
    }

    /// Set the rules of `segment`, creating it if needed, without counting
    /// a write.
    pub fn seed(&self, segment: &SegmentId, rules: Vec<Rule>) -> VersionToken {
        let mut inner = self.lock();
        let etag = inner.next_token();
        let partition = inner.partitions.entry(segment.clone()).or_insert_with(|| Partition {
            segment: Segment {
                id: segment.as_str().to_string(),
                name: segment.as_str().to_string(),
                ..Segment::default()
            },
            rules: Vec::new(),
            etag: etag.clone(),
        });
        partition.rules = rules;
        partition.etag = etag.clone();
        etag
    }

    /// Overwrite `segment` as another client would, invalidating every token
    /// handed out so far for it.
    pub fn external_replace(&self, segment: &SegmentId, rules: Vec<Rule>) -> VersionToken {
        debug!(segment = %segment, rules = rules.len(), "external replace");
        self.seed(segment, rules)
    }

    pub fn rules(&self, segment: &SegmentId) -> Option<Vec<Rule>> {
        self.lock().partitions.get(segment).map(|p| p.rules.clone())
    }

    pub fn etag(&self, segment: &SegmentId) -> Option<VersionToken> {
        self.lock().partitions.get(segment).map(|p| p.etag.clone())
    }

    /// Successful writes received through [`RemoteRuleStore`].
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Fail the next call, whichever it is, with `error`.
    pub fn fail_next(&self, error: StoreError) {
        self.lock().pending_failure = Some(error);
    }

    /// Apply latency, then hand back the lock unless a failure is pending.
    async fn enter(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut inner = self.lock();
        match inner.pending_failure.take() {
            Some(err) => Err(err),
            None => Ok(inner),
        }
    }
}

fn segment_not_found(segment: &SegmentId) -> StoreError {
    StoreError::NotFound {
        body: format!("segment {segment} not found"),
    }
}

fn rule_not_found(metric: &str) -> StoreError {
    StoreError::NotFound {
        body: format!("rule {metric} not found"),
    }
}

#[async_trait]
impl RemoteRuleStore for InMemoryRuleStore {
    async fn fetch_segmented(&self) -> Result<Vec<SegmentedRuleSet>, StoreError> {
        let inner = self.enter().await?;
        if !self.segmented_listing {
            return Err(StoreError::NotFound {
                body: "404 page not found".into(),
            });
        }
        Ok(inner
            .partitions
            .values()
            .map(|p| SegmentedRuleSet {
                etag: p.etag.as_str().to_string(),
                segment: p.segment.clone(),
                rules: p.rules.clone(),
            })
            .collect())
    }

    async fn fetch_all(&self, segment: &SegmentId) -> Result<(Vec<Rule>, VersionToken), StoreError> {
        let inner = self.enter().await?;
        let partition = inner.partition(segment)?;
        Ok((partition.rules.clone(), partition.etag.clone()))
    }

    async fn replace_all(
        &self,
        segment: &SegmentId,
        rules: &[Rule],
        token: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let mut inner = self.enter().await?;
        inner.guarded(segment, token)?.rules = rules.to_vec();
        Ok(inner.commit(segment))
    }

    async fn create_one(
        &self,
        segment: &SegmentId,
        rule: &Rule,
        token: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let mut inner = self.enter().await?;
        let partition = inner.guarded(segment, token)?;
        if partition.rules.iter().any(|r| r.key() == rule.key()) {
            return Err(StoreError::Conflict {
                status: 409,
                body: format!("rule {} already exists", rule.metric),
            });
        }
        partition.rules.push(rule.clone());
        Ok(inner.commit(segment))
    }

    async fn read_one(&self, segment: &SegmentId, metric: &str) -> Result<(Rule, VersionToken), StoreError> {
        let inner = self.enter().await?;
        let partition = inner.partition(segment)?;
        let rule = partition
            .rules
            .iter()
            .find(|r| r.key() == metric)
            .cloned()
            .ok_or_else(|| rule_not_found(metric))?;
        Ok((rule, partition.etag.clone()))
    }

    async fn update_one(
        &self,
        segment: &SegmentId,
        rule: &Rule,
        token: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let mut inner = self.enter().await?;
        let partition = inner.guarded(segment, token)?;
        let slot = partition
            .rules
            .iter_mut()
            .find(|r| r.key() == rule.key())
            .ok_or_else(|| rule_not_found(&rule.metric))?;
        *slot = rule.clone();
        Ok(inner.commit(segment))
    }

    async fn delete_one(
        &self,
        segment: &SegmentId,
        metric: &str,
        token: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let mut inner = self.enter().await?;
        let partition = inner.guarded(segment, token)?;
        let idx = partition
            .rules
            .iter()
            .position(|r| r.key() == metric)
            .ok_or_else(|| rule_not_found(metric))?;
        partition.rules.remove(idx);
        Ok(inner.commit(segment))
    }

    async fn list_segments(&self) -> Result<Vec<Segment>, StoreError> {
        let inner = self.enter().await?;
        Ok(inner.partitions.values().map(|p| p.segment.clone()).collect())
    }

    /// Ids are assigned as `seg-{n}` when the caller leaves them empty.
    async fn create_segment(&self, segment: &Segment) -> Result<Segment, StoreError> {
        let mut inner = self.enter().await?;
        if inner.partitions.values().any(|p| p.segment.selector == segment.selector) {
            return Err(StoreError::Conflict {
                status: 409,
                body: format!("segment with selector {} already exists", segment.selector),
            });
        }
        let mut created = segment.clone();
        if created.id.is_empty() {
            inner.segment_seq += 1;
            created.id = format!("seg-{}", inner.segment_seq);
        }
        let id = created.segment_id();
        if inner.partitions.contains_key(&id) {
            return Err(StoreError::Conflict {
                status: 409,
                body: format!("segment {id} already exists"),
            });
        }
        let etag = inner.next_token();
        inner.partitions.insert(
            id,
            Partition {
                segment: created.clone(),
                rules: Vec::new(),
                etag,
            },
        );
        inner.writes += 1;
        Ok(created)
    }

    async fn update_segment(&self, segment: &Segment) -> Result<(), StoreError> {
        let mut inner = self.enter().await?;
        let id = segment.segment_id();
        let partition = inner
            .partitions
            .get_mut(&id)
            .filter(|_| !id.is_default())
            .ok_or_else(|| segment_not_found(&id))?;
        partition.segment = segment.clone();
        inner.writes += 1;
        Ok(())
    }

    async fn delete_segment(&self, segment: &SegmentId) -> Result<(), StoreError> {
        let mut inner = self.enter().await?;
        if segment.is_default() {
            return Err(StoreError::Api {
                status: 400,
                body: "the default segment cannot be deleted".into(),
            });
        }
        inner
            .partitions
            .remove(segment)
            .ok_or_else(|| segment_not_found(segment))?;
        inner.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(metric: &str) -> Rule {
        Rule::new(metric)
    }

    #[tokio::test]
    async fn default_segment_exists_and_is_empty() {
        let store = InMemoryRuleStore::new();
        let (rules, etag) = store.fetch_all(&SegmentId::default()).await.unwrap();
        assert!(rules.is_empty());
        assert_eq!(etag.as_str(), "v1");
    }

    #[tokio::test]
    async fn writes_mint_fresh_tokens() {
        let store = InMemoryRuleStore::new();
        let seg = SegmentId::default();
        let (_, v1) = store.fetch_all(&seg).await.unwrap();

        let v2 = store.replace_all(&seg, &[rule("a")], &v1).await.unwrap();
        assert_ne!(v1, v2);
        let v3 = store.create_one(&seg, &rule("b"), &v2).await.unwrap();
        assert_ne!(v2, v3);

        assert_eq!(store.rules(&seg).unwrap(), vec![rule("a"), rule("b")]);
        assert_eq!(store.etag(&seg), Some(v3));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn stale_token_is_a_conflict() {
        let store = InMemoryRuleStore::new();
        let seg = SegmentId::default();
        let (_, v1) = store.fetch_all(&seg).await.unwrap();
        store.external_replace(&seg, vec![rule("theirs")]);

        let err = store.replace_all(&seg, &[rule("mine")], &v1).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.rules(&seg).unwrap(), vec![rule("theirs")]);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn single_rule_operations() {
        let store = InMemoryRuleStore::new();
        let seg = SegmentId::default();
        let v1 = store.seed(&seg, vec![rule("a"), rule("b"), rule("c")]);

        let (found, etag) = store.read_one(&seg, "b").await.unwrap();
        assert_eq!(found, rule("b"));
        assert_eq!(etag, v1);
        assert!(store.read_one(&seg, "zz").await.unwrap_err().is_not_found());

        let updated = rule("b").with_aggregations(["sum"]);
        let v2 = store.update_one(&seg, &updated, &v1).await.unwrap();
        let v3 = store.delete_one(&seg, "a", &v2).await.unwrap();

        assert_eq!(store.rules(&seg).unwrap(), vec![updated, rule("c")]);
        assert!(store.delete_one(&seg, "a", &v3).await.unwrap_err().is_not_found());
        assert!(store.create_one(&seg, &rule("c"), &v3).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn unknown_segment_is_not_found() {
        let store = InMemoryRuleStore::new();
        let err = store.fetch_all(&SegmentId::from("nope")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn segmented_listing_covers_every_segment() {
        let store = InMemoryRuleStore::new();
        store.add_segment(Segment {
            id: "team-a".into(),
            name: "Team A".into(),
            ..Segment::default()
        });
        store.seed(&SegmentId::from("team-a"), vec![rule("x")]);

        let sets = store.fetch_segmented().await.unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[1].segment.name, "Team A");
        assert_eq!(sets[1].rules, vec![rule("x")]);
        assert_eq!(store.list_segments().await.unwrap().len(), 2);

        let legacy = InMemoryRuleStore::new().without_segmented_listing();
        assert!(legacy.fetch_segmented().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn segment_lifecycle() {
        let store = InMemoryRuleStore::new();
        let created = store
            .create_segment(&Segment {
                name: "Team A".into(),
                selector: "{team=\"a\"}".into(),
                ..Segment::default()
            })
            .await
            .unwrap();
        assert_eq!(created.id, "seg-1");
        let id = created.segment_id();
        assert_eq!(store.rules(&id), Some(Vec::new()));

        let duplicate = store.create_segment(&created).await.unwrap_err();
        assert!(duplicate.is_conflict());

        let renamed = Segment {
            name: "Team A (prod)".into(),
            fallback_to_default: true,
            ..created.clone()
        };
        store.update_segment(&renamed).await.unwrap();
        let listed = store.list_segments().await.unwrap();
        assert!(listed.contains(&renamed));

        store.delete_segment(&id).await.unwrap();
        assert!(store.rules(&id).is_none());
        assert!(store.delete_segment(&id).await.unwrap_err().is_not_found());
        assert!(store.update_segment(&renamed).await.unwrap_err().is_not_found());
        assert!(matches!(
            store.delete_segment(&SegmentId::default()).await,
            Err(StoreError::Api { status: 400, .. })
        ));
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn injected_failure_hits_only_the_next_call() {
        let store = InMemoryRuleStore::new();
        store.fail_next(StoreError::Injected("connection reset".into()));

        let err = store.fetch_all(&SegmentId::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::Injected(_)));
        assert!(store.fetch_all(&SegmentId::default()).await.is_ok());
    }
}
