//! [`AggregationRules`]: cached rule sets per segment, written back to the
//! remote store with optimistic concurrency.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use aggsync_client::RemoteRuleStore;
use aggsync_core::{align_upstream_with_state, check_unique, Rule, RuleSet, Segment, SegmentId, VersionToken};

use crate::error::{Result, SyncError};
use crate::partition::{PartitionSnapshot, PartitionState};
use crate::registry::PartitionRegistry;

/// What [`AggregationRules::upsert`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    /// A rule with the same metric already existed and was overwritten.
    Updated,
}

/// Reconciliation engine over a [`RemoteRuleStore`].
///
/// Each segment is cached as an ordered [`RuleSet`] plus the version token
/// of the last successful read or write. Mutations take the segment's
/// exclusive lock, stage the change on a copy, and send the whole list to
/// the store guarded by the cached token. The cache is only updated when the
/// store accepts the write, so a rejected write leaves it exactly as it was.
///
/// Conflicts are reported, never retried. Callers that want to retry should
/// [`refresh`](Self::refresh) the segment first.
pub struct AggregationRules {
    store: Arc<dyn RemoteRuleStore>,
    partitions: PartitionRegistry,
    /// Segment create/update/delete run one at a time.
    segment_writes: Mutex<()>,
}

impl AggregationRules {
    /// Engine with an empty cache. Call [`init`](Self::init) before serving
    /// reads.
    pub fn new(store: Arc<dyn RemoteRuleStore>) -> Self {
        Self {
            store,
            partitions: PartitionRegistry::new(),
            segment_writes: Mutex::new(()),
        }
    }

    /// Create the engine and load every segment.
    pub async fn connect(store: Arc<dyn RemoteRuleStore>) -> Result<Self> {
        let engine = Self::new(store);
        engine.init().await?;
        Ok(engine)
    }

    pub fn store(&self) -> &Arc<dyn RemoteRuleStore> {
        &self.store
    }

    /// Load all segments from the bulk listing. Servers without that
    /// endpoint answer 404, in which case only the default segment is loaded.
    ///
    /// Every listed set is validated before any is installed, so a bad set
    /// leaves the cache untouched. Cached segments missing from the listing
    /// are dropped.
    pub async fn init(&self) -> Result<()> {
        let default = SegmentId::default();
        match self.store.fetch_segmented().await {
            Ok(sets) => {
                let mut staged = Vec::with_capacity(sets.len());
                for set in sets {
                    let segment = set.segment.segment_id();
                    check_unique(&set.rules).map_err(|e| SyncError::invariant(&segment, e))?;
                    staged.push((segment, PartitionState::new(set.rules, VersionToken::new(set.etag))));
                }

                let listed: HashSet<SegmentId> = staged.iter().map(|(segment, _)| segment.clone()).collect();
                for segment in self.partitions.retain(|id| listed.contains(id)) {
                    info!(segment = %segment, "segment no longer listed, dropped from cache");
                }

                let count = staged.len();
                for (segment, state) in staged {
                    self.install(&segment, state).await;
                }
                info!(segments = count, "loaded segmented rule sets");
            }
            Err(e) if e.is_not_found() => {
                debug!(error = %e, "segmented listing unavailable, loading default segment");
                let state = self.load(&default).await?;
                info!(rules = state.rules.len(), etag = %state.etag, "loaded default rule set");
                self.install(&default, state).await;
            }
            Err(e) => return Err(SyncError::store(&default, e)),
        }
        Ok(())
    }

    /// Append `rule` to the end of the segment. Fails with `AlreadyExists`
    /// if the metric is already cached.
    pub async fn create(&self, segment: &SegmentId, rule: Rule) -> Result<Rule> {
        self.write(segment, "create", |rules| {
            if rules.contains(&rule.metric) {
                return Err(SyncError::already_exists(segment, &rule.metric));
            }
            rules
                .push(rule.clone())
                .map_err(|e| SyncError::invariant(segment, e))?;
            Ok(rule)
        })
        .await
    }

    /// Cached rule for `metric`. Never contacts the store.
    pub async fn read(&self, segment: &SegmentId, metric: &str) -> Result<Rule> {
        let slot = self
            .partitions
            .get(segment)
            .ok_or_else(|| SyncError::not_found(segment, metric))?;
        let guard = slot.read().await;
        guard
            .as_ref()
            .and_then(|state| state.rules.get(metric))
            .cloned()
            .ok_or_else(|| SyncError::not_found(segment, metric))
    }

    /// Replace the cached rule with the same metric, keeping its position.
    pub async fn update(&self, segment: &SegmentId, rule: Rule) -> Result<Rule> {
        self.write(segment, "update", |rules| {
            rules
                .replace(rule.clone())
                .ok_or_else(|| SyncError::not_found(segment, &rule.metric))?;
            Ok(rule)
        })
        .await
    }

    /// Remove the rule for `metric`; later rules move up one place.
    pub async fn delete(&self, segment: &SegmentId, metric: &str) -> Result<Rule> {
        self.write(segment, "delete", |rules| {
            rules
                .remove(metric)
                .ok_or_else(|| SyncError::not_found(segment, metric))
        })
        .await
    }

    /// Update the rule if its metric is cached, create it otherwise.
    pub async fn upsert(&self, segment: &SegmentId, rule: Rule) -> Result<UpsertOutcome> {
        let metric = rule.metric.clone();
        let outcome = self
            .write(segment, "upsert", |rules| {
                if rules.replace(rule.clone()).is_some() {
                    return Ok(UpsertOutcome::Updated);
                }
                rules.push(rule).map_err(|e| SyncError::invariant(segment, e))?;
                Ok(UpsertOutcome::Created)
            })
            .await?;
        if outcome == UpsertOutcome::Updated {
            warn!(segment = %segment, metric = %metric, "rule already existed and was adopted");
        }
        Ok(outcome)
    }

    /// Overwrite the whole segment with `rules`, in order. An empty list
    /// clears the segment.
    pub async fn replace_all(&self, segment: &SegmentId, rules: Vec<Rule>) -> Result<()> {
        check_unique(&rules).map_err(|e| SyncError::invariant(segment, e))?;
        self.write(segment, "replace_all", |staged| {
            *staged = RuleSet::from(rules);
            Ok(())
        })
        .await
    }

    /// Fetch the segment and order it after the cached rules, so an
    /// unchanged set reads back in the order it was written. The aligned
    /// list becomes the new cache.
    pub async fn read_all(&self, segment: &SegmentId) -> Result<Vec<Rule>> {
        self.reconcile(segment, None).await
    }

    /// Like [`read_all`](Self::read_all), but aligned against a caller's
    /// previously known ordering instead of the cache.
    pub async fn read_all_against(&self, segment: &SegmentId, state: &[Rule]) -> Result<Vec<Rule>> {
        self.reconcile(segment, Some(state)).await
    }

    /// Drop whatever is cached for the segment in favour of the store's
    /// current view. On failure the previous cache is kept.
    pub async fn refresh(&self, segment: &SegmentId) -> Result<PartitionSnapshot> {
        let slot = self.partitions.slot(segment);
        let mut guard = slot.write().await;
        let state = self.load(segment).await?;
        let snapshot = state.snapshot();
        *guard = Some(state);
        info!(segment = %segment, rules = snapshot.rules.len(), etag = %snapshot.etag, "refreshed rule set");
        Ok(snapshot)
    }

    pub async fn snapshot(&self, segment: &SegmentId) -> Option<PartitionSnapshot> {
        let slot = self.partitions.get(segment)?;
        let guard = slot.read().await;
        guard.as_ref().map(PartitionState::snapshot)
    }

    /// Segments currently held in the cache, sorted.
    pub async fn segments(&self) -> Vec<SegmentId> {
        let mut loaded = Vec::new();
        for (segment, slot) in self.partitions.entries() {
            if slot.read().await.is_some() {
                loaded.push(segment);
            }
        }
        loaded
    }

    /// Read a single rule straight from the store. The cache is not touched.
    pub async fn fetch_rule(&self, segment: &SegmentId, metric: &str) -> Result<Rule> {
        match self.store.read_one(segment, metric).await {
            Ok((rule, _)) => Ok(rule),
            Err(e) if e.is_not_found() => Err(SyncError::not_found(segment, metric)),
            Err(e) => Err(SyncError::store(segment, e)),
        }
    }

    /// Every segment the store knows about, loaded or not.
    pub async fn list_segments(&self) -> Result<Vec<Segment>> {
        self.store
            .list_segments()
            .await
            .map_err(|e| SyncError::store(&SegmentId::default(), e))
    }

    pub async fn read_segment(&self, segment: &SegmentId) -> Result<Segment> {
        self.list_segments()
            .await?
            .into_iter()
            .find(|s| &s.segment_id() == segment)
            .ok_or_else(|| SyncError::segment_not_found(segment))
    }

    /// Register a new segment. Its rule set starts empty and is fetched on
    /// first use.
    pub async fn create_segment(&self, segment: Segment) -> Result<Segment> {
        let _serial = self.segment_writes.lock().await;
        let requested = segment.segment_id();
        let created = self
            .store
            .create_segment(&segment)
            .await
            .map_err(|e| SyncError::store(&requested, e))?;
        info!(segment = %created.segment_id(), selector = %created.selector, "segment created");
        Ok(created)
    }

    /// Change a segment's name, selector or flags. Its cached rules are kept.
    pub async fn update_segment(&self, segment: Segment) -> Result<Segment> {
        let _serial = self.segment_writes.lock().await;
        let id = segment.segment_id();
        match self.store.update_segment(&segment).await {
            Ok(()) => {
                info!(segment = %id, "segment updated");
                Ok(segment)
            }
            Err(e) if e.is_not_found() => Err(SyncError::segment_not_found(&id)),
            Err(e) => Err(SyncError::store(&id, e)),
        }
    }

    /// Delete a segment with its rules and drop it from the cache. Writes
    /// already queued on the segment finish before the delete is sent.
    pub async fn delete_segment(&self, segment: &SegmentId) -> Result<()> {
        let _serial = self.segment_writes.lock().await;
        let slot = self.partitions.slot(segment);
        let mut guard = slot.write().await;
        match self.store.delete_segment(segment).await {
            Ok(()) => {
                *guard = None;
                self.partitions.remove(segment);
                info!(segment = %segment, "segment deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                *guard = None;
                self.partitions.remove(segment);
                Err(SyncError::segment_not_found(segment))
            }
            Err(e) => Err(SyncError::store(segment, e)),
        }
    }

    async fn install(&self, segment: &SegmentId, state: PartitionState) {
        *self.partitions.slot(segment).write().await = Some(state);
    }

    async fn load(&self, segment: &SegmentId) -> Result<PartitionState> {
        let (rules, etag) = self
            .store
            .fetch_all(segment)
            .await
            .map_err(|e| SyncError::store(segment, e))?;
        check_unique(&rules).map_err(|e| SyncError::invariant(segment, e))?;
        debug!(segment = %segment, rules = rules.len(), etag = %etag, "fetched rule set");
        Ok(PartitionState::new(rules, etag))
    }

    /// Cached state of `segment`, fetched first if the slot is empty.
    async fn ensure_loaded<'a>(
        &self,
        segment: &SegmentId,
        slot: &'a mut Option<PartitionState>,
    ) -> Result<&'a mut PartitionState> {
        let state = match slot.take() {
            Some(state) => state,
            None => self.load(segment).await?,
        };
        Ok(slot.insert(state))
    }

    /// Run `apply` on a copy of the segment's rules, then write the copy
    /// back with the cached token. The cache only changes if the store
    /// accepts the write.
    async fn write<T, F>(&self, segment: &SegmentId, op: &'static str, apply: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut RuleSet) -> Result<T> + Send,
    {
        let slot = self.partitions.slot(segment);
        let mut guard = slot.write().await;
        let state = self.ensure_loaded(segment, &mut *guard).await?;

        let mut staged = state.rules.clone();
        let out = apply(&mut staged)?;

        match self.store.replace_all(segment, staged.as_slice(), &state.etag).await {
            Ok(etag) => {
                info!(segment = %segment, op, rules = staged.len(), etag = %etag, "rule set written");
                state.commit(staged, etag);
                Ok(out)
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(segment = %segment, op, etag = %state.etag, error = %e, "stale version token");
                } else {
                    warn!(segment = %segment, op, error = %e, "rule set write failed");
                }
                Err(SyncError::store(segment, e))
            }
        }
    }

    async fn reconcile(&self, segment: &SegmentId, against: Option<&[Rule]>) -> Result<Vec<Rule>> {
        let slot = self.partitions.slot(segment);
        let mut guard = slot.write().await;
        let fresh = self.load(segment).await?;

        let prior = against.or_else(|| guard.as_ref().map(|state| state.rules.as_slice()));
        let aligned = match prior {
            Some(prior) => align_upstream_with_state(prior, fresh.rules.as_slice()),
            None => fresh.rules.as_slice().to_vec(),
        };

        debug!(segment = %segment, rules = aligned.len(), etag = %fresh.etag, "aligned rule set");
        *guard = Some(PartitionState::new(aligned.clone(), fresh.etag));
        Ok(aligned)
    }
}
