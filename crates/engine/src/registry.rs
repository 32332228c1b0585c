//! Map from segment id to its guarded cache slot.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use aggsync_core::SegmentId;

use crate::partition::PartitionState;

/// One segment's slot. `None` until the segment has been loaded.
pub type PartitionSlot = Arc<tokio::sync::RwLock<Option<PartitionState>>>;

/// Slots are created on first use and dropped when their segment goes away.
/// The outer lock only guards the map itself and is never held across an
/// `.await`.
#[derive(Debug, Default)]
pub struct PartitionRegistry {
    slots: RwLock<HashMap<SegmentId, PartitionSlot>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `segment`, if one was ever created.
    pub fn get(&self, segment: &SegmentId) -> Option<PartitionSlot> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(segment)
            .cloned()
    }

    /// Slot for `segment`, created empty if missing.
    pub fn slot(&self, segment: &SegmentId) -> PartitionSlot {
        if let Some(slot) = self.get(segment) {
            return slot;
        }
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(segment.clone())
            .or_default()
            .clone()
    }

    /// Forget `segment`. Holders of the old slot keep it alive but it is no
    /// longer reachable from the registry.
    pub fn remove(&self, segment: &SegmentId) -> Option<PartitionSlot> {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(segment)
    }

    /// Drop every slot whose id fails `keep`, returning the dropped ids.
    pub fn retain(&self, mut keep: impl FnMut(&SegmentId) -> bool) -> Vec<SegmentId> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let evicted: Vec<_> = slots.keys().filter(|&id| !keep(id)).cloned().collect();
        for id in &evicted {
            slots.remove(id);
        }
        evicted
    }

    /// Every slot with its id, sorted by id.
    pub fn entries(&self) -> Vec<(SegmentId, PartitionSlot)> {
        let mut entries: Vec<_> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
