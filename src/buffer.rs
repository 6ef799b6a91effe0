//! Latest-snapshot buffers shared between producers and delivery channels.
//!
//! Each source owns one slot holding the most recent `Snapshot`. A producer
//! replaces the whole snapshot in one atomic swap, so a reader either sees the
//! previous cycle's images and metadata or the new ones, never a mix.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;

use crate::encode::EncodedImage;
use crate::view::ViewKey;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SnapshotMeta {
    /// Measured production rate, rounded to one decimal.
    pub fps: f32,
    /// Cycle counter of the producer that published this snapshot.
    pub sequence: u64,
}

/// Everything one production cycle published for a source.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub images: BTreeMap<ViewKey, EncodedImage>,
    pub meta: SnapshotMeta,
}

impl Snapshot {
    pub fn image(&self, key: ViewKey) -> Option<&EncodedImage> {
        self.images.get(&key)
    }
}

type Slot = Arc<ArcSwapOption<Snapshot>>;

/// Registry of per-source snapshot slots.
#[derive(Default)]
pub struct FrameBuffers {
    slots: DashMap<String, Slot>,
}

impl FrameBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, source_id: &str) -> Option<Slot> {
        self.slots.get(source_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Replaces the source's snapshot. The slot is created on first publish.
    pub fn publish(&self, source_id: &str, snapshot: Snapshot) {
        let slot = match self.slot(source_id) {
            Some(slot) => slot,
            None => Arc::clone(
                self.slots
                    .entry(source_id.to_string())
                    .or_insert_with(|| Arc::new(ArcSwapOption::empty()))
                    .value(),
            ),
        };
        slot.store(Some(Arc::new(snapshot)));
    }

    pub fn latest(&self, source_id: &str) -> Option<Arc<Snapshot>> {
        self.slot(source_id)?.load_full()
    }

    pub fn remove(&self, source_id: &str) -> Option<Arc<Snapshot>> {
        self.slots
            .remove(source_id)
            .and_then(|(_, slot)| slot.load_full())
    }

    pub fn sources(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }
}
