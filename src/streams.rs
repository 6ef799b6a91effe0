//! Camera stream bindings.
//!
//! Maps an externally visible camera id to the (source id, view key) pair a
//! delivery channel reads. Binding and unbinding never start or stop a
//! producer; several cameras may share one source.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use dashmap::DashMap;

use crate::view::ViewKey;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamBinding {
    pub source_id: String,
    pub key: ViewKey,
}

#[derive(Default)]
pub struct StreamBindings {
    bindings: DashMap<String, StreamBinding>,
    next_id: AtomicU64,
}

impl StreamBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new camera for `key` of `source_id` and returns its id (`cam-<n>`).
    pub fn bind(&self, source_id: &str, key: ViewKey) -> Result<String> {
        if source_id.trim().is_empty() {
            return Err(anyhow!("source id cannot be empty"));
        }
        let camera_id = format!("cam-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.bindings.insert(
            camera_id.clone(),
            StreamBinding {
                source_id: source_id.to_string(),
                key,
            },
        );
        Ok(camera_id)
    }

    pub fn resolve(&self, camera_id: &str) -> Option<StreamBinding> {
        self.bindings.get(camera_id).map(|entry| entry.value().clone())
    }

    pub fn unbind(&self, camera_id: &str) -> Option<StreamBinding> {
        self.bindings.remove(camera_id).map(|(_, binding)| binding)
    }

    /// Camera ids bound to `source_id`, sorted.
    pub fn cameras_for(&self, source_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .bindings
            .iter()
            .filter(|entry| entry.value().source_id == source_id)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_resolve_unbind() {
        let streams = StreamBindings::new();
        let a = streams.bind("lobby", ViewKey::Partition(1)).unwrap();
        let b = streams.bind("lobby", ViewKey::Original).unwrap();
        assert_eq!(a, "cam-1");
        assert_eq!(b, "cam-2");
        assert_eq!(
            streams.resolve(&a),
            Some(StreamBinding {
                source_id: "lobby".to_string(),
                key: ViewKey::Partition(1)
            })
        );
        assert_eq!(streams.cameras_for("lobby"), vec![a.clone(), b.clone()]);
        assert!(streams.unbind(&a).is_some());
        assert!(streams.resolve(&a).is_none());
        assert_eq!(streams.cameras_for("lobby"), vec![b]);
        assert!(streams.bind(" ", ViewKey::Original).is_err());
    }
}
