//! The set of online channels.
//!
//! Only the discovery loop owns a [`ChannelRegistry`] and can insert or
//! remove channels. Everyone else gets a [`RegistryReader`], which observes
//! published snapshots of the set.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::models::channel::{Channel, ChannelSnapshot};

pub struct ChannelRegistry {
    channels: BTreeMap<String, Arc<Channel>>,
    publisher: watch::Sender<Vec<Arc<Channel>>>,
}

/// Read-only view of the online channels
#[derive(Clone)]
pub struct RegistryReader {
    channels: watch::Receiver<Vec<Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(Vec::new());
        Self {
            channels: BTreeMap::new(),
            publisher,
        }
    }

    pub fn reader(&self) -> RegistryReader {
        RegistryReader {
            channels: self.publisher.subscribe(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Channel>> {
        self.channels.get(id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.values()
    }

    /// Adds a channel. Returns false, leaving the registry untouched, if the id is taken.
    pub fn insert(&mut self, channel: Arc<Channel>) -> bool {
        if self.channels.contains_key(&channel.id) {
            return false;
        }
        self.channels.insert(channel.id.clone(), channel);
        self.publish();
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<Channel>> {
        let removed = self.channels.remove(id);
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    fn publish(&self) {
        self.publisher
            .send_replace(self.channels.values().cloned().collect());
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryReader {
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.channels.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.borrow().is_empty()
    }

    pub fn find(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.borrow().iter().find(|c| c.id == id).cloned()
    }

    /// Snapshot of every online channel, ordered by id
    pub async fn snapshot(&self) -> Vec<ChannelSnapshot> {
        let channels = self.channels();
        let mut out = Vec::with_capacity(channels.len());
        for channel in channels {
            out.push(channel.snapshot().await);
        }
        out
    }

    /// Resolves when the set of channels changes; false once the registry is gone.
    pub async fn changed(&mut self) -> bool {
        self.channels.changed().await.is_ok()
    }
}
