//! Named channel tracking.

use std::collections::HashMap;
use std::sync::Arc;

/// Channels tracked by name on the live connection.
///
/// Entries belong to exactly one connection; the manager clears the registry
/// whenever that connection is replaced or closed.
#[derive(Debug)]
pub struct ChannelRegistry<C> {
    channels: HashMap<String, Arc<C>>,
}

impl<C> Default for ChannelRegistry<C> {
    fn default() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }
}

impl<C> ChannelRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<C>> {
        self.channels.get(name).cloned()
    }

    /// Track `channel` under `name` unless a channel is already tracked there.
    /// Returns whichever channel ends up tracked.
    pub fn get_or_insert(&mut self, name: &str, channel: Arc<C>) -> Arc<C> {
        Arc::clone(
            self.channels
                .entry(name.to_string())
                .or_insert(channel),
        )
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<C>> {
        self.channels.remove(name)
    }

    /// Drop every tracked channel, returning how many were tracked.
    pub fn clear(&mut self) -> usize {
        let count = self.channels.len();
        self.channels.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }
}
