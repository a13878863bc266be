//! Username → canonical ID cache shared by all sessions.
//!
//! Entries live for the whole process; there is no eviction and no TTL.
//! Usernames are assumed stable for the lifetime of the process.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

/// Concurrency-safe identifier cache.
///
/// Each write happens under a single lock acquisition, so a bulk
/// population is observed all at once or not at all. Two sessions
/// missing on the same username may both trigger a remote lookup; the
/// later write simply stores the same value again.
#[derive(Debug, Default)]
pub struct IdentifierCache {
    entries: RwLock<HashMap<String, String>>,
}

impl IdentifierCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a username (case-sensitive).
    pub async fn get(&self, username: &str) -> Option<String> {
        self.entries.read().await.get(username).cloned()
    }

    pub async fn insert(&self, username: impl Into<String>, id: impl Into<String>) {
        self.entries.write().await.insert(username.into(), id.into());
    }

    /// Store many entries in one write.
    pub async fn extend<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.extend(entries);
        debug!(added = guard.len() - before, total = guard.len(), "Identifier cache populated");
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
