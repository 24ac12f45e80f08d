use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::session::SessionStream;

/// Session id to live record.
///
/// Lock order is always the map first and then a record's own lock.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, Arc<SessionStream>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live record for `session_id`, creating one when there is
    /// none or the existing one is terminal. The flag is `true` when this
    /// call created it and is therefore responsible for opening upstream.
    pub async fn get_or_create(&self, session_id: &str) -> (Arc<SessionStream>, bool) {
        {
            let streams = self.streams.read().await;
            if let Some(existing) = streams.get(session_id) {
                if !existing.is_terminal() {
                    return (Arc::clone(existing), false);
                }
            }
        }

        let mut streams = self.streams.write().await;
        if let Some(existing) = streams.get(session_id) {
            if !existing.is_terminal() {
                return (Arc::clone(existing), false);
            }
            tracing::debug!(session_id = session_id, "replacing finished session stream");
        }

        let created = Arc::new(SessionStream::new(session_id));
        streams.insert(session_id.to_string(), Arc::clone(&created));
        (created, true)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionStream>> {
        self.streams.read().await.get(session_id).cloned()
    }

    /// Remove `session_id` only if it still maps to `expected`.
    pub async fn remove_if_same(&self, session_id: &str, expected: &Arc<SessionStream>) -> bool {
        let mut streams = self.streams.write().await;
        match streams.get(session_id) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                streams.remove(session_id);
                true
            }
            _ => false,
        }
    }

    /// Deferred cleanup: drop `expected` if it is still the mapped record,
    /// terminal, and has nobody attached. A record that a newer run replaced
    /// is left alone.
    pub async fn reap(&self, session_id: &str, expected: &Arc<SessionStream>) -> bool {
        let mut streams = self.streams.write().await;
        match streams.get(session_id) {
            Some(current) if Arc::ptr_eq(current, expected) && current.is_reclaimable() => {
                streams.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub async fn list(&self) -> Vec<Arc<SessionStream>> {
        self.streams.read().await.values().cloned().collect()
    }

    pub async fn drain(&self) -> Vec<Arc<SessionStream>> {
        self.streams
            .write()
            .await
            .drain()
            .map(|(_, stream)| stream)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.streams.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DriverEvent;

    #[tokio::test]
    async fn get_or_create_reuses_live_record() {
        let registry = StreamRegistry::new();
        let (first, created) = registry.get_or_create("s1").await;
        assert!(created);
        let (second, created) = registry.get_or_create("s1").await;
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn terminal_record_is_replaced() {
        let registry = StreamRegistry::new();
        let (first, _) = registry.get_or_create("s1").await;
        first.handle(DriverEvent::Opened);
        first.handle(DriverEvent::Ended);

        let (second, created) = registry.get_or_create("s1").await;
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!registry.reap("s1", &first).await);
        assert!(!registry.remove_if_same("s1", &first).await);
        assert!(registry.get("s1").await.is_some());
    }

    #[tokio::test]
    async fn reap_requires_terminal_and_unattached() {
        let registry = StreamRegistry::new();
        let (stream, _) = registry.get_or_create("s1").await;
        stream.handle(DriverEvent::Opened);
        let subscription = stream.join().expect("join");

        assert!(!registry.reap("s1", &stream).await);

        stream.handle(DriverEvent::Ended);
        drop(subscription);
        assert!(registry.reap("s1", &stream).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn drain_empties_the_map() {
        let registry = StreamRegistry::new();
        registry.get_or_create("a").await;
        registry.get_or_create("b").await;

        let mut ids = registry
            .drain()
            .await
            .iter()
            .map(|stream| stream.id().to_string())
            .collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(registry.is_empty().await);
    }
}
