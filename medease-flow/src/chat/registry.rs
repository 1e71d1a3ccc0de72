use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::session::ChatSession;
use crate::error::{FlowError, Result};

/// A session guarded for exclusive use by one handler at a time
pub type SharedSession = Arc<Mutex<ChatSession>>;

/// Live sessions keyed by connection id
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn open(&self, session: ChatSession) -> Result<SharedSession>;
    async fn get(&self, id: &str) -> Result<Option<SharedSession>>;
    /// Forget the session; its history and credential are dropped
    async fn close(&self, id: &str) -> Result<()>;
}

/// In-memory implementation of SessionRegistry
pub struct InMemorySessionRegistry {
    sessions: Arc<DashMap<String, SharedSession>>,
}

impl InMemorySessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for InMemorySessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionRegistry for InMemorySessionRegistry {
    async fn open(&self, session: ChatSession) -> Result<SharedSession> {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(entry) => Err(FlowError::InvalidInput(format!(
                "session {} is already open",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                let shared = Arc::new(Mutex::new(session));
                entry.insert(shared.clone());
                Ok(shared)
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<SharedSession>> {
        Ok(self.sessions.get(id).map(|entry| entry.clone()))
    }

    async fn close(&self, id: &str) -> Result<()> {
        self.sessions.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_get_close() {
        let registry = InMemorySessionRegistry::new();
        registry
            .open(ChatSession::new("conn-1", None, "sys"))
            .await
            .unwrap();

        assert!(registry.get("conn-1").await.unwrap().is_some());
        assert!(
            registry
                .open(ChatSession::new("conn-1", None, "sys"))
                .await
                .is_err()
        );

        registry.close("conn-1").await.unwrap();
        assert!(registry.get("conn-1").await.unwrap().is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_opens_of_one_id_admit_exactly_one() {
        let registry = Arc::new(InMemorySessionRegistry::new());
        let opens: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .open(ChatSession::new("conn-1", None, "sys"))
                        .await
                        .is_ok()
                })
            })
            .collect();

        let mut admitted = 0;
        for open in opens {
            if open.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(registry.len(), 1);
    }
}
