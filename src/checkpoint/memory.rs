use super::CheckpointStore;
use crate::Result;
use agent_rpc::IntegrationId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory checkpoints for tests and one-off runs
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<(IntegrationId, String), DateTime<Utc>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(IntegrationId, String), DateTime<Utc>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, id: &IntegrationId, object_type: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .lock()
            .get(&(id.clone(), object_type.to_string()))
            .copied())
    }

    fn set(&self, id: &IntegrationId, object_type: &str, at: DateTime<Utc>) -> Result<()> {
        self.lock().insert((id.clone(), object_type.to_string()), at);
        Ok(())
    }

    fn clear(&self, id: &IntegrationId, object_type: &str) -> Result<()> {
        self.lock().remove(&(id.clone(), object_type.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set() {
        let store = MemoryCheckpointStore::new();
        let id = IntegrationId::untyped("jira");
        assert!(store.get(&id, "work.issue").unwrap().is_none());

        let now = Utc::now();
        store.set(&id, "work.issue", now).unwrap();
        assert_eq!(store.get(&id, "work.issue").unwrap(), Some(now));
        assert!(store.get(&id, "work.sprint").unwrap().is_none());
        assert_eq!(store.len(), 1);

        store.clear(&id, "work.issue").unwrap();
        store.clear(&id, "work.sprint").unwrap();
        assert!(store.is_empty());
    }
}
