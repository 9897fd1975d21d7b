use std::collections::HashMap;

use shared::{domain::UserId, protocol::PresenceRecord};

/// Last known presence per user. Only the notifier writes to it; callers
/// are responsible for telling observers about changes.
#[derive(Debug, Default, Clone)]
pub struct PresenceStore {
    records: HashMap<UserId, PresenceRecord>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, id: &UserId) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &UserId) -> Option<&PresenceRecord> {
        self.records.get(id)
    }

    /// Merges `patch` into the stored record, creating it if needed, and
    /// returns the merged value.
    pub fn set(&mut self, patch: &PresenceRecord) -> &PresenceRecord {
        self.records
            .entry(patch.id.clone())
            .and_modify(|current| current.merge(patch))
            .or_insert_with(|| patch.clone())
    }

    pub fn delete(&mut self, id: &UserId) -> Option<PresenceRecord> {
        self.records.remove(id)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> HashMap<UserId, PresenceRecord> {
        self.records.clone()
    }
}
