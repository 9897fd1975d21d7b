use shared::protocol::PresenceRecord;

use crate::{event_bus::Delivery, PresenceState};

/// Merged record plus the observers that still have to see it.
pub(crate) struct Notification {
    pub(crate) record: PresenceRecord,
    pub(crate) delivery: Delivery<Option<PresenceRecord>>,
}

impl PresenceState {
    /// Merges `patch` into the store and queues the merged value (never the
    /// raw patch) for every observer of that user.
    pub(crate) fn apply(&mut self, patch: &PresenceRecord) -> Option<Notification> {
        if patch.id.is_empty() {
            return None;
        }

        let record = self.store.set(patch).clone();
        self.tracker.mark_resolved(&record.id);
        let delivery = self.bus.emit(&record.id, Some(record.clone()));
        Some(Notification { record, delivery })
    }
}
