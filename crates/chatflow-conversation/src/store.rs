use chatflow_core::{ChatId, ChatflowError, Result, UserId};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::record::{ConversationFields, ConversationFilter, ConversationRecord};

/// Persistence collaborator of [`crate::ConversationManager`].
///
/// Every call blocks until the backing store has answered.
#[cfg_attr(test, mockall::automock)]
pub trait ConversationStore {
    /// Active rows for `(user_id, chat_id)`, at most `limit` of them.
    fn select_conversation(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>>;

    /// Insert a new active row with empty notes.
    fn insert_conversation(&self, user_id: UserId, chat_id: ChatId, command: &str) -> Result<bool>;

    /// Apply `fields` to every row matching `filter`.
    ///
    /// Returns whether at least one row was affected.
    fn update_conversation(
        &self,
        fields: &ConversationFields,
        filter: &ConversationFilter,
    ) -> Result<bool>;
}

/// In-process store keeping rows in insertion order
pub struct MemoryStore {
    rows: Mutex<Vec<ConversationRecord>>,
    enforce_single_active: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            enforce_single_active: true,
        }
    }

    /// Whether an insert is refused while the key already has an active row
    pub fn with_single_active(mut self, enforce: bool) -> Self {
        self.enforce_single_active = enforce;
        self
    }

    /// Snapshot of every stored row, including stopped and cancelled ones
    pub fn records(&self) -> Result<Vec<ConversationRecord>> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<ConversationRecord>>> {
        self.rows
            .lock()
            .map_err(|_| ChatflowError::Store("memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore for MemoryStore {
    fn select_conversation(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>> {
        let rows = self.lock()?;
        Ok(select_active(&rows, user_id, chat_id, limit))
    }

    fn insert_conversation(&self, user_id: UserId, chat_id: ChatId, command: &str) -> Result<bool> {
        let mut rows = self.lock()?;
        Ok(insert_active(&mut rows, user_id, chat_id, command, self.enforce_single_active))
    }

    fn update_conversation(
        &self,
        fields: &ConversationFields,
        filter: &ConversationFilter,
    ) -> Result<bool> {
        let mut rows = self.lock()?;
        Ok(apply_update(&mut rows, fields, filter) > 0)
    }
}

pub(crate) fn select_active(
    rows: &[ConversationRecord],
    user_id: UserId,
    chat_id: ChatId,
    limit: usize,
) -> Vec<ConversationRecord> {
    rows.iter()
        .filter(|r| r.user_id == user_id && r.chat_id == chat_id && r.is_active())
        .take(limit)
        .cloned()
        .collect()
}

pub(crate) fn insert_active(
    rows: &mut Vec<ConversationRecord>,
    user_id: UserId,
    chat_id: ChatId,
    command: &str,
    enforce_single_active: bool,
) -> bool {
    if enforce_single_active
        && rows
            .iter()
            .any(|r| r.user_id == user_id && r.chat_id == chat_id && r.is_active())
    {
        debug!(
            "Refusing second active conversation for user {} in chat {}",
            user_id, chat_id
        );
        return false;
    }

    let record = ConversationRecord::new(user_id, chat_id, command);
    debug!("Inserted conversation {} ({})", record.id, command);
    rows.push(record);
    true
}

/// Returns the number of affected rows
pub(crate) fn apply_update(
    rows: &mut [ConversationRecord],
    fields: &ConversationFields,
    filter: &ConversationFilter,
) -> usize {
    if fields.is_empty() {
        return 0;
    }

    let mut affected = 0;
    for row in rows.iter_mut().filter(|r| filter.matches(r)) {
        row.apply(fields);
        affected += 1;
    }
    affected
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::ConversationStatus;

    #[test]
    fn test_select_only_returns_active_rows_for_key() {
        let store = MemoryStore::new();
        assert!(store.insert_conversation(1, 10, "poll").unwrap());
        assert!(store.insert_conversation(2, 10, "poll").unwrap());

        let rows = store.select_conversation(1, 10, 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, 1);
        assert_eq!(rows[0].notes, "{}");

        let filter = ConversationFilter::by_id(rows[0].id);
        assert!(store
            .update_conversation(&ConversationFields::status(ConversationStatus::Stopped), &filter)
            .unwrap());
        assert!(store.select_conversation(1, 10, 1).unwrap().is_empty());
    }

    #[test]
    fn test_single_active_is_enforced_on_insert() {
        let store = MemoryStore::new();
        assert!(store.insert_conversation(1, 10, "poll").unwrap());
        assert!(!store.insert_conversation(1, 10, "other").unwrap());
        assert_eq!(store.records().unwrap().len(), 1);

        let lax = MemoryStore::new().with_single_active(false);
        assert!(lax.insert_conversation(1, 10, "poll").unwrap());
        assert!(lax.insert_conversation(1, 10, "other").unwrap());
        assert_eq!(lax.select_conversation(1, 10, 5).unwrap().len(), 2);
        assert_eq!(lax.select_conversation(1, 10, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_conditional_update_matches_nothing_once_terminal() {
        let store = MemoryStore::new();
        store.insert_conversation(1, 10, "poll").unwrap();
        let id = store.select_conversation(1, 10, 1).unwrap()[0].id;

        let active = ConversationFilter::by_id(id).status(ConversationStatus::Active);
        let cancel = ConversationFields::status(ConversationStatus::Cancelled);
        assert!(store.update_conversation(&cancel, &active).unwrap());
        assert!(!store.update_conversation(&cancel, &active).unwrap());

        // Unconditional notes write still lands
        let notes = ConversationFields::notes(r#"{"done":true}"#);
        assert!(store.update_conversation(&notes, &ConversationFilter::by_id(id)).unwrap());
        assert_eq!(store.records().unwrap()[0].notes, r#"{"done":true}"#);
    }

    #[test]
    fn test_empty_fields_affect_nothing() {
        let store = MemoryStore::new();
        store.insert_conversation(1, 10, "poll").unwrap();
        assert!(!store
            .update_conversation(&ConversationFields::default(), &ConversationFilter::default())
            .unwrap());
    }
}
