use chatflow_core::{ChatId, ConversationStatus, UserId};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::record::{decode_notes, encode_notes, ConversationFields, ConversationFilter, ConversationRecord, Notes};
use crate::store::ConversationStore;

/// Tracks the single resumable conversation of one user in one chat.
///
/// A manager lives for one invocation. Construction resumes the active
/// conversation or, when a command is given, starts a new one. Pending note
/// changes are committed when the manager is finished or dropped, but only
/// for a manager that was handed a command.
pub struct ConversationManager<'s> {
    store: &'s dyn ConversationStore,
    user_id: UserId,
    chat_id: ChatId,
    command: Option<String>,
    command_supplied: bool,
    record: Option<ConversationRecord>,
    baseline_notes: Notes,
    notes: Notes,
    finalized: bool,
}

impl<'s> ConversationManager<'s> {
    /// Resume the active conversation, or start one for `command`.
    ///
    /// Never fails: check [`exists`](Self::exists) to see whether a
    /// conversation is loaded afterwards.
    #[instrument(skip(store))]
    pub fn new(
        store: &'s dyn ConversationStore,
        user_id: UserId,
        chat_id: ChatId,
        command: Option<&str>,
    ) -> Self {
        let mut manager = Self {
            store,
            user_id,
            chat_id,
            command: command.map(str::to_string),
            command_supplied: command.is_some(),
            record: None,
            baseline_notes: Notes::new(),
            notes: Notes::new(),
            finalized: false,
        };

        if !manager.load() && manager.command_supplied {
            manager.start();
        }
        manager
    }

    /// Load the active conversation for this user and chat.
    ///
    /// An active row owned by a different command is cancelled and treated as
    /// absent.
    pub fn load(&mut self) -> bool {
        self.record = None;
        self.baseline_notes = Notes::new();
        self.notes = Notes::new();

        let rows = match self.store.select_conversation(self.user_id, self.chat_id, 1) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(
                    "Failed to select conversation for user {} in chat {}: {}",
                    self.user_id, self.chat_id, e
                );
                return false;
            }
        };

        let Some(record) = rows.into_iter().next() else {
            debug!("No active conversation for user {} in chat {}", self.user_id, self.chat_id);
            return false;
        };

        if self.command.is_none() {
            self.command = Some(record.command.clone());
        }

        if self.command.as_deref() != Some(record.command.as_str()) {
            info!(
                "Cancelling stale conversation {} ('{}' superseded by '{}')",
                record.id,
                record.command,
                self.command.as_deref().unwrap_or_default()
            );
            self.record = Some(record);
            self.cancel();
            self.record = None;
            return false;
        }

        let notes = decode_notes(&record.notes);
        self.baseline_notes = notes.clone();
        self.notes = notes;

        debug!("Loaded conversation {} ('{}')", record.id, record.command);
        self.record = Some(record);
        true
    }

    pub fn exists(&self) -> bool {
        self.record.is_some()
    }

    /// Insert a new active conversation for the known command.
    pub fn start(&mut self) -> bool {
        if self.exists() {
            debug!("Conversation already loaded, not starting another");
            return false;
        }
        let Some(command) = self.command.clone() else {
            debug!("No command known, cannot start a conversation");
            return false;
        };

        match self.store.insert_conversation(self.user_id, self.chat_id, &command) {
            Ok(true) => {
                info!(
                    "Started conversation '{}' for user {} in chat {}",
                    command, self.user_id, self.chat_id
                );
                self.load()
            }
            Ok(false) => {
                warn!(
                    "Store rejected new conversation '{}' for user {} in chat {}",
                    command, self.user_id, self.chat_id
                );
                false
            }
            Err(e) => {
                warn!("Failed to insert conversation '{}': {}", command, e);
                false
            }
        }
    }

    pub fn stop(&mut self) -> bool {
        self.update_status(ConversationStatus::Stopped)
    }

    pub fn cancel(&mut self) -> bool {
        self.update_status(ConversationStatus::Cancelled)
    }

    /// Move the loaded conversation out of `Active`.
    ///
    /// Only a row that is still active and belongs to this user and chat is
    /// touched, so a racing transition on the same row loses with `false`.
    pub fn update_status(&mut self, status: ConversationStatus) -> bool {
        if !status.is_terminal() {
            debug!("Conversations cannot be moved back to {}", status);
            return false;
        }
        let Some(record) = self.record.as_mut() else {
            debug!("No conversation loaded, cannot set status {}", status);
            return false;
        };
        if record.status.is_terminal() {
            debug!("Conversation {} is already {}", record.id, record.status);
            return false;
        }

        let filter = ConversationFilter::by_id(record.id)
            .status(ConversationStatus::Active)
            .user_id(self.user_id)
            .chat_id(self.chat_id);

        match self.store.update_conversation(&ConversationFields::status(status), &filter) {
            Ok(true) => {
                info!("Conversation {} is now {}", record.id, status);
                record.status = status;
                true
            }
            Ok(false) => {
                debug!("Conversation {} was no longer active", record.id);
                false
            }
            Err(e) => {
                warn!("Failed to set conversation {} to {}: {}", record.id, status, e);
                false
            }
        }
    }

    /// Persist the current notes regardless of the conversation's status.
    pub fn update(&mut self) -> bool {
        let Some(record) = self.record.as_mut() else {
            debug!("No conversation loaded, nothing to update");
            return false;
        };

        let encoded = match encode_notes(&self.notes) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode notes for conversation {}: {}", record.id, e);
                return false;
            }
        };

        let fields = ConversationFields::notes(encoded.clone());
        match self.store.update_conversation(&fields, &ConversationFilter::by_id(record.id)) {
            Ok(true) => {
                debug!("Saved notes for conversation {}", record.id);
                record.notes = encoded;
                self.baseline_notes = self.notes.clone();
                true
            }
            Ok(false) => {
                warn!("Conversation {} vanished before its notes were saved", record.id);
                false
            }
            Err(e) => {
                warn!("Failed to save notes for conversation {}: {}", record.id, e);
                false
            }
        }
    }

    /// Effective command: supplied, or adopted from the resumed conversation.
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn record(&self) -> Option<&ConversationRecord> {
        self.record.as_ref()
    }

    pub fn status(&self) -> Option<ConversationStatus> {
        self.record.as_ref().map(|r| r.status)
    }

    pub fn notes(&self) -> &Notes {
        &self.notes
    }

    pub fn notes_mut(&mut self) -> &mut Notes {
        &mut self.notes
    }

    pub fn set_note(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.notes.insert(key.into(), value.into());
    }

    /// Whether the notes differ from what was last loaded or saved
    pub fn is_dirty(&self) -> bool {
        self.notes != self.baseline_notes
    }

    /// Save pending notes now, keeping the manager usable.
    ///
    /// Same rule as the commit on exit: only a manager handed a command
    /// writes, and only when the notes changed. Returns `false` only when a
    /// commit was due and did not take effect.
    pub fn commit(&mut self) -> bool {
        if !self.command_supplied || !self.is_dirty() {
            return true;
        }
        self.update()
    }

    /// Run the commit-on-exit step now instead of at drop.
    pub fn finish(mut self) -> bool {
        self.finalize()
    }

    fn finalize(&mut self) -> bool {
        if self.finalized {
            return true;
        }
        self.finalized = true;
        self.commit()
    }
}

impl Drop for ConversationManager<'_> {
    fn drop(&mut self) {
        if !self.finalize() {
            warn!(
                "Pending notes for user {} in chat {} were not saved",
                self.user_id, self.chat_id
            );
        }
    }
}
