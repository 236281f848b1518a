use chatflow_config::ChatflowConfig;
use chatflow_core::{ChatId, ChatflowError, Result, UserId};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::record::{ConversationFields, ConversationFilter, ConversationRecord};
use crate::store::{apply_update, insert_active, select_active, ConversationStore};

/// File-based conversation store.
///
/// All rows live in one JSON document which is rewritten on every mutation,
/// so state survives across separate processes. There is no cross-process
/// locking.
pub struct FileStore {
    path: PathBuf,
    enforce_single_active: bool,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        debug!("FileStore initialized: path={:?}", path);
        Self {
            path,
            enforce_single_active: true,
        }
    }

    pub fn from_config(config: &ChatflowConfig) -> Self {
        Self::new(config.store_path()).with_single_active(config.store.enforce_single_active)
    }

    pub fn with_single_active(mut self, enforce: bool) -> Self {
        self.enforce_single_active = enforce;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored row, including stopped and cancelled ones
    pub fn read_records(&self) -> Result<Vec<ConversationRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let json = fs::read_to_string(&self.path).map_err(ChatflowError::Io)?;
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<ConversationRecord> = serde_json::from_str(&json)?;
        Ok(rows)
    }

    fn write_records(&self, rows: &[ConversationRecord]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(ChatflowError::Io)?;

        // Each write gets its own temp file next to the target, then an
        // atomic rename, so readers only ever see a complete document
        let json = serde_json::to_string_pretty(rows)?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(ChatflowError::Io)?;
        tmp.write_all(json.as_bytes()).map_err(ChatflowError::Io)?;
        tmp.as_file().sync_all().map_err(ChatflowError::Io)?;
        tmp.persist(&self.path).map_err(|e| ChatflowError::Io(e.error))?;

        debug!("Saved {} conversation rows to {:?}", rows.len(), self.path);
        Ok(())
    }
}

impl ConversationStore for FileStore {
    fn select_conversation(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>> {
        let rows = self.read_records()?;
        Ok(select_active(&rows, user_id, chat_id, limit))
    }

    fn insert_conversation(&self, user_id: UserId, chat_id: ChatId, command: &str) -> Result<bool> {
        let mut rows = self.read_records()?;
        if !insert_active(&mut rows, user_id, chat_id, command, self.enforce_single_active) {
            return Ok(false);
        }
        self.write_records(&rows)?;

        info!(
            "Created conversation '{}' for user {} in chat {}",
            command, user_id, chat_id
        );
        Ok(true)
    }

    fn update_conversation(
        &self,
        fields: &ConversationFields,
        filter: &ConversationFilter,
    ) -> Result<bool> {
        let mut rows = self.read_records()?;
        let affected = apply_update(&mut rows, fields, filter);
        if affected == 0 {
            return Ok(false);
        }
        self.write_records(&rows)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::ConversationStatus;
    use tempfile::TempDir;

    #[test]
    fn test_rows_survive_reopening() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state").join("conversations.json");

        let store = FileStore::new(&path);
        assert!(store.select_conversation(42, 100, 1).unwrap().is_empty());
        assert!(store.insert_conversation(42, 100, "subscribe").unwrap());
        assert!(path.exists());

        let reopened = FileStore::new(&path);
        let rows = reopened.select_conversation(42, 100, 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].command, "subscribe");
        assert_eq!(rows[0].status, ConversationStatus::Active);
    }

    #[test]
    fn test_update_writes_only_when_rows_match() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().join("conversations.json"));
        store.insert_conversation(7, 9, "poll").unwrap();
        let id = store.select_conversation(7, 9, 1).unwrap()[0].id;

        let stop = ConversationFields::status(ConversationStatus::Stopped);
        let filter = ConversationFilter::by_id(id).status(ConversationStatus::Active);
        assert!(store.update_conversation(&stop, &filter).unwrap());
        assert!(!store.update_conversation(&stop, &filter).unwrap());

        let rows = store.read_records().unwrap();
        assert_eq!(rows[0].status, ConversationStatus::Stopped);
    }

    #[test]
    fn test_writes_leave_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().join("conversations.json"));
        for user_id in 0..5 {
            store.insert_conversation(user_id, 1, "poll").unwrap();
        }

        let entries: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(store.read_records().unwrap().len(), 5);
    }

    #[test]
    fn test_concurrent_writers_never_corrupt_the_document() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conversations.json");
        FileStore::new(&path).insert_conversation(0, 0, "seed").unwrap();

        std::thread::scope(|scope| {
            for user_id in 1..=4 {
                let path = path.clone();
                scope.spawn(move || {
                    let store = FileStore::new(path).with_single_active(false);
                    for _ in 0..10 {
                        // Rows may be lost to last-writer-wins, but every
                        // read must see a whole document
                        store.insert_conversation(user_id, 1, "poll").unwrap();
                    }
                });
            }
        });

        let rows = FileStore::new(&path).read_records().unwrap();
        assert!(!rows.is_empty());
        let entries: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conversations.json");
        fs::write(&path, "not json").unwrap();

        let store = FileStore::new(&path);
        assert!(store.select_conversation(1, 1, 1).is_err());
    }

    #[test]
    fn test_from_config_uses_store_settings() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = ChatflowConfig::default();
        config.store.home_dir = temp_dir.path().to_path_buf();
        config.store.file_name = "bot.json".to_string();
        config.store.enforce_single_active = false;

        let store = FileStore::from_config(&config);
        assert_eq!(store.path(), temp_dir.path().join("bot.json"));
        assert!(store.insert_conversation(1, 1, "a").unwrap());
        assert!(store.insert_conversation(1, 1, "b").unwrap());
    }
}
