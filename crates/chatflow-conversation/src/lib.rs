pub mod record;
pub mod store;
pub mod storage;
pub mod manager;

pub use record::{decode_notes, encode_notes, ConversationFields, ConversationFilter, ConversationRecord, Notes};
pub use store::{ConversationStore, MemoryStore};
pub use storage::FileStore;
pub use manager::ConversationManager;
