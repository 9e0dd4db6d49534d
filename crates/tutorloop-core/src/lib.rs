pub mod config;
pub mod error;
pub mod logging;
pub mod record;
pub mod store;
pub mod watch;

pub use config::Settings;
pub use error::{StoreError, StoreResult};
pub use record::{
    new_record_id, ChatHistoryRecord, HistoryMessage, PromptRecord, ResponseRecord, Role,
};
pub use store::{Datastore, FileStore, MemoryStore};
pub use watch::{ResponseWatcher, WatchError, WatchEvent};
