//! Contract between the server core and its data provider. The provider
//! supplies a byte store for world columns keyed by `(dimension, x, z)`, a
//! string store for settings, a log sink and a structured chat-log sink.
//! Concrete SQL drivers live outside the core; the in-memory provider below
//! backs tests and offline runs.

use parking_lot::Mutex;
use slog::Level;
use std::collections::HashMap;
use std::fmt;

use crate::time::timestamp_secs;

/// Failure talking to the backing store. Saves that fail leave the caller's
/// state untouched so the operation can be retried later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backend rejected or failed the operation.
    Backend(String),
    /// Stored bytes did not match the expected shape.
    Corrupt(&'static str),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageError::Backend(msg) => write!(f, "storage backend error: {}", msg),
            StorageError::Corrupt(what) => write!(f, "corrupt stored data: {}", what),
        }
    }
}

impl std::error::Error for StorageError {}

/// One chat-log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
    pub timestamp: u64,
    pub from: String,
    /// Empty means a broadcast.
    pub to: Vec<String>,
    pub message: String,
}

impl ChatRecord {
    pub fn broadcast(from: &str, message: &str) -> ChatRecord {
        ChatRecord {
            timestamp: timestamp_secs(),
            from: from.to_owned(),
            to: Vec::new(),
            message: message.to_owned(),
        }
    }

    pub fn whisper(from: &str, to: &str, message: &str) -> ChatRecord {
        ChatRecord {
            timestamp: timestamp_secs(),
            from: from.to_owned(),
            to: vec![to.to_owned()],
            message: message.to_owned(),
        }
    }
}

/// Backing-store contract required by the core. Implementations are called
/// from worker and maintenance threads and must be internally synchronized.
/// The log and chat sinks must never panic.
pub trait DataProvider: Send + Sync {
    /// Loads the raw bytes of a column, or `None` if it was never saved.
    fn load_column(&self, dimension: i8, x: i32, z: i32) -> Result<Option<Vec<u8>>, StorageError>;

    /// Saves the raw bytes of a column.
    fn save_column(&self, dimension: i8, x: i32, z: i32, bytes: &[u8]) -> Result<(), StorageError>;

    fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn write_log(&self, level: Level, text: &str);

    fn write_chat(&self, record: &ChatRecord);
}

/// Provider keeping everything in process memory.
pub struct MemoryProvider {
    columns: Mutex<HashMap<(i8, i32, i32), Vec<u8>>>,
    settings: Mutex<HashMap<String, String>>,
    log: Mutex<Vec<(Level, String)>>,
    chat: Mutex<Vec<ChatRecord>>,
}

impl MemoryProvider {
    pub fn new() -> MemoryProvider {
        MemoryProvider {
            columns: Mutex::new(HashMap::new()),
            settings: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            chat: Mutex::new(Vec::new()),
        }
    }

    /// Number of columns currently saved.
    pub fn column_count(&self) -> usize {
        self.columns.lock().len()
    }

    /// Snapshot of the chat transcript.
    pub fn chat_transcript(&self) -> Vec<ChatRecord> {
        self.chat.lock().clone()
    }

    /// Snapshot of the log sink.
    pub fn log_lines(&self) -> Vec<(Level, String)> {
        self.log.lock().clone()
    }
}

impl DataProvider for MemoryProvider {
    fn load_column(&self, dimension: i8, x: i32, z: i32) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.columns.lock().get(&(dimension, x, z)).cloned())
    }

    fn save_column(&self, dimension: i8, x: i32, z: i32, bytes: &[u8]) -> Result<(), StorageError> {
        self.columns.lock().insert((dimension, x, z), bytes.to_vec());
        Ok(())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.settings.lock().get(key).cloned())
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.settings.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn write_log(&self, level: Level, text: &str) {
        self.log.lock().push((level, text.to_owned()));
    }

    fn write_chat(&self, record: &ChatRecord) {
        self.chat.lock().push(record.clone());
    }
}
