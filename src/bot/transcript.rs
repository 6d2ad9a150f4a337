//! Append-only SQLite record of handled exchanges.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, params};
use tracing::{info, warn};

/// One inbound batch and the reply that was delivered for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptRecord {
    pub sender_id: String,
    pub sender_name: String,
    pub message: String,
    pub reply: String,
}

pub struct TranscriptStore {
    conn: Mutex<Connection>,
}

impl TranscriptStore {
    /// Create a new in-memory store.
    pub fn in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("Failed to create in-memory database: {e}"))?;
        Self::with_connection(conn)
    }

    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {:?}: {e}", parent))?;
        }
        let conn = Connection::open(path).map_err(|e| format!("Failed to open database: {e}"))?;
        let store = Self::with_connection(conn)?;
        info!("Loaded transcript store from {:?} ({} records)", path, store.count());
        Ok(store)
    }

    fn with_connection(conn: Connection) -> Result<Self, String> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id TEXT NOT NULL,
                sender_name TEXT NOT NULL,
                message TEXT NOT NULL,
                reply TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chat_messages_sender ON chat_messages(sender_id);
        "#,
        )
        .map_err(|e| format!("Failed to initialize database schema: {e}"))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn append(&self, record: &TranscriptRecord) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|_| "transcript lock poisoned".to_string())?;
        conn.execute(
            "INSERT INTO chat_messages (sender_id, sender_name, message, reply, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.sender_id,
                record.sender_name,
                record.message,
                record.reply,
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
            ],
        )
        .map(|_| ())
        .map_err(|e| format!("Failed to insert transcript: {e}"))
    }

    pub fn count(&self) -> usize {
        let Ok(conn) = self.conn.lock() else { return 0 };
        conn.query_row("SELECT COUNT(*) FROM chat_messages", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    /// Most recent records for a sender, newest last.
    #[cfg(test)]
    pub(crate) fn recent(&self, sender_id: &str, limit: usize) -> Vec<TranscriptRecord> {
        let Ok(conn) = self.conn.lock() else { return Vec::new() };
        let mut stmt = match conn.prepare(
            "SELECT sender_id, sender_name, message, reply FROM chat_messages
             WHERE sender_id = ?1 ORDER BY id DESC LIMIT ?2",
        ) {
            Ok(stmt) => stmt,
            Err(e) => {
                warn!("Failed to prepare transcript query: {e}");
                return Vec::new();
            }
        };

        let rows = stmt.query_map(params![sender_id, limit as i64], |row| {
            Ok(TranscriptRecord {
                sender_id: row.get(0)?,
                sender_name: row.get(1)?,
                message: row.get(2)?,
                reply: row.get(3)?,
            })
        });

        let mut records: Vec<TranscriptRecord> = match rows {
            Ok(rows) => rows.filter_map(Result::ok).collect(),
            Err(e) => {
                warn!("Transcript query failed: {e}");
                Vec::new()
            }
        };
        records.reverse();
        records
    }
}

/// Persist `record` on the blocking pool without waiting for it.
pub fn append_in_background(store: Arc<TranscriptStore>, record: TranscriptRecord) {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = store.append(&record) {
            warn!("Failed to save transcript for {}: {}", record.sender_id, e);
        }
    });
}
