//! SQLite-backed session registry
//!
//! This module provides durable storage for the correlation id → backend port
//! mapping that drives proxy routing, plus the opaque chat payloads attached
//! to a session. State survives gateway restarts.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Errors from the backing store
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored port {port} for '{correlation_id}' is out of range")]
    CorruptPort { correlation_id: String, port: i64 },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A stored chat payload
#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub id: i64,
    pub correlation_id: String,
    pub payload: Vec<u8>,
    pub created_at: String,
}

/// Durable session registry with thread-safe access
///
/// Cloning is cheap and every clone shares the same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL lets readers proceed while a write is in progress
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )?;

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: session table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: instances");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                correlation_id TEXT PRIMARY KEY,
                port INTEGER NOT NULL
            );

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Migration v2: chat payloads
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: chats");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                correlation_id TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_chats_correlation ON chats(correlation_id);

            INSERT INTO schema_migrations (version) VALUES (2);
            "#,
        )?;

        Ok(())
    }

    // ==================== Sessions ====================

    /// Insert or replace the port for a session (last writer wins)
    pub fn put(&self, correlation_id: &str, port: u16) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO instances (correlation_id, port) VALUES (?1, ?2)",
            params![correlation_id, port],
        )?;
        Ok(())
    }

    /// Look up the port for a session
    pub fn get(&self, correlation_id: &str) -> Result<Option<u16>> {
        let conn = self.conn.lock();
        let port: Option<i64> = conn
            .query_row(
                "SELECT port FROM instances WHERE correlation_id = ?1",
                params![correlation_id],
                |row| row.get(0),
            )
            .optional()?;

        port.map(|p| to_port(correlation_id, p)).transpose()
    }

    /// Remove a session, returning whether it existed
    pub fn delete(&self, correlation_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM instances WHERE correlation_id = ?1",
            params![correlation_id],
        )?;
        Ok(rows > 0)
    }

    /// Snapshot of every session
    pub fn list(&self) -> Result<HashMap<String, u16>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT correlation_id, port FROM instances")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, port)| {
                let port = to_port(&id, port)?;
                Ok((id, port))
            })
            .collect()
    }

    pub fn exists(&self, correlation_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM instances WHERE correlation_id = ?1 LIMIT 1",
                params![correlation_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ==================== Chats ====================

    /// Store an opaque chat payload for a session
    pub fn insert_chat(&self, correlation_id: &str, payload: &[u8]) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chats (correlation_id, payload) VALUES (?1, ?2)",
            params![correlation_id, payload],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All chat payloads for a session, oldest first
    pub fn list_chats(&self, correlation_id: &str) -> Result<Vec<ChatRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, correlation_id, payload, created_at FROM chats
             WHERE correlation_id = ?1 ORDER BY id ASC",
        )?;
        let chats = stmt
            .query_map(params![correlation_id], |row| {
                Ok(ChatRecord {
                    id: row.get(0)?,
                    correlation_id: row.get(1)?,
                    payload: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(chats)
    }
}

fn to_port(correlation_id: &str, port: i64) -> Result<u16> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| RegistryError::CorruptPort {
            correlation_id: correlation_id.to_string(),
            port,
        })
}
