//! Durable storage for the serialized ledger document.
//!
//! Backends only move opaque JSON strings; serialization and validation stay
//! in the store.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use crate::ledger::core::config::StorageConfig;
use crate::ledger::core::errors::{LedgerError, LedgerResult};

/// Boxed future type for storage operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Key under which the ledger document is stored.
pub const DOCUMENT_KEY: &str = "ledger";

/// Storage for one serialized document.
pub trait DocumentStorage: Send + Sync {
    /// Read the stored document, if any.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn read_document(&self) -> StoreFuture<'_, LedgerResult<Option<String>>>;

    /// Replace the stored document.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn write_document(&self, body: String) -> StoreFuture<'_, LedgerResult<()>>;
}

/// `SQLite` implementation of document storage.
pub struct SqliteDocumentStorage {
    conn: Connection,
    table: String,
}

impl SqliteDocumentStorage {
    /// Open the database file named in the config and create the table.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub async fn open(config: &StorageConfig) -> LedgerResult<Self> {
        let conn = Connection::open(&config.sqlite_path).await?;
        Self::with_connection(conn, &config.table).await
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns an error if the database cannot be created.
    pub async fn open_in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn, &StorageConfig::default().table).await
    }

    /// Open a database at an explicit path with the default table.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub async fn open_path(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        Self::with_connection(conn, &StorageConfig::default().table).await
    }

    async fn with_connection(conn: Connection, table: &str) -> LedgerResult<Self> {
        let table = table.to_string();
        let table_name = table.clone();

        conn.call(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table_name} (
                    key TEXT PRIMARY KEY,
                    body TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );"
            ))?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, table })
    }
}

impl DocumentStorage for SqliteDocumentStorage {
    fn read_document(&self) -> StoreFuture<'_, LedgerResult<Option<String>>> {
        Box::pin(async move {
            let table = self.table.clone();
            let body = self
                .conn
                .call(move |conn| {
                    let body = conn
                        .query_row(
                            &format!("SELECT body FROM {table} WHERE key = ?1"),
                            rusqlite::params![DOCUMENT_KEY],
                            |row| row.get::<_, String>(0),
                        )
                        .optional()?;
                    Ok(body)
                })
                .await?;
            Ok(body)
        })
    }

    fn write_document(&self, body: String) -> StoreFuture<'_, LedgerResult<()>> {
        Box::pin(async move {
            let table = self.table.clone();
            let now_ms = chrono::Utc::now().timestamp_millis();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!(
                            "INSERT INTO {table} (key, body, updated_at)
                             VALUES (?1, ?2, ?3)
                             ON CONFLICT(key) DO UPDATE
                             SET body = excluded.body, updated_at = excluded.updated_at"
                        ),
                        rusqlite::params![DOCUMENT_KEY, body, now_ms],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }
}

/// In-process document storage.
///
/// Writes can be made to fail on demand, which lets callers exercise the
/// store's all-or-nothing behavior.
#[derive(Debug)]
pub struct MemoryDocumentStorage {
    body: Mutex<Option<String>>,
    fail_writes: AtomicBool,
    write_budget: AtomicUsize,
}

impl Default for MemoryDocumentStorage {
    fn default() -> Self {
        Self {
            body: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
            write_budget: AtomicUsize::new(usize::MAX),
        }
    }
}

impl MemoryDocumentStorage {
    /// Create empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage that already holds a document.
    #[must_use]
    pub fn with_document(body: impl Into<String>) -> Self {
        Self {
            body: Mutex::new(Some(body.into())),
            ..Self::default()
        }
    }

    /// Make every following write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Let `writes` more writes succeed, then fail every following one.
    pub fn fail_after_writes(&self, writes: usize) {
        self.write_budget.store(writes, Ordering::SeqCst);
    }

    fn take_write(&self) -> bool {
        if self.fail_writes.load(Ordering::SeqCst) {
            return false;
        }
        self.write_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                left => Some(left - 1),
            })
            .is_ok()
    }

    /// Last written document.
    #[must_use]
    pub fn snapshot(&self) -> Option<String> {
        self.body.lock().ok().and_then(|guard| guard.clone())
    }
}

impl DocumentStorage for MemoryDocumentStorage {
    fn read_document(&self) -> StoreFuture<'_, LedgerResult<Option<String>>> {
        Box::pin(async move { Ok(self.snapshot()) })
    }

    fn write_document(&self, body: String) -> StoreFuture<'_, LedgerResult<()>> {
        Box::pin(async move {
            if !self.take_write() {
                return Err(LedgerError::Io(std::io::Error::other(
                    "document storage is read-only",
                )));
            }
            let mut guard = self
                .body
                .lock()
                .map_err(|_| LedgerError::Io(std::io::Error::other("storage lock poisoned")))?;
            *guard = Some(body);
            Ok(())
        })
    }
}
