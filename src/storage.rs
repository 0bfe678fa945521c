//! Remote storage collaborators.
//!
//! Two seams: a blob store (containers of keyed byte objects) and a table
//! store (entities addressed by partition and row key). Both may fail at any
//! time; callers treat every error as recoverable.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use crate::now_s;

pub trait BlobStore: Send + Sync {
    /// Store `data` under `container/key`, replacing any previous object.
    /// Returns a location reference for the stored object.
    fn put(&self, container: &str, key: &str, data: &[u8]) -> Result<String>;

    fn get(&self, container: &str, key: &str) -> Result<Vec<u8>>;

    /// Keys in `container`, sorted.
    fn list(&self, container: &str) -> Result<Vec<String>>;

    /// Cheap reachability check bounded by `timeout`.
    fn ping(&self, timeout: Duration) -> Result<()>;
}

/// A table row. Extra properties are flattened next to the keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableEntity {
    #[serde(rename = "PartitionKey")]
    pub partition_key: String,
    #[serde(rename = "RowKey")]
    pub row_key: String,
    #[serde(flatten)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

pub trait TableStore: Send + Sync {
    fn upsert(&self, table: &str, entity: &TableEntity) -> Result<()>;

    fn lookup(&self, table: &str, partition_key: &str, row_key: &str) -> Result<Option<TableEntity>>;
}

/// Run `f` on a helper thread and give up after `timeout`.
///
/// The helper is detached on timeout; its result is discarded.
pub fn run_with_timeout<T, F>(timeout: Duration, what: &str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            Err(anyhow!("{} timed out after {:?}", what, timeout))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(anyhow!("{} worker panicked", what)),
    }
}

// -------------------- Filesystem blob store --------------------

/// Blob store rooted at a directory (typically a mounted share). Containers
/// are sub-directories.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, container: &str, key: &str) -> Result<PathBuf> {
        validate_segment(container)?;
        validate_segment(key)?;
        Ok(self.root.join(container).join(key))
    }
}

/// A single path component: no separators, not empty, not `.` or `..`.
pub(crate) fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
    {
        return Err(anyhow!("invalid blob path segment '{}'", segment));
    }
    Ok(())
}

impl BlobStore for FsBlobStore {
    fn put(&self, container: &str, key: &str, data: &[u8]) -> Result<String> {
        let path = self.object_path(container, key)?;
        let dir = self.root.join(container);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create container {}", dir.display()))?;
        let partial = dir.join(format!(".{}.partial", key));
        std::fs::write(&partial, data)
            .with_context(|| format!("write blob {}", partial.display()))?;
        std::fs::rename(&partial, &path)
            .with_context(|| format!("commit blob {}", path.display()))?;
        Ok(path.display().to_string())
    }

    fn get(&self, container: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(container, key)?;
        std::fs::read(&path).with_context(|| format!("read blob {}", path.display()))
    }

    fn list(&self, container: &str) -> Result<Vec<String>> {
        validate_segment(container)?;
        let dir = self.root.join(container);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("list container {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn ping(&self, timeout: Duration) -> Result<()> {
        let root = self.root.clone();
        run_with_timeout(timeout, "blob store ping", move || {
            let meta = std::fs::metadata(&root)
                .with_context(|| format!("storage root {} unavailable", root.display()))?;
            if !meta.is_dir() {
                return Err(anyhow!("storage root {} is not a directory", root.display()));
            }
            Ok(())
        })
    }
}

// -------------------- SQLite table store --------------------

pub struct SqliteTableStore {
    conn: Mutex<Connection>,
}

impl SqliteTableStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("table store lock poisoned"))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS entities (
              table_name TEXT NOT NULL,
              partition_key TEXT NOT NULL,
              row_key TEXT NOT NULL,
              properties_json TEXT NOT NULL,
              updated_at INTEGER NOT NULL,
              PRIMARY KEY (table_name, partition_key, row_key)
            );
            "#,
        )?;
        Ok(())
    }
}

impl TableStore for SqliteTableStore {
    fn upsert(&self, table: &str, entity: &TableEntity) -> Result<()> {
        let properties_json = serde_json::to_string(&entity.properties)?;
        let updated_at = now_s()? as i64;
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("table store lock poisoned"))?;
        conn.execute(
            r#"
            INSERT INTO entities(table_name, partition_key, row_key, properties_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(table_name, partition_key, row_key)
            DO UPDATE SET properties_json = excluded.properties_json,
                          updated_at = excluded.updated_at
            "#,
            params![
                table,
                entity.partition_key,
                entity.row_key,
                properties_json,
                updated_at
            ],
        )?;
        Ok(())
    }

    fn lookup(&self, table: &str, partition_key: &str, row_key: &str) -> Result<Option<TableEntity>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("table store lock poisoned"))?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT properties_json FROM entities WHERE table_name = ?1 AND partition_key = ?2 AND row_key = ?3",
                params![table, partition_key, row_key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(TableEntity {
                partition_key: partition_key.to_string(),
                row_key: row_key.to_string(),
                properties: serde_json::from_str(&raw)?,
            })),
            None => Ok(None),
        }
    }
}

// -------------------- In-memory stores --------------------

#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, container: &str, key: &str, data: &[u8]) -> Result<String> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        objects.insert((container.to_string(), key.to_string()), data.to_vec());
        Ok(format!("memory://{}/{}", container, key))
    }

    fn get(&self, container: &str, key: &str) -> Result<Vec<u8>> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        objects
            .get(&(container.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("blob {}/{} not found", container, key))
    }

    fn list(&self, container: &str) -> Result<Vec<String>> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        Ok(objects
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, k)| k.clone())
            .collect())
    }

    fn ping(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryTableStore {
    rows: Mutex<HashMap<(String, String, String), TableEntity>>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TableStore for InMemoryTableStore {
    fn upsert(&self, table: &str, entity: &TableEntity) -> Result<()> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| anyhow!("table store lock poisoned"))?;
        rows.insert(
            (
                table.to_string(),
                entity.partition_key.clone(),
                entity.row_key.clone(),
            ),
            entity.clone(),
        );
        Ok(())
    }

    fn lookup(&self, table: &str, partition_key: &str, row_key: &str) -> Result<Option<TableEntity>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| anyhow!("table store lock poisoned"))?;
        Ok(rows
            .get(&(
                table.to_string(),
                partition_key.to_string(),
                row_key.to_string(),
            ))
            .cloned())
    }
}
