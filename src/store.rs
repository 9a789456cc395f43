use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Collection/document store on SQLite.
///
/// Documents are JSON objects addressed by a slash-separated collection path
/// (`users/42/memories`) and a document id, mirroring a Firestore layout.
#[derive(Clone)]
pub struct DocumentStore {
    conn: Arc<Mutex<Connection>>,
}

/// Join path segments into a collection path.
pub fn collection_path(segments: &[&str]) -> String {
    segments.join("/")
}

impl DocumentStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Document store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (collection, id)
            );
            ",
        )
        .context("Failed to create documents table")?;
        Ok(())
    }

    /// Create or replace a document.
    pub async fn set(&self, collection: &str, id: &str, document: &Value) -> Result<()> {
        let data = serde_json::to_string(document)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO documents (collection, id, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection, id)
             DO UPDATE SET data = excluded.data, updated_at = datetime('now')",
            rusqlite::params![collection, id, &data],
        )
        .with_context(|| format!("Failed to write document {collection}/{id}"))?;
        debug!("Stored document {}/{}", collection, id);
        Ok(())
    }

    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().await;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
                rusqlite::params![collection, id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).context("Corrupt document JSON"))
            .transpose()
    }

    /// All documents of a collection, ordered by id.
    pub async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT id, data FROM documents WHERE collection = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(rusqlite::params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, data)| {
                let value = serde_json::from_str(&data)
                    .with_context(|| format!("Corrupt document JSON: {collection}/{id}"))?;
                Ok((id, value))
            })
            .collect()
    }

    /// Append `item` to the array `field` of a document, creating the document
    /// or the field when missing. Runs under the connection lock, so
    /// concurrent appends never lose items.
    pub async fn append_to_array(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        item: Value,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
                rusqlite::params![collection, id],
                |row| row.get(0),
            )
            .optional()?;

        let mut document = match existing {
            Some(data) => serde_json::from_str::<Value>(&data)
                .with_context(|| format!("Corrupt document JSON: {collection}/{id}"))?,
            None => Value::Object(serde_json::Map::new()),
        };

        let object = document
            .as_object_mut()
            .with_context(|| format!("Document {collection}/{id} is not an object"))?;
        let entry = object
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(items) => items.push(item),
            _ => anyhow::bail!("Field '{field}' of {collection}/{id} is not an array"),
        }

        tx.execute(
            "INSERT INTO documents (collection, id, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection, id)
             DO UPDATE SET data = excluded.data, updated_at = datetime('now')",
            rusqlite::params![collection, id, serde_json::to_string(&document)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn count(&self, collection: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT count(*) FROM documents WHERE collection = ?1",
            rusqlite::params![collection],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    #[cfg(test)]
    pub(crate) async fn raw_connection(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
