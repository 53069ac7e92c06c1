use std::path::Path;
use std::time::Duration;

use almanac_core::config::Config;
use almanac_core::error::{AlmanacError, Result};
use almanac_core::types::{now_unix, Document, DocumentSnapshot, FieldUpdates};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use libsql::{Builder, Connection, Database, Row, Rows, TransactionBehavior};
use tracing::warn;

use crate::document::{apply_updates, merge_document, DocumentStore};

fn map_err(e: libsql::Error) -> AlmanacError {
    AlmanacError::Database(e.to_string())
}

/// How long a local connection waits on another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_DB_RETRIES: u32 = 3;

fn is_transient_db_error(err: &AlmanacError) -> bool {
    match err {
        AlmanacError::Database(msg) => {
            msg.contains("database is locked")
                || msg.contains("SQLITE_BUSY")
                || msg.contains("Bad Gateway")
                || msg.contains("Service Unavailable")
                || msg.contains("Gateway Timeout")
                || msg.contains("timed out")
                || msg.contains("STREAM_EXPIRED")
        }
        _ => false,
    }
}

/// Retry a database operation with exponential backoff on transient errors.
async fn with_retry<F, Fut, T>(f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Err(e) if is_transient_db_error(&e) && attempt < MAX_DB_RETRIES => {
                attempt += 1;
                let delay = Duration::from_millis(100 << attempt);
                warn!(error = %e, attempt, "transient database error, retrying");
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

/// Document collections kept as JSON rows in a single libsql table.
pub struct LibsqlDocumentStore {
    db: Database,
    remote: bool,
}

impl LibsqlDocumentStore {
    /// Open the database described by `config`: remote Turso when a URL is
    /// configured, otherwise the local file.
    pub async fn open(config: &Config) -> Result<Self> {
        if config.database.is_remote() {
            Self::new_remote(&config.database.turso_url, &config.database.turso_token).await
        } else {
            Self::new_local(config.database_path()).await
        }
    }

    /// Open a local libsql database at the given file path.
    pub async fn new_local(path: impl AsRef<Path>) -> Result<Self> {
        let db = Builder::new_local(path.as_ref())
            .build()
            .await
            .map_err(map_err)?;
        let store = Self { db, remote: false };
        store.init_tables().await?;
        Ok(store)
    }

    /// Open a remote Turso database.
    pub async fn new_remote(url: &str, token: &str) -> Result<Self> {
        let db = Builder::new_remote(url.to_string(), token.to_string())
            .build()
            .await
            .map_err(map_err)?;
        let store = Self { db, remote: true };
        store.init_tables().await?;
        Ok(store)
    }

    /// Get a fresh connection. For remote databases this opens a new stream;
    /// local connections wait on a busy database instead of failing.
    fn conn(&self) -> Result<Connection> {
        let conn = self.db.connect().map_err(map_err)?;
        if !self.remote {
            conn.busy_timeout(BUSY_TIMEOUT).map_err(map_err)?;
        }
        Ok(conn)
    }

    async fn init_tables(&self) -> Result<()> {
        let conn = self.conn()?;

        if !self.remote {
            // WAL lets an open scan coexist with writers. The pragma answers
            // with the resulting mode, so it goes through query().
            let mut rows = conn
                .query("PRAGMA journal_mode=WAL", ())
                .await
                .map_err(map_err)?;
            while rows.next().await.map_err(map_err)?.is_some() {}
        }

        conn.execute(
                "CREATE TABLE IF NOT EXISTS documents (
                    collection TEXT NOT NULL,
                    id TEXT NOT NULL,
                    data TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (collection, id)
                )",
                (),
            )
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn read(conn: &Connection, collection: &str, id: &str) -> Result<Option<Document>> {
        let mut rows = conn
            .query(
                "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
                libsql::params![collection.to_string(), id.to_string()],
            )
            .await
            .map_err(map_err)?;

        match rows.next().await.map_err(map_err)? {
            Some(row) => {
                let data = row.get::<String>(0).map_err(map_err)?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn write(conn: &Connection, collection: &str, id: &str, data: &Document) -> Result<()> {
        let json = serde_json::to_string(data)?;
        conn.execute(
            "INSERT OR REPLACE INTO documents (collection, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)",
            libsql::params![collection.to_string(), id.to_string(), json, now_unix()],
        )
        .await
        .map_err(map_err)?;
        Ok(())
    }
}

fn decode_row(row: &Row) -> Result<DocumentSnapshot> {
    let id = row.get::<String>(0).map_err(map_err)?;
    let data = row.get::<String>(1).map_err(map_err)?;
    Ok(DocumentSnapshot::new(id, serde_json::from_str(&data)?))
}

async fn next_snapshot(rows: &mut Rows) -> Result<Option<DocumentSnapshot>> {
    match rows.next().await.map_err(map_err)? {
        Some(row) => decode_row(&row).map(Some),
        None => Ok(None),
    }
}

#[async_trait]
impl DocumentStore for LibsqlDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<DocumentSnapshot>> {
        let conn = self.conn()?;
        let data = Self::read(&conn, collection, id).await?;
        Ok(data.map(|data| DocumentSnapshot::new(id, data)))
    }

    async fn set_merge(&self, collection: &str, id: &str, data: Document) -> Result<()> {
        with_retry(|| async {
            let conn = self.conn()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .await
                .map_err(map_err)?;

            let mut document = Self::read(&tx, collection, id).await?.unwrap_or_default();
            merge_document(&mut document, data.clone());
            Self::write(&tx, collection, id, &document).await?;

            tx.commit().await.map_err(map_err)
        })
        .await
    }

    async fn update(&self, collection: &str, id: &str, fields: FieldUpdates) -> Result<bool> {
        with_retry(|| async {
            let conn = self.conn()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .await
                .map_err(map_err)?;

            let Some(mut document) = Self::read(&tx, collection, id).await? else {
                tx.rollback().await.map_err(map_err)?;
                return Ok(false);
            };
            apply_updates(&mut document, fields.clone());
            Self::write(&tx, collection, id, &document).await?;

            tx.commit().await.map_err(map_err)?;
            Ok(true)
        })
        .await
    }

    fn stream<'a>(&'a self, collection: &'a str) -> BoxStream<'a, Result<DocumentSnapshot>> {
        let open = async move {
            let conn = self.conn()?;
            let rows = conn
                .query(
                    "SELECT id, data FROM documents WHERE collection = ?1",
                    libsql::params![collection.to_string()],
                )
                .await
                .map_err(map_err)?;

            // The connection rides along with the cursor so it outlives the scan.
            Ok::<_, AlmanacError>(stream::try_unfold(
                (conn, rows),
                |(conn, mut rows)| async move {
                    let next = next_snapshot(&mut rows).await?;
                    Ok::<_, AlmanacError>(next.map(|snapshot| (snapshot, (conn, rows))))
                },
            ))
        };

        stream::once(open).try_flatten().boxed()
    }
}
