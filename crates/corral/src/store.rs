//! Persistence adapter for host records.
//!
//! A narrow sink: the core writes host rows on registration and heartbeat
//! samples as they arrive, and never reads any of it back - the in-memory
//! registry is authoritative for dispatch. Writes flow through a bounded
//! channel to a background writer so a slow or failing store can never block
//! the receive loop; failures are logged and swallowed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use corralproto::HostRegistration;
use rusqlite::{params, Connection};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Operations the core invokes on the external store.
pub trait HostStore: Send + Sync + 'static {
    /// Write or refresh the full host row. Status becomes ONLINE and
    /// `last_heartbeat` becomes now.
    fn upsert_host(&self, registration: &HostRegistration) -> Result<()>;

    /// Record a heartbeat sample and refresh the host row's availability.
    fn record_heartbeat(
        &self,
        host_id: &str,
        available_cpus: u32,
        available_memory_mb: u64,
        available_disk_mb: u64,
    ) -> Result<()>;
}

enum StoreOp {
    UpsertHost(HostRegistration),
    Heartbeat {
        host_id: String,
        available_cpus: u32,
        available_memory_mb: u64,
        available_disk_mb: u64,
    },
}

/// Fire-and-forget handle the sessions write through.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreOp>,
}

impl StoreHandle {
    pub fn upsert_host(&self, registration: &HostRegistration) {
        self.enqueue(StoreOp::UpsertHost(registration.clone()));
    }

    pub fn record_heartbeat(
        &self,
        host_id: &str,
        available_cpus: u32,
        available_memory_mb: u64,
        available_disk_mb: u64,
    ) {
        self.enqueue(StoreOp::Heartbeat {
            host_id: host_id.to_string(),
            available_cpus,
            available_memory_mb,
            available_disk_mb,
        });
    }

    fn enqueue(&self, op: StoreOp) {
        if self.tx.try_send(op).is_err() {
            // Persistence is observational; dropping a sample is better than
            // stalling the receive loop.
            warn!("host store queue unavailable, dropping write");
        }
    }
}

/// Spawn the background writer draining store operations.
///
/// Store calls run on the blocking pool; the writer applies operations in
/// order and logs failures without propagating them.
pub fn spawn_store_writer(
    store: Arc<dyn HostStore>,
    capacity: usize,
) -> (StoreHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            let store = store.clone();
            match tokio::task::spawn_blocking(move || apply(&*store, op)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("host store write failed: {e:#}"),
                Err(e) => warn!("host store writer task failed: {e}"),
            }
        }
    });
    (StoreHandle { tx }, handle)
}

fn apply(store: &dyn HostStore, op: StoreOp) -> Result<()> {
    match op {
        StoreOp::UpsertHost(registration) => store.upsert_host(&registration),
        StoreOp::Heartbeat {
            host_id,
            available_cpus,
            available_memory_mb,
            available_disk_mb,
        } => store.record_heartbeat(
            &host_id,
            available_cpus,
            available_memory_mb,
            available_disk_mb,
        ),
    }
}

/// Sqlite-backed host store with a connection-per-call pattern.
pub struct SqliteStore {
    path: PathBuf,
    /// For in-memory databases we keep a persistent connection, since each
    /// new in-memory connection creates a fresh database.
    memory_conn: Option<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open the database at `path`, creating parent directories and the
    /// schema as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            path,
            memory_conn: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            memory_conn: Some(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        if let Some(ref mutex) = self.memory_conn {
            let conn = mutex.lock().unwrap();
            f(&conn)
        } else {
            let conn = Connection::open(&self.path)?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )?;
            f(&conn)
        }
    }

    fn init_schema(&self) -> Result<()> {
        if self.memory_conn.is_some() {
            return Ok(());
        }
        self.with_conn(|conn| {
            conn.execute_batch(include_str!("schema.sql"))?;
            Ok(())
        })
    }
}

impl HostStore for SqliteStore {
    fn upsert_host(&self, registration: &HostRegistration) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let base_images = serde_json::to_string(&registration.base_images)?;
        let source_vms = serde_json::to_string(&registration.source_vms)?;
        let bridges = serde_json::to_string(&registration.bridges)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO hosts (
                     host_id, hostname, version,
                     total_cpus, total_memory_mb, total_disk_mb,
                     available_cpus, available_memory_mb, available_disk_mb,
                     base_images, source_vms, bridges,
                     status, last_heartbeat, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'ONLINE', ?13, ?13, ?13)
                 ON CONFLICT(host_id) DO UPDATE SET
                     hostname = excluded.hostname,
                     version = excluded.version,
                     total_cpus = excluded.total_cpus,
                     total_memory_mb = excluded.total_memory_mb,
                     total_disk_mb = excluded.total_disk_mb,
                     available_cpus = excluded.available_cpus,
                     available_memory_mb = excluded.available_memory_mb,
                     available_disk_mb = excluded.available_disk_mb,
                     base_images = excluded.base_images,
                     source_vms = excluded.source_vms,
                     bridges = excluded.bridges,
                     status = 'ONLINE',
                     last_heartbeat = excluded.last_heartbeat,
                     updated_at = excluded.updated_at",
                params![
                    registration.host_id,
                    registration.hostname,
                    registration.version,
                    registration.total_cpus,
                    registration.total_memory_mb,
                    registration.total_disk_mb,
                    registration.available_cpus,
                    registration.available_memory_mb,
                    registration.available_disk_mb,
                    base_images,
                    source_vms,
                    bridges,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    fn record_heartbeat(
        &self,
        host_id: &str,
        available_cpus: u32,
        available_memory_mb: u64,
        available_disk_mb: u64,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE hosts SET
                     available_cpus = ?2,
                     available_memory_mb = ?3,
                     available_disk_mb = ?4,
                     status = 'ONLINE',
                     last_heartbeat = ?5,
                     updated_at = ?5
                 WHERE host_id = ?1",
                params![host_id, available_cpus, available_memory_mb, available_disk_mb, now],
            )?;
            conn.execute(
                "INSERT INTO heartbeats (
                     host_id, available_cpus, available_memory_mb, available_disk_mb, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![host_id, available_cpus, available_memory_mb, available_disk_mb, now],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registration(host_id: &str) -> HostRegistration {
        HostRegistration {
            host_id: host_id.to_string(),
            hostname: format!("{host_id}.example"),
            version: "0.1.0".to_string(),
            total_cpus: 8,
            total_memory_mb: 32_768,
            total_disk_mb: 500_000,
            available_cpus: 6,
            available_memory_mb: 24_000,
            available_disk_mb: 400_000,
            base_images: vec!["ubuntu-22.04".to_string()],
            source_vms: vec![],
            bridges: vec![],
        }
    }

    #[test]
    fn upsert_inserts_then_updates() {
        let store = SqliteStore::open_memory().unwrap();
        store.upsert_host(&registration("h1")).unwrap();

        let mut updated = registration("h1");
        updated.available_cpus = 2;
        store.upsert_host(&updated).unwrap();

        let (count, cpus): (i64, u32) = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), MIN(available_cpus) FROM hosts WHERE host_id = 'h1'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(cpus, 2);
    }

    #[test]
    fn heartbeats_accumulate_samples() {
        let store = SqliteStore::open_memory().unwrap();
        store.upsert_host(&registration("h1")).unwrap();
        store.record_heartbeat("h1", 4, 16_000, 300_000).unwrap();
        store.record_heartbeat("h1", 3, 15_000, 299_000).unwrap();

        let samples: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM heartbeats WHERE host_id = 'h1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(samples, 2);

        let cpus: u32 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT available_cpus FROM hosts WHERE host_id = 'h1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(cpus, 3);
    }

    #[tokio::test]
    async fn writer_drains_operations() {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let (handle, writer) = spawn_store_writer(store.clone(), 16);

        handle.upsert_host(&registration("h1"));
        handle.record_heartbeat("h1", 5, 20_000, 350_000);
        drop(handle);
        writer.await.unwrap();

        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM hosts", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
