//! Connection pool: given a query, keeps a live connection open to every
//! matching peer, reacting to the Kontrol client's watch stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::identity::{Query, RegistryEntry};
use crate::kontrol_client::{KontrolClient, WatchEvent, WatchHandle};
use crate::peer::{Connection, Kite};
use crate::transport::websocket::backoff_sleep;

struct Entry {
    conn: Arc<RwLock<Option<Arc<Connection>>>>,
    cancel: Arc<AtomicBool>,
}

/// Maintains a live connection to every peer currently matching a query.
/// Does not itself retry application-level calls, only the transport-level
/// reconnect is its concern.
pub struct Pool {
    entries: Arc<DashMap<Uuid, Entry>>,
    _watch: Arc<RwLock<WatchHandle>>,
}

impl Pool {
    pub async fn new(kite: Arc<Kite>, kontrol: Arc<KontrolClient>, query: Query) -> Self {
        let (tx, mut rx) = mpsc::channel(256);
        let watch = kontrol
            .watch_kites(query.clone(), tx.clone())
            .await
            .unwrap_or(WatchHandle::closed());
        let watch = Arc::new(RwLock::new(watch));

        let entries: Arc<DashMap<Uuid, Entry>> = Arc::new(DashMap::new());
        let task_entries = Arc::clone(&entries);
        let task_watch = Arc::clone(&watch);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    WatchEvent::Register(entry, _token) => {
                        spawn_dialer(Arc::clone(&kite), Arc::clone(&task_entries), entry);
                    }
                    WatchEvent::Deregister(identity) => {
                        if let Some((_, entry)) = task_entries.remove(&identity.id) {
                            entry.cancel.store(true, Ordering::Relaxed);
                            if let Some(conn) = entry.conn.read().await.clone() {
                                conn.close().await;
                            }
                        }
                    }
                    WatchEvent::Expired => {
                        warn!(query = ?query, "watch expired, reopening");
                        match kontrol.watch_kites(query.clone(), tx.clone()).await {
                            Ok(new_watch) => *task_watch.write().await = new_watch,
                            Err(e) => warn!(query = ?query, "failed to reopen watch: {e}"),
                        }
                    }
                }
            }
        });

        Self {
            entries,
            _watch: watch,
        }
    }

    /// Returns any one ready peer connection, or `None` if nothing currently
    /// matches and is connected.
    pub async fn get(&self) -> Option<Arc<Connection>> {
        for entry in self.entries.iter() {
            if let Some(conn) = entry.conn.read().await.clone() {
                if !conn.is_closed() {
                    return Some(conn);
                }
            }
        }
        None
    }

    /// Exact at the time of observation; entries can change concurrently
    /// with the count being read.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn spawn_dialer(kite: Arc<Kite>, entries: Arc<DashMap<Uuid, Entry>>, entry: RegistryEntry) {
    let cancel = Arc::new(AtomicBool::new(false));
    let conn_slot = Arc::new(RwLock::new(None));
    entries.insert(
        entry.identity.id,
        Entry {
            conn: Arc::clone(&conn_slot),
            cancel: Arc::clone(&cancel),
        },
    );

    tokio::spawn(async move {
        let url = entry.url.clone();
        let mut attempt = 0u32;
        while !cancel.load(Ordering::Relaxed) {
            match kite.dial(&url).await {
                Ok(conn) => {
                    attempt = 0;
                    *conn_slot.write().await = Some(Arc::clone(&conn));
                    while !conn.is_closed() && !cancel.load(Ordering::Relaxed) {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    *conn_slot.write().await = None;
                }
                Err(e) => {
                    warn!(peer = %entry.identity.path(), "pool dial failed: {e}");
                }
            }
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            attempt += 1;
            backoff_sleep(attempt, Duration::from_millis(500), Duration::from_secs(30)).await;
        }
    });
}
