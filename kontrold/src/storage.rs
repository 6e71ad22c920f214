//! Storage backend contract and the in-memory reference implementation.
//!
//! Kontrol's data plane is deliberately pluggable. Production deployments
//! would back this with etcd or Postgres, satisfying the same `Backend`
//! trait. Only the in-memory backend ships here; it is correct and
//! sufficient for a single kontrold instance, and is what every test in
//! this crate runs against.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use kite::identity::{Identity, Query, RegistryEntry};
use tokio::sync::broadcast;

use crate::error::KontrolError;

pub type Result<T> = std::result::Result<T, KontrolError>;

#[derive(Debug, Clone)]
pub enum Event {
    Register(RegistryEntry),
    Deregister(Identity),
}

/// Abstract contract a storage backend satisfies. `watch` returns the
/// current snapshot plus a channel of subsequent events; an unrecoverable
/// gap in the event stream is signaled by the channel closing, and callers
/// must resync via a fresh `list`.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn upsert(&self, entry: RegistryEntry, ttl: Duration) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn list(&self, query: &Query) -> Result<Vec<RegistryEntry>>;
    fn subscribe(&self) -> broadcast::Receiver<Event>;
    /// Removes entries whose TTL has lapsed without a heartbeat, emitting a
    /// `Deregister` event for each.
    async fn reap_expired(&self) -> Vec<Identity>;
}

struct Slot {
    entry: RegistryEntry,
    expires_at: Instant,
}

/// In-memory backend (spec SUPPLEMENT): one live entry per `(path, id)`,
/// absolute expiry recomputed on every heartbeat rather than a sliding
/// window, so a kite that misses exactly one heartbeat tick is not
/// punished for clock jitter between the client and this process.
pub struct MemBackend {
    entries: DashMap<String, Slot>,
    tx: broadcast::Sender<Event>,
    revision: AtomicU64,
}

impl MemBackend {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            entries: DashMap::new(),
            tx,
            revision: AtomicU64::new(0),
        }
    }

    pub fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemBackend {
    async fn upsert(&self, entry: RegistryEntry, ttl: Duration) -> Result<()> {
        let path = entry.identity.path();
        self.entries.insert(
            path,
            Slot {
                entry: entry.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        let _ = self.tx.send(Event::Register(entry));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if let Some((_, slot)) = self.entries.remove(path) {
            let _ = self.tx.send(Event::Deregister(slot.entry.identity));
        }
        Ok(())
    }

    async fn list(&self, query: &Query) -> Result<Vec<RegistryEntry>> {
        if !query.validate() {
            return Err(KontrolError::InvalidQuery(
                "query fields must be set left-to-right with no gaps".into(),
            ));
        }
        Ok(self
            .entries
            .iter()
            .filter(|e| query.matches(&e.entry.identity))
            .map(|e| e.entry.clone())
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    async fn reap_expired(&self) -> Vec<Identity> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key().clone())
            .collect();

        let mut identities = Vec::with_capacity(expired.len());
        for path in expired {
            if let Some((_, slot)) = self.entries.remove(&path) {
                identities.push(slot.entry.identity.clone());
                let _ = self.tx.send(Event::Deregister(slot.entry.identity));
            }
        }
        identities
    }
}

/// Spawns the background task that periodically reaps TTL-expired entries.
/// An entry whose TTL expires with no miss is refreshed from the next
/// heartbeat; the complement, reaping, runs here.
pub fn spawn_reaper(backend: Arc<dyn Backend>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let reaped = backend.reap_expired().await;
            if !reaped.is_empty() {
                tracing::info!(count = reaped.len(), "reaped expired registry entries");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_entry(name: &str) -> RegistryEntry {
        RegistryEntry {
            identity: Identity {
                username: "devuser".into(),
                environment: "dev".into(),
                name: name.into(),
                version: "0.0.1".into(),
                region: "default".into(),
                hostname: "box1".into(),
                id: Uuid::new_v4(),
            },
            url: "ws://box1:1234/kite".into(),
            issued_at: 0,
            heartbeat_url: "http://kontrold/heartbeat".into(),
        }
    }

    #[tokio::test]
    async fn upsert_then_list_by_name() {
        let backend = MemBackend::new();
        backend.upsert(sample_entry("adder"), Duration::from_secs(30)).await.unwrap();
        let found = backend.list(&Query::by_name("adder")).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let backend = MemBackend::new();
        let entry = sample_entry("adder");
        let path = entry.identity.path();
        backend.upsert(entry, Duration::from_secs(30)).await.unwrap();
        backend.delete(&path).await.unwrap();
        let found = backend.list(&Query::by_name("adder")).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn reap_removes_expired_entries() {
        let backend = MemBackend::new();
        backend.upsert(sample_entry("adder"), Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = backend.reap_expired().await;
        assert_eq!(reaped.len(), 1);
        assert!(backend.list(&Query::by_name("adder")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_query_is_rejected() {
        let backend = MemBackend::new();
        let query = Query {
            environment: Some("dev".into()),
            ..Default::default()
        };
        assert!(backend.list(&query).await.is_err());
    }
}
