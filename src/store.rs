//! External limit store interface and an in-memory implementation.

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Flat field → value record as read from or written to the store.
pub type Fields = HashMap<String, String>;

/// Narrow interface to the shared key-value store.
///
/// The store is a best-effort cache for endpoint limits shared between
/// instances, not a source of truth. Implementations should map connection
/// failures to [`StoreError::Unavailable`].
#[async_trait]
pub trait LimitStore: Send + Sync + std::fmt::Debug {
    /// Read every field of the record at `key`. A missing record reads as empty.
    async fn bulk_read(&self, key: &str) -> Result<Fields, StoreError>;

    /// Merge `fields` into the record at `key`.
    ///
    /// With `ttl` set, the whole record expires unless written again in time.
    async fn bulk_write(&self, key: &str, fields: Fields, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Create an empty record at `key` if none exists. Idempotent.
    async fn ensure_exists(&self, key: &str) -> Result<(), StoreError>;

    /// Append one entry to the log at `log_key`.
    async fn append(&self, log_key: &str, fields: Fields) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Record {
    fields: Fields,
    expires_at: Option<Instant>,
}

impl Record {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, Record>,
    logs: HashMap<String, Vec<Fields>>,
}

/// Simple in-memory limit store.
///
/// Useful for single-process deployments that still want the dump/load cycle,
/// and for tests: [`InMemoryLimitStore::set_unavailable`] makes every call fail.
#[derive(Default, Clone, Debug)]
pub struct InMemoryLimitStore {
    inner: Arc<Mutex<Inner>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryLimitStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose record at `key` already holds `fields`.
    pub fn with_record<I, K, V>(key: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        store.lock().records.insert(
            key.to_string(),
            Record { fields: fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect(), expires_at: None },
        );
        store
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`] (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// True if a live (unexpired) record exists at `key`.
    pub fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock().records.get(key).is_some_and(|r| !r.expired(now))
    }

    /// Entries appended to `log_key`, oldest first.
    pub fn log(&self, log_key: &str) -> Vec<Fields> {
        self.lock().logs.get(log_key).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LimitStore for InMemoryLimitStore {
    async fn bulk_read(&self, key: &str) -> Result<Fields, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut guard = self.lock();
        if guard.records.get(key).is_some_and(|r| r.expired(now)) {
            guard.records.remove(key);
        }
        Ok(guard.records.get(key).map(|r| r.fields.clone()).unwrap_or_default())
    }

    async fn bulk_write(&self, key: &str, fields: Fields, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut guard = self.lock();
        let record = guard.records.entry(key.to_string()).or_default();
        if record.expired(now) {
            *record = Record::default();
        }
        record.fields.extend(fields);
        if let Some(ttl) = ttl {
            record.expires_at = now.checked_add(ttl);
        }
        Ok(())
    }

    async fn ensure_exists(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut guard = self.lock();
        let record = guard.records.entry(key.to_string()).or_default();
        if record.expired(now) {
            *record = Record::default();
        }
        Ok(())
    }

    async fn append(&self, log_key: &str, fields: Fields) -> Result<(), StoreError> {
        self.check()?;
        self.lock().logs.entry(log_key.to_string()).or_default().push(fields);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn missing_record_reads_empty() {
        let store = InMemoryLimitStore::new();
        assert!(store.bulk_read("ratelimits").await.unwrap().is_empty());
        assert!(!store.exists("ratelimits"));
    }

    #[tokio::test]
    async fn writes_merge_fields() {
        let store = InMemoryLimitStore::new();
        store.bulk_write("k", fields(&[("/a", "1"), ("/b", "2")]), None).await.unwrap();
        store.bulk_write("k", fields(&[("/b", "3")]), None).await.unwrap();
        assert_eq!(store.bulk_read("k").await.unwrap(), fields(&[("/a", "1"), ("/b", "3")]));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_record() {
        let store = InMemoryLimitStore::new();
        store.bulk_write("k", fields(&[("/a", "1")]), Some(Duration::from_secs(30))).await.unwrap();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(store.bulk_read("k").await.unwrap().len(), 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.bulk_read("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ensure_exists_is_idempotent_and_keeps_fields() {
        let store = InMemoryLimitStore::with_record("k", [("/a", "4")]);
        store.ensure_exists("k").await.unwrap();
        store.ensure_exists("other").await.unwrap();
        assert!(store.exists("other"));
        assert_eq!(store.bulk_read("k").await.unwrap(), fields(&[("/a", "4")]));
    }

    #[tokio::test]
    async fn append_keeps_order() {
        let store = InMemoryLimitStore::new();
        store.append("log", fields(&[("n", "1")])).await.unwrap();
        store.append("log", fields(&[("n", "2")])).await.unwrap();
        let log = store.log("log");
        assert_eq!(log.len(), 2);
        assert_eq!(log[1]["n"], "2");
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryLimitStore::new();
        store.set_unavailable(true);
        assert!(store.bulk_read("k").await.unwrap_err().is_unavailable());
        assert!(store.bulk_write("k", Fields::new(), None).await.is_err());
        assert!(store.ensure_exists("k").await.is_err());
        assert!(store.append("log", Fields::new()).await.is_err());
        store.set_unavailable(false);
        assert!(store.bulk_read("k").await.is_ok());
    }
}
