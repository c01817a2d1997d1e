//! etcd limit store for `floodgate` (companion crate).
//! Bring your own `etcd_client::Client`; enable the `etcd-client` feature.
//!
//! Layout under a namespace `ns`:
//!
//! | floodgate call | etcd keys |
//! |---|---|
//! | record `key`, field `f` | `ns/key/f` (value is the raw string) |
//! | `ensure_exists(key)` | `ns/key` (empty marker, created once) |
//! | `append(log_key, ..)` | `ns/log_key/<nanos>-<uuid>` (JSON object) |
//!
//! A record TTL is applied as a lease shared by every field written in the
//! same call.

use floodgate::store::Fields;
use floodgate::StoreError;

/// Errors raised while configuring an etcd store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EtcdStoreError {
    /// Namespace was empty after trimming.
    #[error("namespace cannot be empty")]
    EmptyNamespace,
    /// Namespace contained control characters.
    #[error("namespace cannot contain control characters")]
    ControlCharacters,
}

/// Maximum operations etcd accepts in one transaction by default.
pub const MAX_TXN_OPS: usize = 128;

/// Key layout for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    namespace: String,
}

impl KeyLayout {
    /// Validate and normalize `namespace`: whitespace and trailing slashes are trimmed.
    pub fn new(namespace: impl Into<String>) -> Result<Self, EtcdStoreError> {
        let namespace: String = namespace.into();
        let namespace = namespace.trim().trim_end_matches('/').to_string();
        if namespace.is_empty() {
            return Err(EtcdStoreError::EmptyNamespace);
        }
        if namespace.chars().any(char::is_control) {
            return Err(EtcdStoreError::ControlCharacters);
        }
        Ok(Self { namespace })
    }

    /// The normalized namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Marker key for a record.
    pub fn record(&self, key: &str) -> String {
        format!("{}/{}", self.namespace, key)
    }

    /// Prefix shared by every field of a record.
    pub fn field_prefix(&self, key: &str) -> String {
        format!("{}/{}/", self.namespace, key)
    }

    /// Key of one field.
    pub fn field(&self, key: &str, field: &str) -> String {
        format!("{}{}", self.field_prefix(key), field)
    }

    /// Fresh, time-ordered key for a log entry.
    pub fn log_entry(&self, log_key: &str) -> String {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("{}/{}/{:020}-{}", self.namespace, log_key, nanos, uuid::Uuid::new_v4())
    }

    /// Recover the field name from a full etcd key, if it belongs to `key`.
    pub fn field_name<'a>(&self, key: &str, full: &'a str) -> Option<&'a str> {
        full.strip_prefix(&self.field_prefix(key)).filter(|name| !name.is_empty())
    }
}

/// Encode a log entry as a JSON object.
pub fn log_entry_json(fields: &Fields) -> Result<String, StoreError> {
    serde_json::to_string(fields).map_err(|e| StoreError::Backend(format!("encoding log entry: {e}")))
}

/// Lease TTL in whole seconds; etcd's minimum is one second.
pub fn lease_seconds(ttl: std::time::Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

#[cfg(feature = "etcd-client")]
pub use client::EtcdLimitStore;

#[cfg(feature = "etcd-client")]
mod client {
    use super::{lease_seconds, log_entry_json, KeyLayout, MAX_TXN_OPS};
    use async_trait::async_trait;
    use etcd_client::{Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp};
    use floodgate::store::{Fields, LimitStore};
    use floodgate::StoreError;
    use std::time::Duration;

    /// [`LimitStore`] backed by etcd.
    #[derive(Clone)]
    pub struct EtcdLimitStore {
        layout: KeyLayout,
        client: etcd_client::Client,
    }

    impl std::fmt::Debug for EtcdLimitStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("EtcdLimitStore")
                .field("namespace", &self.layout.namespace())
                .field("client", &"<etcd_client::Client>")
                .finish()
        }
    }

    impl EtcdLimitStore {
        /// Create a store using an existing etcd client; keys will live under `namespace/`.
        ///
        /// # Errors
        /// Returns `Err` if the namespace is empty or contains control characters.
        pub fn new(
            namespace: impl Into<String>,
            client: etcd_client::Client,
        ) -> Result<Self, super::EtcdStoreError> {
            Ok(Self { layout: KeyLayout::new(namespace)?, client })
        }

        /// Key layout in use.
        pub fn layout(&self) -> &KeyLayout {
            &self.layout
        }
    }

    fn map_err(e: etcd_client::Error) -> StoreError {
        match e {
            etcd_client::Error::IoError(_) | etcd_client::Error::TransportError(_) => {
                StoreError::Unavailable(e.to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }

    #[async_trait]
    impl LimitStore for EtcdLimitStore {
        async fn bulk_read(&self, key: &str) -> Result<Fields, StoreError> {
            let mut client = self.client.clone();
            let prefix = self.layout.field_prefix(key);
            let resp = client.get(prefix, Some(GetOptions::new().with_prefix())).await.map_err(map_err)?;
            let mut fields = Fields::new();
            for kv in resp.kvs() {
                let (Ok(full), Ok(value)) = (kv.key_str(), kv.value_str()) else {
                    tracing::warn!(target: "floodgate::etcd", key, "skipping non-utf8 field");
                    continue;
                };
                if let Some(name) = self.layout.field_name(key, full) {
                    fields.insert(name.to_string(), value.to_string());
                }
            }
            Ok(fields)
        }

        async fn bulk_write(&self, key: &str, fields: Fields, ttl: Option<Duration>) -> Result<(), StoreError> {
            if fields.is_empty() {
                return Ok(());
            }
            let mut client = self.client.clone();
            let options = match ttl {
                Some(ttl) => {
                    let lease = client.lease_grant(lease_seconds(ttl), None).await.map_err(map_err)?;
                    Some(PutOptions::new().with_lease(lease.id()))
                }
                None => None,
            };
            let ops: Vec<TxnOp> = fields
                .into_iter()
                .map(|(field, value)| TxnOp::put(self.layout.field(key, &field), value, options.clone()))
                .collect();
            let mut ops = ops.into_iter().peekable();
            while ops.peek().is_some() {
                let batch: Vec<TxnOp> = ops.by_ref().take(MAX_TXN_OPS).collect();
                client.txn(Txn::new().and_then(batch)).await.map_err(map_err)?;
            }
            Ok(())
        }

        async fn ensure_exists(&self, key: &str) -> Result<(), StoreError> {
            let mut client = self.client.clone();
            let marker = self.layout.record(key);
            let txn = Txn::new()
                .when([Compare::create_revision(marker.clone(), CompareOp::Equal, 0)])
                .and_then([TxnOp::put(marker, "", None)]);
            let resp = client.txn(txn).await.map_err(map_err)?;
            if resp.succeeded() {
                tracing::info!(target: "floodgate::etcd", key, "created limits record");
            }
            Ok(())
        }

        async fn append(&self, log_key: &str, fields: Fields) -> Result<(), StoreError> {
            let mut client = self.client.clone();
            let entry = self.layout.log_entry(log_key);
            let value = log_entry_json(&fields)?;
            match client.put(entry.clone(), value, None).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    tracing::warn!(
                        target: "floodgate::etcd",
                        key = %entry,
                        error = %e,
                        "failed to write audit entry to etcd"
                    );
                    Err(map_err(e))
                }
            }
        }
    }
}
