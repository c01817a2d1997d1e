#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Adaptive per-client admission control for async Rust services.
//!
//! Every `(client address, endpoint)` pair gets its own token bucket with a
//! capacity of one permit, refilled at the endpoint's configured rate. When
//! enough distinct clients are denied on the same endpoint within a window,
//! the endpoint's rate is raised (up to a global ceiling) and every client
//! starts over at the new rate. Endpoint limits can be shared between
//! instances through any [`LimitStore`].
//!
//! ## Features
//!
//! - **Token buckets** per client and endpoint, with a bounded wait
//! - **Adaptive limits** driven by distinct denied addresses
//! - **Idle eviction** so the registry stays bounded
//! - **Store sync**: bounded-parallel startup load, periodic batched dump
//! - **Tower middleware** that maps denials to `429`
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::{AdmissionEngine, Config, InMemoryLimitStore};
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = serde_json::from_str(
//!         r#"{ "default_rps": 10, "adaptive": { "enabled": true }, "store": { "enabled": true } }"#,
//!     )
//!     .unwrap();
//!
//!     let (engine, tasks) = AdmissionEngine::builder(config.resolve())
//!         .store(Arc::new(InMemoryLimitStore::new()))
//!         .start()
//!         .await;
//!
//!     let decision = engine.admit(IpAddr::V4(Ipv4Addr::LOCALHOST), "/checkout").await;
//!     assert!(decision.is_allowed());
//!
//!     tasks.shutdown().await;
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod exceedance;
pub mod limits;
pub mod middleware;
pub mod policy;
pub mod prelude;
pub mod registry;
pub mod snapshot;
pub mod store;
pub mod sync;
pub mod tasks;
pub mod token_bucket;

// Re-exports
pub use config::{Config, Settings};
pub use controller::{AdaptiveController, LimitChange};
pub use engine::{Admission, AdmissionEngine, EngineBuilder};
pub use error::{AdmissionError, MalformedPersistedValue, StoreError, UnresolvedClientIdentity};
pub use exceedance::ExceedanceTracker;
pub use limits::LimitTable;
pub use middleware::{AdmissionLayer, AdmissionService, ClientIdentity, IdentifyRequest};
pub use policy::{AdaptivePolicy, PolicyHandle};
pub use registry::{ClientKey, ClientRegistry};
pub use snapshot::EngineSnapshot;
pub use store::{Fields, InMemoryLimitStore, LimitStore};
pub use tasks::{BackgroundTasks, ShutdownSignal};
pub use token_bucket::{Acquire, TokenBucket};
