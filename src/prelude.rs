//! Convenient re-exports for common Floodgate types.
pub use crate::{
    config::{Config, Settings},
    engine::{Admission, AdmissionEngine},
    error::{AdmissionError, StoreError, UnresolvedClientIdentity},
    middleware::{AdmissionLayer, ClientIdentity, IdentifyRequest},
    policy::AdaptivePolicy,
    store::{InMemoryLimitStore, LimitStore},
    tasks::BackgroundTasks,
};
