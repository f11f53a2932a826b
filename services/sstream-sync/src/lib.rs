//! Glance Simplestreams Sync
//!
//! Mirrors cloud images from simplestreams sources into Glance, publishes the
//! stream metadata to the object store and keeps the `image-stream` catalog
//! entry pointing at it.

pub mod catalog;
pub mod config;
pub mod error;
pub mod juju;
pub mod lock;
pub mod logging;
pub mod mirror;
pub mod proxy;
pub mod reconcile;
pub mod sync;

pub use catalog::{CatalogSource, KeystoneClient, ServiceCatalog};
pub use config::SyncConfig;
pub use error::{CatalogError, ConfigError, SyncError};
pub use lock::{LockAttempt, RunLock};
pub use sync::{SyncAgent, SyncOutcome};
