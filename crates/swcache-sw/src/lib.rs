//! # swcache Service Worker
//!
//! Offline-first request interceptor with a versioned cache.
//!
//! ## Features
//!
//! - **Lifecycle**: install seeds a generation, activate sweeps the old ones
//! - **Stale-while-revalidate**: cached answers immediately, refreshes in the background
//! - **Offline fallbacks**: an HTML page for navigations, a JSON error for API calls
//! - **Control messages**: `SKIP_WAITING`, `GET_VERSION`, `CLEAN_CACHE`, `CACHE_URL`
//! - **Pluggable storage**: in-memory or file-backed [`CacheStore`]
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorker
//!     ├── Registration (installing / waiting / active)
//!     ├── Arc<dyn Fetcher>      network boundary
//!     ├── Arc<dyn CacheStore>
//!     │       └── generation ("v1")
//!     │               └── CacheKey (GET url) → CacheEntry
//!     ├── OfflinePolicy
//!     └── JoinSet             pending revalidations
//! ```

pub mod cache;
pub mod disk;
pub mod error;
pub mod fallback;
pub mod lifecycle;
pub mod message;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheKey, CacheStorage, CacheStore, MemoryCacheStore};
pub use disk::FileCacheStore;
pub use error::{ServiceWorkerError, StoreError};
pub use fallback::{OfflinePolicy, OFFLINE_MARKER};
pub use lifecycle::{
    GenerationState, Registration, ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState,
    WorkerVersion,
};
pub use message::{ControlMessage, ControlReply, MessageEnvelope, MessagePort};
pub use worker::{Interception, Outcome, ServiceWorker};
