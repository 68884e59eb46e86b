//! Cache-first coordination for slow-changing remote data.
//!
//! A [`StaticRequestManager`] serves the locally cached value for a request
//! immediately, refreshes it in the background, and calls back a second
//! time only when the refreshed value actually differs from the cache.
//!
//! - [`request`]: the [`StaticRequest`] descriptor trait every data type implements
//! - [`cache`]: byte stores, bundled fallbacks, key derivation and comparison
//! - [`manager`]: retrieval policies, in-flight deduplication, task refresh
//! - [`tasks`]: background refresh tasks and their login/launch gates
//! - [`lifecycle`]: login, logout and foreground signals
//! - [`http`]: a descriptor for plain JSON-over-HTTP endpoints

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod manager;
pub mod request;
pub mod tasks;

pub use cache::{ByteStore, CacheCoordinator, DiskByteStore, MemoryByteStore, ResourceBundle};
pub use config::Config;
pub use error::{CacheError, FetchError};
pub use http::{HttpJsonRequest, HttpParams};
pub use lifecycle::{LifecycleBus, LifecycleEvent};
pub use manager::{RequestHandle, RequestStats, StaticRequestManager};
pub use request::StaticRequest;
pub use tasks::{StaticTask, TaskRegistry};
