//! Local caching of static request results.
//!
//! Results are stored as opaque JSON bytes keyed by string. There is no
//! expiry metadata: the last successful fetch wins, and comparison against
//! the previous entry only decides whether consumers are notified again.
//!
//! - `store`: the key to bytes backends (disk, memory)
//! - `bundle`: read-only fallback data shipped with the application
//! - `coordinator`: key derivation, marshaling and equivalence
//! - `compare`: structural JSON equality

pub mod bundle;
pub mod compare;
pub mod coordinator;
pub mod store;

pub use bundle::ResourceBundle;
pub use compare::is_equivalent;
pub use coordinator::CacheCoordinator;
pub use store::{ByteStore, DiskByteStore, MemoryByteStore};
