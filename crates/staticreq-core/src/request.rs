//! Request descriptors: how a kind of static data is fetched, keyed and
//! turned into the model consumers receive.
//!
//! A descriptor is a value type implementing [`StaticRequest`]. The
//! associated functions (no `self`) describe the *kind* of request and are
//! used by the cache layer without an instance; `fetch` and `cancel` act on
//! one request instance.
//!
//! Optional capabilities have default implementations that mean "not
//! supported": no custom cache key, no bundled fallback, every shape
//! accepted, cancellation is a no-op.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::FetchError;

#[async_trait]
pub trait StaticRequest: Send + Sync + 'static {
    /// Request parameters. Serialized to build the default cache key.
    type Params: Serialize + Clone + Send + Sync + 'static;

    /// Domain object delivered to callbacks.
    type Model: Send + 'static;

    /// Stable identifier of this kind of request.
    ///
    /// Part of every default cache key and the name of the bundled
    /// fallback file (`<TYPE_NAME>.json`). Two descriptor types must not
    /// share a name.
    const TYPE_NAME: &'static str;

    /// Performs the remote retrieval and returns the raw JSON bytes.
    async fn fetch(&self, params: &Self::Params) -> Result<Vec<u8>, FetchError>;

    /// Converts a decoded raw result (fetched or cached) into the model.
    fn package_to_model(raw: &Value, params: &Self::Params) -> anyhow::Result<Self::Model>;

    /// Overrides the default cache key derivation.
    fn cache_key_from_params(_params: &Self::Params) -> Option<String> {
        None
    }

    /// Bundled offline default data for these params.
    ///
    /// When absent, the bundle file named after `TYPE_NAME` is tried.
    fn local_fallback_bytes(_params: &Self::Params) -> Option<Vec<u8>> {
        None
    }

    /// Returns false for a stale or incompatible result shape.
    fn check_format(_raw: &Value, _params: &Self::Params) -> bool {
        true
    }

    /// Asks an in-flight `fetch` on this instance to stop.
    fn cancel(&self) {}
}

/// Object-safe view of a descriptor instance's cancel capability.
pub(crate) trait CancelHook: Send + Sync {
    fn cancel(&self);
    fn request_type(&self) -> &'static str;
}

impl<D: StaticRequest> CancelHook for D {
    fn cancel(&self) {
        StaticRequest::cancel(self)
    }

    fn request_type(&self) -> &'static str {
        D::TYPE_NAME
    }
}
