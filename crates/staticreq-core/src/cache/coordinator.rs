use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::bundle::ResourceBundle;
use super::compare;
use super::store::ByteStore;
use crate::error::CacheError;
use crate::request::StaticRequest;

/// Derives cache keys, marshals cached bytes and compares results.
///
/// Clone is cheap - the store is shared behind an `Arc`.
#[derive(Clone)]
pub struct CacheCoordinator {
    store: Arc<dyn ByteStore>,
    bundle: Arc<ResourceBundle>,
}

impl CacheCoordinator {
    pub fn new(store: Arc<dyn ByteStore>, bundle: ResourceBundle) -> Self {
        Self {
            store,
            bundle: Arc::new(bundle),
        }
    }

    /// Cache key for a request kind and its params.
    ///
    /// Uses the descriptor's own key when it provides one, otherwise
    /// `TYPE_NAME:<canonical params JSON>` with object keys sorted.
    /// Returns `None` when the params can't be serialized; such requests
    /// bypass the byte store.
    pub fn make_cache_key<D: StaticRequest>(params: &D::Params) -> Option<String> {
        if let Some(key) = D::cache_key_from_params(params) {
            return Some(key);
        }

        let canonical = serde_json::to_value(params)
            .map(canonicalize)
            .and_then(|v| serde_json::to_string(&v));
        match canonical {
            Ok(canonical) if canonical == "null" => Some(D::TYPE_NAME.to_string()),
            Ok(canonical) => Some(format!("{}:{}", D::TYPE_NAME, canonical)),
            Err(e) => {
                warn!(request = D::TYPE_NAME, error = %e, "Params can't be keyed, bypassing cache");
                None
            }
        }
    }

    /// Cached (or bundled) model for these params, if any.
    pub fn cached_model<D: StaticRequest>(&self, params: &D::Params) -> Option<D::Model> {
        let raw = self.cached_raw_value::<D>(params)?;
        package::<D>(&raw, params)
    }

    /// Cached (or bundled) raw value, without building a model.
    ///
    /// Sources are tried in order: the byte store, the descriptor's
    /// `local_fallback_bytes`, then the bundle file named after the type.
    /// Undecodable bytes and values failing `check_format` count as a miss.
    pub fn cached_raw_value<D: StaticRequest>(&self, params: &D::Params) -> Option<Value> {
        let key = Self::make_cache_key::<D>(params);
        let bytes = key
            .as_deref()
            .and_then(|key| self.store.get(key))
            .or_else(|| D::local_fallback_bytes(params))
            .or_else(|| self.bundle.bytes_for(D::TYPE_NAME));

        let Some(bytes) = bytes else {
            debug!(key = ?key, "No cached data");
            return None;
        };

        let raw: Value = match serde_json::from_slice(&bytes) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(key = ?key, error = %e, "Cached data is not valid JSON");
                return None;
            }
        };

        if !D::check_format(&raw, params) {
            debug!(key = ?key, "Cached data failed format check");
            return None;
        }

        Some(raw)
    }

    /// Writes `raw` under the key for these params, overwriting.
    pub fn cache_result<D: StaticRequest>(
        &self,
        raw: &Value,
        params: &D::Params,
    ) -> Result<(), CacheError> {
        let key = Self::make_cache_key::<D>(params).ok_or(CacheError::Unkeyable(D::TYPE_NAME))?;
        let bytes = serde_json::to_vec(raw)?;
        self.store.set(&key, &bytes)?;
        debug!(key = %key, bytes = bytes.len(), "Cached result");
        Ok(())
    }

    /// See [`compare::is_equivalent`].
    pub fn is_equivalent(new_raw: &Value, cached_raw: Option<&Value>) -> bool {
        compare::is_equivalent(new_raw, cached_raw)
    }
}

/// Sorts object keys recursively so equal params serialize identically
/// whatever map type or field order produced them.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Builds a model, logging and absorbing packaging failures.
pub(crate) fn package<D: StaticRequest>(raw: &Value, params: &D::Params) -> Option<D::Model> {
    match D::package_to_model(raw, params) {
        Ok(model) => Some(model),
        Err(e) => {
            debug!(request = D::TYPE_NAME, error = %e, "Failed to package model");
            None
        }
    }
}
