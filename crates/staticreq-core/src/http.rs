//! Ready-made descriptor for JSON served over HTTP GET.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::FetchError;
use crate::request::StaticRequest;

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpParams {
    pub url: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

impl HttpParams {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: BTreeMap::new(),
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }
}

/// Fetches `HttpParams::url` and delivers the decoded JSON unchanged.
///
/// Clones share the connection pool but get their own cancel token.
pub struct HttpJsonRequest {
    client: Client,
    cancel: CancellationToken,
}

impl HttpJsonRequest {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            cancel: CancellationToken::new(),
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(FetchError::from_status(status, &body))
        }
    }
}

impl Clone for HttpJsonRequest {
    fn clone(&self) -> Self {
        Self::with_client(self.client.clone())
    }
}

#[async_trait]
impl StaticRequest for HttpJsonRequest {
    type Params = HttpParams;
    type Model = Value;
    const TYPE_NAME: &'static str = "HttpJson";

    async fn fetch(&self, params: &HttpParams) -> Result<Vec<u8>, FetchError> {
        let request = self
            .client
            .get(&params.url)
            .header(header::ACCEPT, "application/json")
            .query(&params.query);

        let send = async {
            let response = request.send().await?;
            let response = Self::check_response(response).await?;
            let body = response.bytes().await?;
            Ok::<_, FetchError>(body.to_vec())
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(url = %params.url, "HTTP fetch cancelled");
                Err(FetchError::Cancelled)
            }
            result = send => result,
        }
    }

    fn package_to_model(raw: &Value, _params: &HttpParams) -> anyhow::Result<Value> {
        Ok(raw.clone())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
