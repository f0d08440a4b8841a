//! Object Store Module
//!
//! Metadata lookups against the remote copy of the mirror. The validator only
//! needs to know whether a key exists and how large it is, so the store exposes
//! a single HEAD-style operation.

use crate::{MonitorError, Result};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::CONTENT_LENGTH;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Characters left as-is in object keys; everything else is percent-encoded
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Metadata of a remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
}

/// Looks up remote object metadata
pub trait ObjectMetadataStore: Send + Sync + 'static {
    /// `Ok(None)` when the key does not exist; `Err` for any other failure
    fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<ObjectMetadata>>> + Send;
}

/// Issues unsigned path-style HEAD requests against an S3-compatible HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client<HttpConnector, Empty<Bytes>>,
    endpoint: String,
    request_timeout: Duration,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let uri: Uri = endpoint
            .parse()
            .map_err(|e| MonitorError::ConfigError(format!("invalid endpoint {}: {}", endpoint, e)))?;

        if uri.scheme_str() != Some("http") {
            return Err(MonitorError::ConfigError(format!(
                "endpoint must be an http:// URL, got {}",
                endpoint
            )));
        }

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(60))
            .build_http();

        Ok(Self {
            client,
            endpoint,
            request_timeout,
        })
    }

    /// Path-style URI for `bucket`/`key`
    pub fn object_uri(&self, bucket: &str, key: &str) -> Result<Uri> {
        let uri = format!(
            "{}/{}/{}",
            self.endpoint,
            utf8_percent_encode(bucket, KEY_ENCODE_SET),
            utf8_percent_encode(key, KEY_ENCODE_SET)
        );
        uri.parse()
            .map_err(|e| MonitorError::HttpError(format!("invalid object URI {}: {}", uri, e)))
    }
}

impl ObjectMetadataStore for HttpObjectStore {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMetadata>> {
        let uri = self.object_uri(bucket, key)?;
        debug!("HEAD {}", uri);

        let request = Request::builder()
            .method(Method::HEAD)
            .uri(uri.clone())
            .body(Empty::<Bytes>::new())
            .map_err(|e| MonitorError::HttpError(format!("failed to build request: {}", e)))?;

        let response = timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| {
                MonitorError::TimeoutError(format!(
                    "HEAD {} did not complete within {:?}",
                    uri, self.request_timeout
                ))
            })??;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let size = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| {
                        MonitorError::S3Error(format!("HEAD {} returned no Content-Length", uri))
                    })?;
                Ok(Some(ObjectMetadata { size }))
            }
            status => Err(MonitorError::S3Error(format!(
                "HEAD {} returned {}",
                uri, status
            ))),
        }
    }
}
