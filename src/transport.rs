//! HTTP transport for the transfer API.
//!
//! This module provides the single funnel every network call goes
//! through. It resolves symbolic routes, attaches signed headers for auth
//! routes, sends bodies, and exposes a streaming variant for bulk
//! downloads. It also hosts the bandwidth probes.
//!
//! A server reply of 401 on an auth route means the session expired; the
//! session is cleared on the spot so later calls fail fast.

use std::sync::Arc;
use std::time::Instant;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::cipher;
use crate::config::PROBE_PAYLOAD_BYTES;
use crate::error::{Result, XferError};
use crate::routes::{header, ContentType, Route, RouteKey, RouteTable};
use crate::session::Session;

/// A request body with its content type.
pub struct RequestBody {
    pub content_type: ContentType,
    pub bytes: Vec<u8>,
}

impl RequestBody {
    pub fn json(bytes: Vec<u8>) -> Self {
        Self {
            content_type: ContentType::Json,
            bytes,
        }
    }

    pub fn octet(bytes: Vec<u8>) -> Self {
        Self {
            content_type: ContentType::Octet,
            bytes,
        }
    }
}

/// Result of a bandwidth probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    /// Payload size in bytes.
    pub bytes: u64,
    /// Elapsed transfer time in milliseconds.
    pub elapsed_ms: u64,
}

impl ProbeResult {
    /// Bytes per millisecond, the unit the upload planner expects.
    pub fn bytes_per_ms(&self) -> f32 {
        self.bytes as f32 / self.elapsed_ms.max(1) as f32
    }
}

/// HTTP client wrapper around the route table and session.
pub struct Transport {
    client: Client,
    routes: RouteTable,
    session: Arc<Session>,
}

impl Transport {
    /// Creates a transport for `base_url` sharing the given session.
    pub fn new(base_url: &str, session: Arc<Session>) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            routes: RouteTable::new(base_url)?,
            session,
        })
    }

    /// The shared session handle.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Resolves a route URL with query parameters appended.
    fn build_url(route: &Route, queries: &[(&str, &str)]) -> Url {
        let mut url = route.url.clone();
        if !queries.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in queries {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    /// Performs one request and buffers the response body.
    ///
    /// Auth routes are signed; the caller checks the returned status (the
    /// transport only fails the call on connection errors, signing errors
    /// and session expiry).
    pub async fn call(
        &self,
        key: RouteKey,
        queries: &[(&str, &str)],
        extra_headers: &[(&str, String)],
        body: Option<RequestBody>,
    ) -> Result<(StatusCode, HeaderMap, Vec<u8>)> {
        let route = self.routes.get(key);
        let url = Self::build_url(route, queries);

        let body_bytes = body.as_ref().map(|b| b.bytes.as_slice()).unwrap_or(&[]);

        let mut headers = HeaderMap::new();
        if route.auth {
            self.attach_signature(&mut headers, &route.method, &url, body_bytes)?;
        }
        if let Some(ref body) = body {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static(body.content_type.as_str()),
            );
        }
        for (name, value) in extra_headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| XferError::Internal(format!("bad header name: {}", e)))?,
                HeaderValue::from_str(value)
                    .map_err(|e| XferError::Internal(format!("bad header value: {}", e)))?,
            );
        }

        debug!(method = %route.method, url = %url, "Request");

        let mut request = self
            .client
            .request(route.method.clone(), url)
            .headers(headers);
        if let Some(body) = body {
            request = request.body(body.bytes);
        }

        let response = request.send().await?;
        let status = response.status();

        if route.auth && status == StatusCode::UNAUTHORIZED {
            warn!("Server rejected session; clearing local state");
            self.session.clear();
            return Err(XferError::NotAuthenticated("session expired".into()));
        }

        let resp_headers = response.headers().clone();
        let resp_body = response.bytes().await?.to_vec();

        debug!(status = %status, body_len = resp_body.len(), "Response");

        Ok((status, resp_headers, resp_body))
    }

    /// Performs one request and returns the response for streaming.
    ///
    /// Used by the download data leg; the caller owns the response and
    /// drives `bytes_stream` to completion. The download continuation
    /// token is attached when provided.
    pub async fn stream(
        &self,
        key: RouteKey,
        queries: &[(&str, &str)],
        download_id: &str,
    ) -> Result<reqwest::Response> {
        let route = self.routes.get(key);
        let url = Self::build_url(route, queries);

        let mut headers = HeaderMap::new();
        if route.auth {
            self.attach_signature(&mut headers, &route.method, &url, &[])?;
        }
        if !download_id.is_empty() {
            headers.insert(
                HeaderName::from_bytes(header::DOWNLOAD_ID.as_bytes())
                    .map_err(|e| XferError::Internal(format!("bad header name: {}", e)))?,
                HeaderValue::from_str(download_id)
                    .map_err(|e| XferError::Internal(format!("bad download id: {}", e)))?,
            );
        }

        debug!(method = %route.method, url = %url, "Streaming request");

        let response = self
            .client
            .request(route.method.clone(), url)
            .headers(headers)
            .send()
            .await?;

        if route.auth && response.status() == StatusCode::UNAUTHORIZED {
            warn!("Server rejected session; clearing local state");
            self.session.clear();
            return Err(XferError::NotAuthenticated("session expired".into()));
        }

        Ok(response)
    }

    /// Computes and attaches the signed headers for an auth route.
    fn attach_signature(
        &self,
        headers: &mut HeaderMap,
        method: &reqwest::Method,
        url: &Url,
        body: &[u8],
    ) -> Result<()> {
        let signed = self
            .session
            .sign(method.as_str(), url.path(), url.query().unwrap_or(""), body)?;

        let put = |headers: &mut HeaderMap, name: &'static str, value: &str| -> Result<()> {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| XferError::Internal(format!("bad header name: {}", e)))?,
                HeaderValue::from_str(value)
                    .map_err(|e| XferError::Internal(format!("bad header value: {}", e)))?,
            );
            Ok(())
        };

        put(headers, header::TIMESTAMP, &signed.timestamp)?;
        put(headers, header::SESSION_ID, &signed.session_id)?;
        put(headers, header::REQ_SIGNATURE, &signed.req_signature)?;
        put(headers, header::BODY_SIGNATURE, &signed.body_signature)?;

        Ok(())
    }

    /// Upload bandwidth probe: POSTs a fixed random payload and measures
    /// the elapsed wall time.
    pub async fn probe_upload(&self) -> Result<ProbeResult> {
        let route = self.routes.get(RouteKey::TestUpload);
        let payload = cipher::random_bytes(PROBE_PAYLOAD_BYTES);

        let start = Instant::now();
        let response = self
            .client
            .request(route.method.clone(), route.url.clone())
            .header(CONTENT_TYPE, ContentType::Octet.as_str())
            .body(payload)
            .send()
            .await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if !response.status().is_success() {
            return Err(XferError::Transport(format!(
                "upload probe status {}",
                response.status()
            )));
        }

        debug!(elapsed_ms, "Upload probe complete");

        Ok(ProbeResult {
            bytes: PROBE_PAYLOAD_BYTES as u64,
            elapsed_ms,
        })
    }

    /// Download bandwidth probe: drains the test payload and measures the
    /// elapsed time from the server's start marker.
    pub async fn probe_download(&self) -> Result<ProbeResult> {
        use futures_util::StreamExt;

        let route = self.routes.get(RouteKey::TestDownload);
        let response = self
            .client
            .request(route.method.clone(), route.url.clone())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(XferError::Transport(format!(
                "download probe status {}",
                response.status()
            )));
        }

        let start_ms: i64 = response
            .headers()
            .get(header::START_TIME)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| XferError::Transport("probe missing Start-Time header".into()))?;

        let mut bytes: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            bytes += chunk?.len() as u64;
        }

        let elapsed_ms = (chrono::Utc::now().timestamp_millis() - start_ms).max(1) as u64;

        debug!(elapsed_ms, bytes, "Download probe complete");

        Ok(ProbeResult { bytes, elapsed_ms })
    }
}
