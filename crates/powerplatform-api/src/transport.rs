//! HTTP transport seam
//!
//! The executor talks to the network through `Transport` so retry and polling
//! logic can be exercised against scripted responses. Production uses
//! `ReqwestTransport`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};

use crate::error::{Error, Result};
use crate::request::ApiResponse;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// A fully prepared HTTP request, headers and bearer token included.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Failure below the HTTP layer. Connect errors and timeouts are retryable.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

pub type TransportResult = std::result::Result<ApiResponse, TransportError>;

/// Sends one HTTP request. No retries, no auth.
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = TransportResult> + Send + 'a>>;
}

/// `reqwest` backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Client with the default connect and per-request timeouts.
    pub fn default_client() -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(format!("building HTTP client: {e}")))
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = TransportResult> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(request.method, request.url)
                .headers(request.headers);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(classify_reqwest_error)?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(classify_reqwest_error)?;
            Ok(ApiResponse::new(status, headers, body))
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    TransportError {
        retryable: err.is_timeout() || err.is_connect(),
        message: err.to_string(),
    }
}
