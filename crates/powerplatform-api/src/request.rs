//! Request and response values
//!
//! An `ApiRequest` is built per call by a service client and consumed by
//! `Client::execute`. Success is decided by the caller's acceptable status
//! set, not by a fixed 2xx rule: some callers treat 404 or 409 as valid.

use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Ask the executor to follow a 202 Accepted through to completion.
#[derive(Debug, Clone, Default)]
pub struct PollDirective {
    /// Overrides the configured poll interval when the server sends no hint
    pub interval: Option<Duration>,
    /// Overrides the configured maximum wait
    pub max_wait: Option<Duration>,
}

/// One logical API call (possibly several HTTP attempts).
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
    pub acceptable: Vec<u16>,
    pub scopes: Vec<String>,
    pub poll: Option<PollDirective>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            acceptable: vec![200],
            scopes: Vec::new(),
            poll: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    /// Replace the acceptable status set.
    pub fn accept(mut self, statuses: &[u16]) -> Self {
        self.acceptable = statuses.to_vec();
        self
    }

    /// Serialize a DTO as the JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn poll(mut self, directive: PollDirective) -> Self {
        self.poll = Some(directive);
        self
    }

    pub fn is_acceptable(&self, status: u16) -> bool {
        self.acceptable.contains(&status)
    }
}

/// Raw response of a single HTTP exchange.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as text, lossy. For diagnostics only.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}
