//! Test doubles shared by the unit tests of this crate

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use powerplatform_auth::{AccessToken, CredentialKind, TokenCredential};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::clock::Clock;
use crate::request::ApiResponse;
use crate::transport::{HttpRequest, Transport, TransportError, TransportResult};

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

/// Credential issuing `token-1`, `token-2`, ... and counting calls.
pub struct CountingCredential {
    clock: Arc<ManualClock>,
    lifetime: Duration,
    delay: Duration,
    fail_first: usize,
    calls: AtomicUsize,
}

impl CountingCredential {
    pub fn new(clock: Arc<ManualClock>, lifetime_secs: u64) -> Self {
        Self {
            clock,
            lifetime: Duration::from_secs(lifetime_secs),
            delay: Duration::ZERO,
            fail_first: 0,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TokenCredential for CountingCredential {
    fn kind(&self) -> CredentialKind {
        CredentialKind::ClientSecret
    }

    fn get_token<'a>(
        &'a self,
        scopes: &'a [String],
    ) -> Pin<Box<dyn Future<Output = powerplatform_auth::Result<AccessToken>> + Send + 'a>>
    {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if n <= self.fail_first {
                return Err(powerplatform_auth::Error::Authentication(
                    "AADSTS7000215: Invalid client secret provided.".into(),
                ));
            }
            Ok(AccessToken::new(
                format!("token-{n}"),
                self.clock.now() + self.lifetime,
                scopes.to_vec(),
            ))
        })
    }
}

/// Transport replaying a fixed script and recording what was sent.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<TransportResult>>,
    delay: Duration,
    sent: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<TransportResult>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            delay: Duration::ZERO,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Every send waits this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn sent(&self) -> Vec<HttpRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Transport for ScriptedTransport {
    fn send<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = TransportResult> + Send + 'a>> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(request);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                Err(TransportError {
                    message: "script exhausted".into(),
                    retryable: false,
                })
            })
        })
    }
}

/// Response with a JSON (or empty) body and optional headers.
pub fn response(status: u16, body: &str, headers: &[(&str, &str)]) -> TransportResult {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    Ok(ApiResponse::new(
        status,
        map,
        Bytes::copy_from_slice(body.as_bytes()),
    ))
}

pub fn connect_error() -> TransportResult {
    Err(TransportError {
        message: "connection refused".into(),
        retryable: true,
    })
}
