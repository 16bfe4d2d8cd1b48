//! Request executor
//!
//! `Client::execute` is the single path every service call takes:
//! 1. Validate the URL (absolute, `https` only) and the scope list
//! 2. Take a bearer token from the token cache
//! 3. Send through the transport with the standard headers
//! 4. Acceptable status: done. Otherwise classify and retry or fail
//! 5. 202 with a poll directive: hand over to the operation poller

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use common::{Config, LroSettings, RetrySettings};
use powerplatform_auth::AccessToken;
use reqwest::Url;
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT,
};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::TokenCache;
use crate::context::OperationContext;
use crate::error::{Error, Result};
use crate::lro::Completion;
use crate::metrics;
use crate::request::{ApiRequest, ApiResponse};
use crate::retry::{self, Disposition, RetryPolicy};
use crate::transport::{HttpRequest, Transport};

/// Default `User-Agent` for outgoing requests.
pub const DEFAULT_USER_AGENT: &str = concat!("powerplatform-rust/", env!("CARGO_PKG_VERSION"));

const CLIENT_REQUEST_ID: HeaderName = HeaderName::from_static("x-ms-client-request-id");
const CLIENT_SESSION_ID: HeaderName = HeaderName::from_static("x-ms-client-session-id");
const APPLICATION_JSON: HeaderValue = HeaderValue::from_static("application/json");

/// Tuning for a `Client`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user_agent: String,
    /// Drops the per-client session id header
    pub telemetry_optout: bool,
    pub retry: RetrySettings,
    pub lro: LroSettings,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            telemetry_optout: false,
            retry: RetrySettings::default(),
            lro: LroSettings::default(),
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            telemetry_optout: config.telemetry_optout,
            retry: config.retry.clone(),
            lro: config.lro.clone(),
        }
    }
}

/// Authenticated, retrying HTTP client for Power Platform APIs.
///
/// Cheap to share behind an `Arc`; the token cache is the only mutable state.
pub struct Client {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenCache>,
    retry: RetryPolicy,
    lro: LroSettings,
    user_agent: HeaderValue,
    session_id: Option<HeaderValue>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("tokens", &self.tokens)
            .field("retry", &self.retry)
            .field("lro", &self.lro)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl Client {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenCache>,
        options: ClientOptions,
    ) -> Result<Self> {
        Self::with_retry_policy(
            transport,
            tokens,
            RetryPolicy::from_settings(&options.retry),
            options,
        )
    }

    /// Client with an explicit retry policy (and so an explicit jitter source).
    pub fn with_retry_policy(
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenCache>,
        retry: RetryPolicy,
        options: ClientOptions,
    ) -> Result<Self> {
        let user_agent = HeaderValue::from_str(&options.user_agent)
            .map_err(|e| Error::Configuration(format!("invalid user agent: {e}")))?;
        let session_id = if options.telemetry_optout {
            None
        } else {
            HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).ok()
        };
        Ok(Self {
            transport,
            tokens,
            retry,
            lro: options.lro,
            user_agent,
            session_id,
        })
    }

    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    pub(crate) fn lro_settings(&self) -> &LroSettings {
        &self.lro
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute a request. A request carrying a poll directive accepts 202,
    /// and that 202 is followed to completion; the final poll response is
    /// returned.
    pub async fn execute(&self, ctx: &OperationContext, mut request: ApiRequest) -> Result<ApiResponse> {
        if request.poll.is_some() && !request.is_acceptable(202) {
            request.acceptable.push(202);
        }
        let url = validate_url(&request.url)?;
        let body = encode_body(&request)?;
        let response = self.send_with_retry(ctx, &request, &url, body).await?;

        if response.status == 202
            && let Some(ref directive) = request.poll
        {
            let completion = self
                .wait_for_operation(ctx, &request.scopes, response, directive)
                .await?;
            return Ok(completion.response);
        }
        Ok(response)
    }

    /// Execute and deserialize the response body.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        ctx: &OperationContext,
        request: ApiRequest,
    ) -> Result<T> {
        self.execute(ctx, request).await?.json()
    }

    /// Execute a request that may start a long-running operation and wait for
    /// it. 202 is added to the acceptable set.
    pub async fn execute_and_wait(
        &self,
        ctx: &OperationContext,
        mut request: ApiRequest,
    ) -> Result<Completion> {
        let directive = request.poll.take().unwrap_or_default();
        if !request.is_acceptable(202) {
            request.acceptable.push(202);
        }
        let url = validate_url(&request.url)?;
        let body = encode_body(&request)?;
        let response = self.send_with_retry(ctx, &request, &url, body).await?;

        if response.status != 202 {
            return Ok(Completion {
                response,
                operation: None,
            });
        }
        self.wait_for_operation(ctx, &request.scopes, response, &directive)
            .await
    }

    /// Send with retries. Never follows a 202.
    pub(crate) async fn send_with_retry(
        &self,
        ctx: &OperationContext,
        request: &ApiRequest,
        url: &Url,
        body: Option<Bytes>,
    ) -> Result<ApiResponse> {
        if request.scopes.is_empty() {
            return Err(Error::Configuration(format!(
                "request to {url} does not name a token scope"
            )));
        }

        let started = Instant::now();
        let mut attempts = 0u32;
        let mut refreshed = false;

        loop {
            ctx.check()?;
            attempts += 1;
            let token = self.tokens.get_or_refresh(ctx, &request.scopes).await?;
            let http = self.prepare(request, url, &token, body.clone())?;

            debug!(method = %request.method, url = %url, attempt = attempts, "sending request");
            let outcome = ctx.run(async { Ok(self.transport.send(http).await) }).await?;

            let (reason, hint, last) = match outcome {
                Ok(response) => {
                    metrics::record_request(request.method.as_str(), response.status);
                    match retry::classify(response.status, &request.acceptable) {
                        Disposition::Accept => return Ok(response),
                        Disposition::Fail => {
                            return Err(Error::UnexpectedStatus {
                                status: response.status,
                                body: response.text(),
                                url: url.to_string(),
                            });
                        }
                        Disposition::RefreshAndRetry => {
                            if refreshed {
                                return Err(Error::Authentication(format!(
                                    "{url} rejected a freshly acquired token (401): {}",
                                    response.text()
                                )));
                            }
                            refreshed = true;
                            warn!(url = %url, "401 from service, forcing token refresh");
                            self.tokens
                                .refresh_rejected(ctx, &request.scopes, &token)
                                .await?;
                            ("401".to_string(), Some(Duration::ZERO), Some(response))
                        }
                        Disposition::Retry => {
                            let hint = retry::retry_after(&response, SystemTime::now());
                            (response.status.to_string(), hint, Some(response))
                        }
                    }
                }
                Err(e) if e.retryable => {
                    warn!(url = %url, error = %e, "transport error");
                    (format!("transport: {e}"), None, None)
                }
                Err(e) => return Err(Error::Http(format!("{url}: {e}"))),
            };

            let delay = self.retry.delay(attempts - 1, hint);
            if !self.retry.allows(attempts, started.elapsed(), delay) {
                warn!(url = %url, attempts, reason = %reason, "retry budget exhausted");
                return Err(Error::RetryExhausted {
                    attempts,
                    reason: match last {
                        Some(ref r) => format!("last status {}", r.status),
                        None => reason,
                    },
                    last: last.map(Box::new),
                });
            }

            warn!(
                url = %url,
                attempt = attempts,
                reason = %reason,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "retrying request"
            );
            metrics::record_retry(if last.is_some() { reason } else { "transport".into() });
            ctx.sleep(delay).await?;
        }
    }

    fn prepare(
        &self,
        request: &ApiRequest,
        url: &Url,
        token: &AccessToken,
        body: Option<Bytes>,
    ) -> Result<HttpRequest> {
        let mut headers: HeaderMap = request.headers.clone();

        let mut bearer = HeaderValue::from_str(&token.bearer())
            .map_err(|_| Error::InvalidCredential("access token is not a valid header value".into()))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(ACCEPT, APPLICATION_JSON);
        if body.is_some() {
            headers.insert(CONTENT_TYPE, APPLICATION_JSON);
        }
        headers.insert(USER_AGENT, self.user_agent.clone());
        if let Ok(id) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
            headers.insert(CLIENT_REQUEST_ID, id);
        }
        if let Some(ref session) = self.session_id {
            headers.insert(CLIENT_SESSION_ID, session.clone());
        }

        Ok(HttpRequest {
            method: request.method.clone(),
            url: url.clone(),
            headers,
            body,
        })
    }
}

/// Absolute `https` URLs only.
pub fn validate_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::InvalidUrl(format!("{raw}: {e}")))?;
    if url.scheme() != "https" {
        return Err(Error::InvalidUrl(format!("{raw}: only https is allowed")));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::InvalidUrl(format!("{raw}: missing host")));
    }
    Ok(url)
}

fn encode_body(request: &ApiRequest) -> Result<Option<Bytes>> {
    Ok(request
        .body
        .as_ref()
        .map(serde_json::to_vec)
        .transpose()?
        .map(Bytes::from))
}
