//! Workload identity federation (OIDC)
//!
//! A CI system issues a short-lived OIDC token which is exchanged at the
//! token endpoint as a client assertion. The assertion comes from one of three
//! places: a literal token, a file (Kubernetes projected token, for example),
//! or an HTTP endpoint (GitHub Actions `ACTIONS_ID_TOKEN_REQUEST_URL`).
//!
//! Both the file and the HTTP reads are capped at `MAX_ASSERTION_BYTES`.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use common::Secret;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::constants::{MAX_ASSERTION_BYTES, OIDC_AUDIENCE};
use crate::credentials::{CredentialKind, TokenCredential};
use crate::error::{Error, Result};
use crate::token::{AccessToken, exchange_client_assertion};

/// Where the federated assertion is read from.
#[derive(Debug, Clone)]
pub enum AssertionSource {
    Token(Secret<String>),
    File(PathBuf),
    Request {
        url: String,
        bearer: Secret<String>,
    },
}

#[derive(Deserialize)]
struct OidcTokenResponse {
    value: String,
}

impl AssertionSource {
    /// Fetch a fresh assertion. Called for every token request since the
    /// assertion itself is short lived.
    pub async fn fetch(&self, http: &reqwest::Client) -> Result<Secret<String>> {
        let assertion = match self {
            AssertionSource::Token(token) => token.clone(),
            AssertionSource::File(path) => read_assertion_file(path).await?,
            AssertionSource::Request { url, bearer } => {
                request_assertion(http, url, bearer).await?
            }
        };
        if assertion.is_blank() {
            return Err(Error::InvalidCredential("OIDC assertion is empty".into()));
        }
        Ok(assertion)
    }
}

async fn read_assertion_file(path: &PathBuf) -> Result<Secret<String>> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::Io(format!("opening OIDC token file {}: {e}", path.display())))?;

    let mut buf = Vec::new();
    file.take(MAX_ASSERTION_BYTES as u64 + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| Error::Io(format!("reading OIDC token file {}: {e}", path.display())))?;
    if buf.len() > MAX_ASSERTION_BYTES {
        return Err(Error::InvalidCredential(format!(
            "OIDC token file {} exceeds {MAX_ASSERTION_BYTES} bytes",
            path.display()
        )));
    }

    let text = String::from_utf8(buf)
        .map_err(|_| Error::InvalidCredential("OIDC token file is not UTF-8".into()))?;
    debug!(path = %path.display(), "read OIDC assertion from file");
    Ok(Secret::new(text.trim().to_string()))
}

async fn request_assertion(
    http: &reqwest::Client,
    url: &str,
    bearer: &Secret<String>,
) -> Result<Secret<String>> {
    let mut request_url = reqwest::Url::parse(url)
        .map_err(|e| Error::Configuration(format!("invalid OIDC request URL: {e}")))?;
    request_url
        .query_pairs_mut()
        .append_pair("audience", OIDC_AUDIENCE);

    let mut response = http
        .get(request_url)
        .bearer_auth(bearer.expose())
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| Error::Http(format!("OIDC token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Authentication(format!(
            "OIDC token endpoint returned {status}"
        )));
    }
    if let Some(len) = response.content_length()
        && len > MAX_ASSERTION_BYTES as u64
    {
        return Err(Error::InvalidCredential(format!(
            "OIDC token response exceeds {MAX_ASSERTION_BYTES} bytes"
        )));
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| Error::Http(format!("reading OIDC token response: {e}")))?
    {
        if body.len() + chunk.len() > MAX_ASSERTION_BYTES {
            return Err(Error::InvalidCredential(format!(
                "OIDC token response exceeds {MAX_ASSERTION_BYTES} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }

    let parsed: OidcTokenResponse = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidCredential(format!("invalid OIDC token response: {e}")))?;
    Ok(Secret::new(parsed.value))
}

/// Federated credential: CI-issued assertion exchanged for an access token.
#[derive(Debug)]
pub struct OidcCredential {
    endpoint: String,
    client_id: String,
    source: AssertionSource,
    http: reqwest::Client,
}

impl OidcCredential {
    pub fn new(
        endpoint: String,
        client_id: String,
        source: AssertionSource,
        http: reqwest::Client,
    ) -> Self {
        Self {
            endpoint,
            client_id,
            source,
            http,
        }
    }
}

impl TokenCredential for OidcCredential {
    fn kind(&self) -> CredentialKind {
        CredentialKind::Oidc
    }

    fn get_token<'a>(
        &'a self,
        scopes: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<AccessToken>> + Send + 'a>> {
        Box::pin(async move {
            let assertion = self.source.fetch(&self.http).await?;
            exchange_client_assertion(&self.http, &self.endpoint, &self.client_id, &assertion, scopes)
                .await
        })
    }
}
