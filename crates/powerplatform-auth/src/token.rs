//! Access tokens and the Entra ID token endpoint
//!
//! Handles the two client-credentials interactions with the v2 token
//! endpoint:
//! 1. Shared secret (`client_secret`)
//! 2. Signed or federated assertion (`client_assertion`), used by both the
//!    certificate and the OIDC credentials
//!
//! Both POST to `{authority}/{tenant}/oauth2/v2.0/token` with
//! `grant_type=client_credentials`; only the proof of identity differs.

use std::fmt;
use std::time::{Duration, SystemTime};

use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::constants::{CLIENT_ASSERTION_TYPE, DEFAULT_TOKEN_LIFETIME_SECS};
use crate::error::{Error, Result};

/// A bearer token and the scopes it was issued for.
///
/// Deliberately has no `Serialize` impl: tokens only live in memory.
#[derive(Clone)]
pub struct AccessToken {
    pub token: Secret<String>,
    pub expires_on: SystemTime,
    pub scopes: Vec<String>,
}

impl AccessToken {
    pub fn new(token: String, expires_on: SystemTime, scopes: Vec<String>) -> Self {
        Self {
            token: Secret::new(token),
            expires_on,
            scopes,
        }
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &self.token)
            .field("expires_on", &self.expires_on)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Successful response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    pub fn into_access_token(self, scopes: &[String]) -> AccessToken {
        let lifetime = self.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        AccessToken::new(
            self.access_token,
            SystemTime::now() + Duration::from_secs(lifetime),
            scopes.to_vec(),
        )
    }
}

/// Error body returned by the identity platform (`AADSTS...` codes).
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Build the v2 token endpoint for a tenant.
pub fn token_endpoint(authority: &str, tenant_id: &str) -> String {
    format!(
        "{}/{}/oauth2/v2.0/token",
        authority.trim_end_matches('/'),
        tenant_id
    )
}

/// Acquire a token with a client secret.
pub async fn exchange_client_secret(
    client: &reqwest::Client,
    endpoint: &str,
    client_id: &str,
    secret: &Secret<String>,
    scopes: &[String],
) -> Result<AccessToken> {
    let scope = scopes.join(" ");
    let form = [
        ("grant_type", "client_credentials"),
        ("client_id", client_id),
        ("client_secret", secret.expose().as_str()),
        ("scope", scope.as_str()),
    ];
    post_token_form(client, endpoint, &form, scopes).await
}

/// Acquire a token with a client assertion (signed JWT or federated token).
pub async fn exchange_client_assertion(
    client: &reqwest::Client,
    endpoint: &str,
    client_id: &str,
    assertion: &Secret<String>,
    scopes: &[String],
) -> Result<AccessToken> {
    let scope = scopes.join(" ");
    let form = [
        ("grant_type", "client_credentials"),
        ("client_id", client_id),
        ("client_assertion_type", CLIENT_ASSERTION_TYPE),
        ("client_assertion", assertion.expose().as_str()),
        ("scope", scope.as_str()),
    ];
    post_token_form(client, endpoint, &form, scopes).await
}

async fn post_token_form(
    client: &reqwest::Client,
    endpoint: &str,
    form: &[(&str, &str)],
    scopes: &[String],
) -> Result<AccessToken> {
    let response = client
        .post(endpoint)
        .form(form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 400/401 with an OAuth error body means the credential was rejected
        if matches!(status.as_u16(), 400 | 401)
            && let Ok(err) = serde_json::from_str::<TokenErrorResponse>(&body)
        {
            return Err(Error::Authentication(format!(
                "{} ({status}): {}",
                err.error,
                err.error_description.unwrap_or_default()
            )));
        }

        return Err(Error::Http(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::Authentication(format!("invalid token response: {e}")))?;
    debug!(scopes = ?scopes, expires_in = ?token.expires_in, "token acquired");
    Ok(token.into_access_token(scopes))
}
