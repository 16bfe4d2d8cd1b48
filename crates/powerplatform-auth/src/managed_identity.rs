//! Managed identity credential
//!
//! Two hosting flavours expose a local token endpoint:
//! - App Service / Functions: `IDENTITY_ENDPOINT` + `IDENTITY_HEADER` env vars
//! - VMs and everything else: the Instance Metadata Service (IMDS)
//!
//! Both take a v1 `resource` rather than a v2 scope, so only a single scope
//! can be requested per token.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::constants::{
    APP_SERVICE_API_VERSION, DEFAULT_SCOPE_SUFFIX, DEFAULT_TOKEN_LIFETIME_SECS,
    IDENTITY_ENDPOINT_ENV, IDENTITY_HEADER_ENV, IMDS_API_VERSION, IMDS_ENDPOINT,
};
use crate::credentials::{CredentialKind, TokenCredential};
use crate::error::{Error, Result};
use crate::token::AccessToken;

#[derive(Debug, Clone)]
enum Endpoint {
    AppService { url: String, header: Secret<String> },
    Imds { url: String },
}

/// Token response shared by both endpoints. `expires_on` is an epoch in
/// seconds, sent as a string by IMDS and as a number by some hosts.
#[derive(Debug, Deserialize)]
struct ManagedIdentityResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<serde_json::Value>,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

/// Managed identity credential, system or user assigned.
#[derive(Debug)]
pub struct ManagedIdentityCredential {
    endpoint: Endpoint,
    client_id: Option<String>,
    http: reqwest::Client,
}

impl ManagedIdentityCredential {
    /// Detect the hosting environment from the process env.
    pub fn from_env(client_id: Option<String>, http: reqwest::Client) -> Self {
        match (
            std::env::var(IDENTITY_ENDPOINT_ENV).ok(),
            std::env::var(IDENTITY_HEADER_ENV).ok(),
        ) {
            (Some(url), Some(header)) => Self::app_service(url, Secret::new(header), client_id, http),
            _ => Self::imds(IMDS_ENDPOINT.to_string(), client_id, http),
        }
    }

    pub fn app_service(
        url: String,
        header: Secret<String>,
        client_id: Option<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            endpoint: Endpoint::AppService { url, header },
            client_id,
            http,
        }
    }

    pub fn imds(url: String, client_id: Option<String>, http: reqwest::Client) -> Self {
        Self {
            endpoint: Endpoint::Imds { url },
            client_id,
            http,
        }
    }

    async fn request(&self, resource: &str) -> Result<ManagedIdentityResponse> {
        let (url, api_version) = match &self.endpoint {
            Endpoint::AppService { url, .. } => (url, APP_SERVICE_API_VERSION),
            Endpoint::Imds { url } => (url, IMDS_API_VERSION),
        };
        let mut url = reqwest::Url::parse(url)
            .map_err(|e| Error::Configuration(format!("invalid managed identity endpoint: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("api-version", api_version);
            query.append_pair("resource", resource);
            if let Some(ref client_id) = self.client_id {
                query.append_pair("client_id", client_id);
            }
        }

        let request = match &self.endpoint {
            Endpoint::AppService { header, .. } => self
                .http
                .get(url)
                .header("X-IDENTITY-HEADER", header.expose().as_str()),
            Endpoint::Imds { .. } => self.http.get(url).header("Metadata", "true"),
        };

        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("managed identity request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Authentication(format!(
                "managed identity endpoint returned {status}: {body}"
            )));
        }
        response
            .json::<ManagedIdentityResponse>()
            .await
            .map_err(|e| Error::Authentication(format!("invalid managed identity response: {e}")))
    }
}

/// Strip the v2 `/.default` suffix to get the v1 resource URI.
pub fn resource_for_scope(scope: &str) -> &str {
    scope.strip_suffix(DEFAULT_SCOPE_SUFFIX).unwrap_or(scope)
}

fn as_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn expiry(response: &ManagedIdentityResponse) -> SystemTime {
    if let Some(epoch) = response.expires_on.as_ref().and_then(as_u64) {
        return UNIX_EPOCH + Duration::from_secs(epoch);
    }
    let lifetime = response
        .expires_in
        .as_ref()
        .and_then(as_u64)
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
    SystemTime::now() + Duration::from_secs(lifetime)
}

impl TokenCredential for ManagedIdentityCredential {
    fn kind(&self) -> CredentialKind {
        CredentialKind::ManagedIdentity
    }

    fn get_token<'a>(
        &'a self,
        scopes: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<AccessToken>> + Send + 'a>> {
        Box::pin(async move {
            let [scope] = scopes else {
                return Err(Error::Configuration(format!(
                    "managed identity supports exactly one scope per token, got {}",
                    scopes.len()
                )));
            };
            let resource = resource_for_scope(scope);
            let response = self.request(resource).await?;
            let expires_on = expiry(&response);
            debug!(resource, "managed identity token acquired");
            Ok(AccessToken::new(
                response.access_token,
                expires_on,
                scopes.to_vec(),
            ))
        })
    }
}
