//! Credential kinds and precedence resolution
//!
//! Exactly one credential is resolved per provider instance and never changes
//! afterwards. Precedence when several methods are configured:
//! client secret > client certificate > OIDC > managed identity > Azure CLI.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use common::{AuthSettings, CloudConfig, Secret};
use tracing::info;

use crate::certificate::{ClientCertificate, ClientCertificateCredential};
use crate::cli::AzureCliCredential;
use crate::error::{Error, Result};
use crate::managed_identity::ManagedIdentityCredential;
use crate::oidc::{AssertionSource, OidcCredential};
use crate::token::{AccessToken, exchange_client_secret, token_endpoint};

/// Which authentication method a credential uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    ClientSecret,
    ClientCertificate,
    Oidc,
    ManagedIdentity,
    CliPassthrough,
}

impl CredentialKind {
    pub fn label(self) -> &'static str {
        match self {
            CredentialKind::ClientSecret => "client_secret",
            CredentialKind::ClientCertificate => "client_certificate",
            CredentialKind::Oidc => "oidc",
            CredentialKind::ManagedIdentity => "managed_identity",
            CredentialKind::CliPassthrough => "azure_cli",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Something that can produce an access token for a set of scopes.
///
/// Uses `Pin<Box<dyn Future>>` so the trait stays dyn-compatible and can be
/// shared as `Arc<dyn TokenCredential>`.
pub trait TokenCredential: Send + Sync {
    fn kind(&self) -> CredentialKind;

    fn get_token<'a>(
        &'a self,
        scopes: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<AccessToken>> + Send + 'a>>;
}

/// Service principal with a shared secret.
#[derive(Debug)]
pub struct ClientSecretCredential {
    endpoint: String,
    client_id: String,
    secret: Secret<String>,
    http: reqwest::Client,
}

impl ClientSecretCredential {
    pub fn new(
        endpoint: String,
        client_id: String,
        secret: Secret<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            endpoint,
            client_id,
            secret,
            http,
        }
    }
}

impl TokenCredential for ClientSecretCredential {
    fn kind(&self) -> CredentialKind {
        CredentialKind::ClientSecret
    }

    fn get_token<'a>(
        &'a self,
        scopes: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<AccessToken>> + Send + 'a>> {
        Box::pin(exchange_client_secret(
            &self.http,
            &self.endpoint,
            &self.client_id,
            &self.secret,
            scopes,
        ))
    }
}

/// The resolved credential for a provider instance.
#[derive(Debug)]
pub enum Credential {
    ClientSecret(ClientSecretCredential),
    ClientCertificate(ClientCertificateCredential),
    Oidc(OidcCredential),
    ManagedIdentity(ManagedIdentityCredential),
    CliPassthrough(AzureCliCredential),
}

impl TokenCredential for Credential {
    fn kind(&self) -> CredentialKind {
        match self {
            Credential::ClientSecret(c) => c.kind(),
            Credential::ClientCertificate(c) => c.kind(),
            Credential::Oidc(c) => c.kind(),
            Credential::ManagedIdentity(c) => c.kind(),
            Credential::CliPassthrough(c) => c.kind(),
        }
    }

    fn get_token<'a>(
        &'a self,
        scopes: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<AccessToken>> + Send + 'a>> {
        match self {
            Credential::ClientSecret(c) => c.get_token(scopes),
            Credential::ClientCertificate(c) => c.get_token(scopes),
            Credential::Oidc(c) => c.get_token(scopes),
            Credential::ManagedIdentity(c) => c.get_token(scopes),
            Credential::CliPassthrough(c) => c.get_token(scopes),
        }
    }
}

/// Tenant and client id, both required by every service principal method.
fn principal<'a>(auth: &'a AuthSettings, method: &str) -> Result<(&'a str, &'a str)> {
    let tenant = auth.tenant_id.as_deref().ok_or_else(|| {
        Error::Configuration(format!("tenant_id is required for {method} authentication"))
    })?;
    let client = auth.client_id.as_deref().ok_or_else(|| {
        Error::Configuration(format!("client_id is required for {method} authentication"))
    })?;
    Ok((tenant, client))
}

fn load_certificate(auth: &AuthSettings) -> Result<Option<ClientCertificate>> {
    let password = auth.client_certificate_password.as_ref();
    if let Some(ref encoded) = auth.client_certificate {
        return ClientCertificate::from_base64(encoded.expose(), password).map(Some);
    }
    if let Some(ref path) = auth.client_certificate_file_path {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::Io(format!("reading client certificate {}: {e}", path.display()))
        })?;
        return ClientCertificate::from_bytes(&bytes, password).map(Some);
    }
    Ok(None)
}

fn assertion_source(auth: &AuthSettings) -> Result<AssertionSource> {
    if let Some(ref token) = auth.oidc_token {
        return Ok(AssertionSource::Token(token.clone()));
    }
    if let Some(ref path) = auth.oidc_token_file_path {
        return Ok(AssertionSource::File(path.clone()));
    }
    match (&auth.oidc_request_url, &auth.oidc_request_token) {
        (Some(url), Some(bearer)) => Ok(AssertionSource::Request {
            url: url.clone(),
            bearer: bearer.clone(),
        }),
        (Some(_), None) => Err(Error::Configuration(
            "oidc_request_url is set but oidc_request_token is missing".into(),
        )),
        _ => Err(Error::Configuration(
            "use_oidc requires oidc_token, oidc_token_file_path or oidc_request_url".into(),
        )),
    }
}

/// Pick the credential method from the settings.
///
/// Certificate material is decoded here, so a corrupt bundle fails at
/// configuration time rather than on the first request.
pub fn resolve_credential(
    auth: &AuthSettings,
    cloud: &CloudConfig,
    http: reqwest::Client,
) -> Result<Credential> {
    let credential = if let Some(ref secret) = auth.client_secret {
        let (tenant, client) = principal(auth, "client secret")?;
        if secret.is_blank() {
            return Err(Error::Configuration("client_secret is empty".into()));
        }
        Credential::ClientSecret(ClientSecretCredential::new(
            token_endpoint(&cloud.authority_host, tenant),
            client.to_string(),
            secret.clone(),
            http,
        ))
    } else if let Some(certificate) = load_certificate(auth)? {
        let (tenant, client) = principal(auth, "client certificate")?;
        Credential::ClientCertificate(ClientCertificateCredential::new(
            token_endpoint(&cloud.authority_host, tenant),
            client.to_string(),
            certificate,
            http,
        ))
    } else if auth.use_oidc {
        let (tenant, client) = principal(auth, "OIDC")?;
        Credential::Oidc(OidcCredential::new(
            token_endpoint(&cloud.authority_host, tenant),
            client.to_string(),
            assertion_source(auth)?,
            http,
        ))
    } else if auth.use_msi {
        Credential::ManagedIdentity(ManagedIdentityCredential::from_env(
            auth.client_id.clone(),
            http,
        ))
    } else if auth.use_cli {
        Credential::CliPassthrough(AzureCliCredential::new(auth.tenant_id.clone()))
    } else {
        return Err(Error::Configuration(
            "no authentication method configured: set a client secret, a client certificate, \
             use_oidc, use_msi or use_cli"
                .into(),
        ));
    };

    info!(method = credential.kind().label(), "credential resolved");
    Ok(credential)
}
