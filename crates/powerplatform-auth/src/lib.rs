//! Power Platform authentication library
//!
//! Turns provider settings into a single credential and acquires Entra ID
//! access tokens with it. No caching happens here; the API crate wraps the
//! credential in a token cache.
//!
//! Credential flow:
//! 1. `credentials::resolve_credential()` picks a method by precedence
//! 2. Caller holds the result as `Arc<dyn TokenCredential>`
//! 3. `TokenCredential::get_token()` runs the method's exchange:
//!    - client secret / certificate / OIDC: `token` endpoint form POST
//!    - managed identity: App Service or IMDS local endpoint
//!    - Azure CLI: `az account get-access-token`

pub mod certificate;
pub mod cli;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod managed_identity;
pub mod oidc;
pub mod token;

pub use certificate::{ClientCertificate, ClientCertificateCredential};
pub use cli::AzureCliCredential;
pub use constants::*;
pub use credentials::{
    ClientSecretCredential, Credential, CredentialKind, TokenCredential, resolve_credential,
};
pub use error::{Error, Result};
pub use managed_identity::ManagedIdentityCredential;
pub use oidc::{AssertionSource, OidcCredential};
pub use token::{AccessToken, TokenResponse, token_endpoint};
