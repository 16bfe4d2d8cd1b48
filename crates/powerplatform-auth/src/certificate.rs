//! Client certificate credentials
//!
//! Decodes a base64 PKCS#12 or PEM bundle into an RSA signing key and the
//! leaf certificate, then proves possession of the key by signing a short
//! lived client assertion (RFC 7523) for every token request. The leaf
//! certificate's SHA-256 thumbprint goes into the `x5t#S256` header so the
//! identity platform can pick the matching registered certificate.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use common::Secret;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::constants::CLIENT_ASSERTION_LIFETIME_SECS;
use crate::credentials::{CredentialKind, TokenCredential};
use crate::error::{Error, Result};
use crate::token::{AccessToken, exchange_client_assertion};

const PEM_PREFIX: &[u8] = b"-----BEGIN";

/// Private key and leaf certificate extracted from a bundle.
#[derive(Clone)]
pub struct ClientCertificate {
    key: EncodingKey,
    leaf_der: Vec<u8>,
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("key", &common::REDACTED)
            .field("thumbprint", &self.thumbprint_s256())
            .finish()
    }
}

/// Claims of the client assertion JWT.
#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    aud: &'a str,
    iss: &'a str,
    sub: &'a str,
    jti: String,
    iat: u64,
    nbf: u64,
    exp: u64,
}

impl ClientCertificate {
    /// Decode a base64 encoded PKCS#12 or PEM bundle.
    pub fn from_base64(encoded: &str, password: Option<&Secret<String>>) -> Result<Self> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| Error::InvalidCredential(format!("client certificate is not valid base64: {e}")))?;
        Self::from_bytes(&bytes, password)
    }

    /// Decode raw bundle bytes, as read from a certificate file.
    pub fn from_bytes(bytes: &[u8], password: Option<&Secret<String>>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidCredential("client certificate is empty".into()));
        }
        let trimmed = trim_leading_whitespace(bytes);
        if trimmed.starts_with(PEM_PREFIX) {
            Self::from_pem(trimmed)
        } else {
            Self::from_pkcs12(bytes, password)
        }
    }

    fn from_pem(bytes: &[u8]) -> Result<Self> {
        let blocks = pem::parse_many(bytes)
            .map_err(|e| Error::InvalidCredential(format!("malformed PEM bundle: {e}")))?;

        if blocks.iter().any(|b| b.tag() == "ENCRYPTED PRIVATE KEY") {
            return Err(Error::InvalidCredential(
                "encrypted PEM private keys are not supported, use a PKCS#12 bundle".into(),
            ));
        }

        let key_block = blocks
            .iter()
            .find(|b| b.tag() == "PRIVATE KEY" || b.tag() == "RSA PRIVATE KEY")
            .ok_or_else(|| Error::InvalidCredential("PEM bundle contains no private key".into()))?;
        let leaf = blocks
            .iter()
            .find(|b| b.tag() == "CERTIFICATE")
            .ok_or_else(|| Error::InvalidCredential("PEM bundle contains no certificate".into()))?;

        let key_pem = Secret::new(pem::encode(key_block));
        Self::build(&key_pem, leaf.contents().to_vec())
    }

    fn from_pkcs12(bytes: &[u8], password: Option<&Secret<String>>) -> Result<Self> {
        let password = password.map(|p| p.expose().as_str()).unwrap_or("");
        let keystore = p12_keystore::KeyStore::from_pkcs12(bytes, password)
            .map_err(|e| Error::InvalidCredential(format!("cannot read PKCS#12 bundle: {e}")))?;

        let (alias, chain) = keystore.private_key_chain().ok_or_else(|| {
            Error::InvalidCredential("PKCS#12 bundle contains no private key".into())
        })?;
        let leaf = chain.chain().first().ok_or_else(|| {
            Error::InvalidCredential(format!("PKCS#12 entry {alias} has no certificate"))
        })?;

        // PKCS#12 stores the key as PKCS#8 DER; re-armor it for the signer.
        let key_pem = Secret::new(pem::encode(&pem::Pem::new(
            "PRIVATE KEY",
            chain.key().to_vec(),
        )));
        debug!(alias, "decoded PKCS#12 client certificate");
        Self::build(&key_pem, leaf.as_der().to_vec())
    }

    fn build(key_pem: &Secret<String>, leaf_der: Vec<u8>) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(key_pem.expose().as_bytes())
            .map_err(|e| Error::InvalidCredential(format!("unsupported private key: {e}")))?;
        Ok(Self { key, leaf_der })
    }

    /// Base64url SHA-256 thumbprint of the leaf certificate.
    pub fn thumbprint_s256(&self) -> String {
        thumbprint_s256(&self.leaf_der)
    }

    /// Sign a client assertion for the given token endpoint.
    pub fn client_assertion(&self, client_id: &str, audience: &str) -> Result<Secret<String>> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = AssertionClaims {
            aud: audience,
            iss: client_id,
            sub: client_id,
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now,
            nbf: now,
            exp: now + CLIENT_ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::PS256);
        header.x5t_s256 = Some(self.thumbprint_s256());

        jsonwebtoken::encode(&header, &claims, &self.key)
            .map(Secret::new)
            .map_err(|e| Error::InvalidCredential(format!("signing client assertion: {e}")))
    }
}

fn thumbprint_s256(der: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(der))
}

fn trim_leading_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Certificate based service principal.
#[derive(Debug)]
pub struct ClientCertificateCredential {
    endpoint: String,
    client_id: String,
    certificate: ClientCertificate,
    http: reqwest::Client,
}

impl ClientCertificateCredential {
    pub fn new(
        endpoint: String,
        client_id: String,
        certificate: ClientCertificate,
        http: reqwest::Client,
    ) -> Self {
        Self {
            endpoint,
            client_id,
            certificate,
            http,
        }
    }
}

impl TokenCredential for ClientCertificateCredential {
    fn kind(&self) -> CredentialKind {
        CredentialKind::ClientCertificate
    }

    fn get_token<'a>(
        &'a self,
        scopes: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<AccessToken>> + Send + 'a>> {
        Box::pin(async move {
            let assertion = self
                .certificate
                .client_assertion(&self.client_id, &self.endpoint)?;
            exchange_client_assertion(&self.http, &self.endpoint, &self.client_id, &assertion, scopes)
                .await
        })
    }
}
