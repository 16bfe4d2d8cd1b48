//! Azure CLI passthrough credential
//!
//! Shells out to `az account get-access-token` and reuses whatever identity
//! the developer is logged in with. Meant for local use only.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{Local, NaiveDateTime, TimeZone};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::credentials::{CredentialKind, TokenCredential};
use crate::error::{Error, Result};
use crate::token::AccessToken;

const AZ_PROGRAM: &str = "az";
const CLI_TIMEOUT: Duration = Duration::from_secs(30);

/// Output of `az account get-access-token --output json`.
///
/// Older CLI versions only emit `expiresOn`, a naive local timestamp.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliTokenOutput {
    access_token: String,
    #[serde(default)]
    expires_on: Option<String>,
    #[serde(default, rename = "expires_on")]
    expires_on_epoch: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AzureCliCredential {
    tenant_id: Option<String>,
    program: String,
    timeout: Duration,
}

impl AzureCliCredential {
    pub fn new(tenant_id: Option<String>) -> Self {
        Self {
            tenant_id,
            program: AZ_PROGRAM.to_string(),
            timeout: CLI_TIMEOUT,
        }
    }

    /// Override the executable, mostly useful for tests.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self, scopes: &[String]) -> Result<Vec<String>> {
        let mut args = vec![
            "account".to_string(),
            "get-access-token".to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        for scope in scopes {
            args.push("--scope".to_string());
            args.push(scope.clone());
        }
        if let Some(ref tenant) = self.tenant_id {
            if !is_valid_tenant(tenant) {
                return Err(Error::Configuration(format!(
                    "invalid tenant id for Azure CLI: {tenant}"
                )));
            }
            args.push("--tenant".to_string());
            args.push(tenant.clone());
        }
        Ok(args)
    }
}

fn is_valid_tenant(tenant: &str) -> bool {
    !tenant.is_empty()
        && tenant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Parse the CLI's JSON output into an access token.
pub fn parse_cli_output(stdout: &[u8], scopes: &[String]) -> Result<AccessToken> {
    let output: CliTokenOutput = serde_json::from_slice(stdout)
        .map_err(|e| Error::Authentication(format!("unexpected Azure CLI output: {e}")))?;

    let expires_on = if let Some(epoch) = output.expires_on_epoch {
        let secs = u64::try_from(epoch)
            .map_err(|_| Error::Authentication(format!("invalid expires_on: {epoch}")))?;
        UNIX_EPOCH + Duration::from_secs(secs)
    } else if let Some(ref local) = output.expires_on {
        parse_local_timestamp(local)?
    } else {
        return Err(Error::Authentication(
            "Azure CLI output has no expiry".into(),
        ));
    };

    Ok(AccessToken::new(
        output.access_token,
        expires_on,
        scopes.to_vec(),
    ))
}

fn parse_local_timestamp(value: &str) -> Result<SystemTime> {
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|e| Error::Authentication(format!("invalid expiresOn {value}: {e}")))?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| Error::Authentication(format!("expiresOn {value} is not a valid local time")))?;
    Ok(SystemTime::from(local))
}

impl TokenCredential for AzureCliCredential {
    fn kind(&self) -> CredentialKind {
        CredentialKind::CliPassthrough
    }

    fn get_token<'a>(
        &'a self,
        scopes: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<AccessToken>> + Send + 'a>> {
        Box::pin(async move {
            let args = self.args(scopes)?;
            let child = Command::new(&self.program)
                .args(&args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output();

            let output = match tokio::time::timeout(self.timeout, child).await {
                Err(_) => {
                    return Err(Error::Authentication(format!(
                        "Azure CLI did not respond within {}s",
                        self.timeout.as_secs()
                    )));
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::Configuration(format!(
                        "Azure CLI ({}) not found on PATH",
                        self.program
                    )));
                }
                Ok(Err(e)) => return Err(Error::Io(format!("running Azure CLI: {e}"))),
                Ok(Ok(output)) => output,
            };

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::Authentication(format!(
                    "Azure CLI exited with {}: {}",
                    output.status,
                    stderr.trim()
                )));
            }

            debug!(scopes = ?scopes, "token acquired from Azure CLI");
            parse_cli_output(&output.stdout, scopes)
        })
    }
}
