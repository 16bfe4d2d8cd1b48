//! Provider configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. Secret values
//! (client secret, certificate bundle, OIDC tokens) are never read from the
//! TOML directly; they come from env vars or from `*_file` paths named in the
//! TOML, so a checked-in config file cannot leak credentials.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::secret::Secret;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth: AuthSettings,
    pub cloud: CloudSettings,
    pub retry: RetrySettings,
    pub lro: LroSettings,
    pub timeouts: TimeoutSettings,
    /// Drops the per-process `x-ms-client-session-id` header.
    pub telemetry_optout: bool,
}

/// Credential inputs. Which credential is used is decided by the auth crate.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret
    pub client_secret_file: Option<PathBuf>,
    /// Base64 encoded PKCS#12 or PEM bundle
    #[serde(skip)]
    pub client_certificate: Option<Secret<String>>,
    /// Path to a PKCS#12 or PEM bundle on disk
    pub client_certificate_file_path: Option<PathBuf>,
    #[serde(skip)]
    pub client_certificate_password: Option<Secret<String>>,
    pub use_oidc: bool,
    pub oidc_request_url: Option<String>,
    #[serde(skip)]
    pub oidc_request_token: Option<Secret<String>>,
    #[serde(skip)]
    pub oidc_token: Option<Secret<String>>,
    pub oidc_token_file_path: Option<PathBuf>,
    pub use_msi: bool,
    pub use_cli: bool,
}

/// National cloud selector.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cloud {
    #[default]
    Public,
    Gcc,
    Gcchigh,
    Dod,
    China,
}

impl Cloud {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "gcc" => Ok(Self::Gcc),
            "gcchigh" => Ok(Self::Gcchigh),
            "dod" => Ok(Self::Dod),
            "china" => Ok(Self::China),
            other => Err(Error::Config(format!("unknown cloud: {other}"))),
        }
    }

    /// Well-known endpoints for this cloud.
    pub fn endpoints(self) -> CloudConfig {
        let (authority, bapi, powerapps, powerplatform, powerapps_scope, powerplatform_scope) =
            match self {
                Cloud::Public => (
                    "https://login.microsoftonline.com",
                    "api.bap.microsoft.com",
                    "api.powerapps.com",
                    "api.powerplatform.com",
                    "https://service.powerapps.com/",
                    "https://api.powerplatform.com/",
                ),
                Cloud::Gcc => (
                    "https://login.microsoftonline.com",
                    "gov.api.bap.microsoft.us",
                    "gov.api.powerapps.us",
                    "api.gov.powerplatform.microsoft.us",
                    "https://gov.service.powerapps.us/",
                    "https://api.gov.powerplatform.microsoft.us/",
                ),
                Cloud::Gcchigh => (
                    "https://login.microsoftonline.us",
                    "high.api.bap.microsoft.us",
                    "high.api.powerapps.us",
                    "api.high.powerplatform.microsoft.us",
                    "https://high.service.powerapps.us/",
                    "https://api.high.powerplatform.microsoft.us/",
                ),
                Cloud::Dod => (
                    "https://login.microsoftonline.us",
                    "api.bap.appsplatform.us",
                    "api.powerapps.appsplatform.us",
                    "api.appsplatform.us",
                    "https://service.apps.appsplatform.us/",
                    "https://api.appsplatform.us/",
                ),
                Cloud::China => (
                    "https://login.chinacloudapi.cn",
                    "api.bap.partner.microsoftonline.cn",
                    "api.powerapps.cn",
                    "api.powerplatform.partner.microsoftonline.cn",
                    "https://service.powerapps.cn/",
                    "https://api.powerplatform.partner.microsoftonline.cn/",
                ),
            };
        CloudConfig {
            authority_host: authority.to_string(),
            bapi_host: bapi.to_string(),
            powerapps_host: powerapps.to_string(),
            powerplatform_host: powerplatform.to_string(),
            powerapps_scope: powerapps_scope.to_string(),
            powerplatform_scope: powerplatform_scope.to_string(),
        }
    }
}

/// Cloud selection plus optional per-endpoint overrides.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct CloudSettings {
    pub name: Cloud,
    pub authority_host: Option<String>,
    pub bapi_host: Option<String>,
    pub powerapps_host: Option<String>,
    pub powerplatform_host: Option<String>,
}

/// Resolved endpoints. Hosts are bare hostnames; the authority and the
/// scopes are absolute URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudConfig {
    pub authority_host: String,
    pub bapi_host: String,
    pub powerapps_host: String,
    pub powerplatform_host: String,
    pub powerapps_scope: String,
    pub powerplatform_scope: String,
}

impl CloudConfig {
    /// OAuth2 scope for BAPI and Power Apps calls.
    pub fn bapi_scope(&self) -> String {
        format!("{}.default", self.powerapps_scope)
    }

    /// OAuth2 scope for api.powerplatform.com calls (Power Pages, tenant settings).
    pub fn powerplatform_default_scope(&self) -> String {
        format!("{}.default", self.powerplatform_scope)
    }

    /// OAuth2 scope for a Dataverse environment, derived from its instance URL.
    pub fn dataverse_scope(instance_url: &str) -> String {
        format!("{}/.default", instance_url.trim_end_matches('/'))
    }
}

/// Retry controller tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    pub jitter_fraction: f64,
    pub retry_after_cap_secs: u64,
    /// Optional wall-clock cap across all attempts of one call
    pub max_elapsed_secs: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 1000,
            max_delay_secs: 60,
            jitter_fraction: 0.2,
            retry_after_cap_secs: 120,
            max_elapsed_secs: None,
        }
    }
}

/// Long-running operation polling tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LroSettings {
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
}

impl Default for LroSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            max_wait_secs: 30 * 60,
        }
    }
}

/// Per-operation budgets, mirroring create/read/update/delete timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub create_secs: u64,
    pub read_secs: u64,
    pub update_secs: u64,
    pub delete_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            create_secs: 20 * 60,
            read_secs: 5 * 60,
            update_secs: 20 * 60,
            delete_secs: 20 * 60,
        }
    }
}

impl TimeoutSettings {
    pub fn create(&self) -> Duration {
        Duration::from_secs(self.create_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn update(&self) -> Duration {
        Duration::from_secs(self.update_secs)
    }

    pub fn delete(&self) -> Duration {
        Duration::from_secs(self.delete_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.read_secret_files()?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from environment variables only.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.read_secret_files()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from an environment lookup. Env always wins over the file.
    ///
    /// OIDC settings accept both the `ARM_*` names and the GitHub Actions
    /// names, the former taking precedence.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let auth = &mut self.auth;

        if let Some(v) = get("POWER_PLATFORM_TENANT_ID") {
            auth.tenant_id = Some(v);
        }
        if let Some(v) = get("POWER_PLATFORM_CLIENT_ID") {
            auth.client_id = Some(v);
        }
        if let Some(v) = get("POWER_PLATFORM_CLIENT_SECRET") {
            auth.client_secret = Some(Secret::new(v));
        }
        if let Some(v) = get("POWER_PLATFORM_CLIENT_CERTIFICATE") {
            auth.client_certificate = Some(Secret::new(v));
        }
        if let Some(v) = get("POWER_PLATFORM_CLIENT_CERTIFICATE_FILE_PATH") {
            auth.client_certificate_file_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("POWER_PLATFORM_CLIENT_CERTIFICATE_PASSWORD") {
            auth.client_certificate_password = Some(Secret::new(v));
        }
        if let Some(v) = get("POWER_PLATFORM_USE_OIDC") {
            auth.use_oidc = parse_bool("POWER_PLATFORM_USE_OIDC", &v)?;
        }
        if let Some(v) = get("POWER_PLATFORM_USE_MSI") {
            auth.use_msi = parse_bool("POWER_PLATFORM_USE_MSI", &v)?;
        }
        if let Some(v) = get("POWER_PLATFORM_USE_CLI") {
            auth.use_cli = parse_bool("POWER_PLATFORM_USE_CLI", &v)?;
        }
        if let Some(v) = get("ARM_OIDC_REQUEST_URL").or_else(|| get("ACTIONS_ID_TOKEN_REQUEST_URL"))
        {
            auth.oidc_request_url = Some(v);
        }
        if let Some(v) =
            get("ARM_OIDC_REQUEST_TOKEN").or_else(|| get("ACTIONS_ID_TOKEN_REQUEST_TOKEN"))
        {
            auth.oidc_request_token = Some(Secret::new(v));
        }
        if let Some(v) = get("ARM_OIDC_TOKEN") {
            auth.oidc_token = Some(Secret::new(v));
        }
        if let Some(v) =
            get("ARM_OIDC_TOKEN_FILE_PATH").or_else(|| get("AZURE_FEDERATED_TOKEN_FILE"))
        {
            auth.oidc_token_file_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("POWER_PLATFORM_CLOUD") {
            self.cloud.name = Cloud::parse(&v)?;
        }
        if let Some(v) = get("POWER_PLATFORM_TELEMETRY_OPTOUT") {
            self.telemetry_optout = parse_bool("POWER_PLATFORM_TELEMETRY_OPTOUT", &v)?;
        }
        Ok(())
    }

    /// Read `client_secret_file` unless a secret already came from the env.
    fn read_secret_files(&mut self) -> Result<()> {
        if self.auth.client_secret.is_some() {
            return Ok(());
        }
        if let Some(ref secret_file) = self.auth.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                debug!(path = %secret_file.display(), "client secret loaded from file");
                self.auth.client_secret = Some(Secret::new(secret));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("tenant_id", &self.auth.tenant_id),
            ("client_id", &self.auth.client_id),
        ] {
            if let Some(v) = value
                && v.trim().is_empty()
            {
                return Err(Error::Config(format!("{name} must not be empty")));
            }
        }

        if let Some(ref authority) = self.cloud.authority_host
            && !authority.starts_with("https://")
        {
            return Err(Error::Config(format!(
                "authority_host must start with https://, got: {authority}"
            )));
        }

        for (name, host) in [
            ("bapi_host", &self.cloud.bapi_host),
            ("powerapps_host", &self.cloud.powerapps_host),
            ("powerplatform_host", &self.cloud.powerplatform_host),
        ] {
            if let Some(h) = host
                && (h.contains("://") || h.contains('/'))
            {
                return Err(Error::Config(format!(
                    "{name} must be a bare hostname, got: {h}"
                )));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::Config(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(Error::Config(
                "retry.jitter_fraction must be between 0 and 1".into(),
            ));
        }
        if self.lro.poll_interval_secs == 0 {
            return Err(Error::Config(
                "lro.poll_interval_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Endpoints for the selected cloud with overrides applied.
    pub fn cloud_config(&self) -> CloudConfig {
        let mut cloud = self.cloud.name.endpoints();
        if let Some(ref v) = self.cloud.authority_host {
            cloud.authority_host = v.trim_end_matches('/').to_string();
        }
        if let Some(ref v) = self.cloud.bapi_host {
            cloud.bapi_host = v.clone();
        }
        if let Some(ref v) = self.cloud.powerapps_host {
            cloud.powerapps_host = v.clone();
        }
        if let Some(ref v) = self.cloud.powerplatform_host {
            cloud.powerplatform_host = v.clone();
        }
        cloud
    }

    /// Resolve config file path from CLI arg or PP_CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("PP_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("power-platform.toml")
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(Error::Config(format!("{key}: expected a boolean, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serializes tests that touch process environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn valid_toml() -> &'static str {
        r#"
telemetry_optout = true

[auth]
tenant_id = "00000000-0000-0000-0000-000000000001"
client_id = "00000000-0000-0000-0000-000000000002"

[cloud]
name = "gcchigh"

[retry]
max_attempts = 4
"#
    }

    #[test]
    fn load_valid_config() {
        let mut config: Config = toml::from_str(valid_toml()).unwrap();
        config.apply_env_from(lookup(&[])).unwrap();
        config.validate().unwrap();

        assert!(config.telemetry_optout);
        assert_eq!(config.cloud.name, Cloud::Gcchigh);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.retry_after_cap_secs, 120);
        assert_eq!(config.timeouts.read_secs, 300);
        assert!(config.auth.client_secret.is_none());
        assert_eq!(
            config.cloud_config().authority_host,
            "https://login.microsoftonline.us"
        );
    }

    #[test]
    fn load_reads_file_from_disk() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, valid_toml()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.retry.max_attempts, 4);
    }

    #[test]
    fn load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not valid {{{{ toml").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config: Config = toml::from_str(valid_toml()).unwrap();
        config
            .apply_env_from(lookup(&[
                ("POWER_PLATFORM_TENANT_ID", "tenant-from-env"),
                ("POWER_PLATFORM_CLIENT_SECRET", "s3cr3t"),
                ("POWER_PLATFORM_USE_CLI", "true"),
                ("POWER_PLATFORM_CLOUD", "china"),
            ]))
            .unwrap();

        assert_eq!(config.auth.tenant_id.as_deref(), Some("tenant-from-env"));
        assert_eq!(config.auth.client_secret.as_ref().unwrap().expose(), "s3cr3t");
        assert!(config.auth.use_cli);
        assert_eq!(config.cloud.name, Cloud::China);
    }

    #[test]
    fn arm_oidc_names_win_over_github_names() {
        let mut config = Config::default();
        config
            .apply_env_from(lookup(&[
                ("ARM_OIDC_REQUEST_URL", "https://arm.example/token"),
                ("ACTIONS_ID_TOKEN_REQUEST_URL", "https://gh.example/token"),
                ("ACTIONS_ID_TOKEN_REQUEST_TOKEN", "gh-bearer"),
            ]))
            .unwrap();

        assert_eq!(
            config.auth.oidc_request_url.as_deref(),
            Some("https://arm.example/token")
        );
        assert_eq!(
            config.auth.oidc_request_token.as_ref().unwrap().expose(),
            "gh-bearer"
        );
    }

    #[test]
    fn invalid_boolean_env_rejected() {
        let mut config = Config::default();
        let result = config.apply_env_from(lookup(&[("POWER_PLATFORM_USE_MSI", "maybe")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn unknown_cloud_rejected() {
        assert!(Cloud::parse("mars").is_err());
        assert_eq!(Cloud::parse(" DoD ").unwrap(), Cloud::Dod);
    }

    #[test]
    fn empty_tenant_rejected() {
        let mut config = Config::default();
        config.auth.tenant_id = Some("  ".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn http_authority_rejected() {
        let mut config = Config::default();
        config.cloud.authority_host = Some("http://login.example".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn host_override_must_be_bare() {
        let mut config = Config::default();
        config.cloud.bapi_host = Some("https://api.bap.microsoft.com".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_applied_to_cloud_config() {
        let mut config = Config::default();
        config.cloud.authority_host = Some("https://login.example.test/".into());
        config.cloud.powerplatform_host = Some("pp.example.test".into());
        let cloud = config.cloud_config();
        assert_eq!(cloud.authority_host, "https://login.example.test");
        assert_eq!(cloud.powerplatform_host, "pp.example.test");
        assert_eq!(cloud.bapi_host, "api.bap.microsoft.com");
    }

    #[test]
    fn scopes_derived_from_cloud() {
        let cloud = Cloud::Public.endpoints();
        assert_eq!(cloud.bapi_scope(), "https://service.powerapps.com/.default");
        assert_eq!(
            cloud.powerplatform_default_scope(),
            "https://api.powerplatform.com/.default"
        );
        assert_eq!(
            CloudConfig::dataverse_scope("https://org.crm.dynamics.com/"),
            "https://org.crm.dynamics.com/.default"
        );
    }

    #[test]
    fn client_secret_file_is_read_and_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("secret");
        std::fs::write(&secret_path, "from-file\n").unwrap();

        let mut config = Config::default();
        config.auth.client_secret_file = Some(secret_path);
        config.read_secret_files().unwrap();
        assert_eq!(
            config.auth.client_secret.as_ref().unwrap().expose(),
            "from-file"
        );
    }

    #[test]
    fn env_secret_beats_secret_file() {
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("secret");
        std::fs::write(&secret_path, "from-file").unwrap();

        let mut config = Config::default();
        config.auth.client_secret_file = Some(secret_path);
        config
            .apply_env_from(lookup(&[("POWER_PLATFORM_CLIENT_SECRET", "from-env")]))
            .unwrap();
        config.read_secret_files().unwrap();
        assert_eq!(
            config.auth.client_secret.as_ref().unwrap().expose(),
            "from-env"
        );
    }

    #[test]
    fn resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        assert_eq!(
            Config::resolve_path(Some("/cli/wins.toml")),
            PathBuf::from("/cli/wins.toml")
        );
        // SAFETY: ENV_MUTEX is held for the duration of the mutation.
        unsafe { std::env::set_var("PP_CONFIG_PATH", "/env/path.toml") };
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("/env/path.toml")
        );
        unsafe { std::env::remove_var("PP_CONFIG_PATH") };
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("power-platform.toml")
        );
    }

    #[test]
    fn timeouts_convert_to_durations() {
        let timeouts = TimeoutSettings::default();
        assert_eq!(timeouts.create(), Duration::from_secs(1200));
        assert_eq!(timeouts.read(), Duration::from_secs(300));
    }
}
