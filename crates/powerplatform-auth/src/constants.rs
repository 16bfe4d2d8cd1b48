//! Identity platform constants
//!
//! Fixed values defined by Microsoft Entra ID, Azure managed identity and the
//! GitHub Actions OIDC provider. None of these are secrets.

/// `client_assertion_type` for certificate and federated credentials
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Audience requested from the CI OIDC provider for workload identity federation
pub const OIDC_AUDIENCE: &str = "api://AzureADTokenExchange";

/// Upper bound on an OIDC assertion read from a file or an HTTP endpoint.
/// Real assertions are a few KiB; anything larger is rejected.
pub const MAX_ASSERTION_BYTES: usize = 64 * 1024;

/// Lifetime of a signed client assertion
pub const CLIENT_ASSERTION_LIFETIME_SECS: u64 = 600;

/// Azure Instance Metadata Service token endpoint. IMDS only speaks plain HTTP.
pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

pub const IMDS_API_VERSION: &str = "2018-02-01";

/// API version for App Service / Functions managed identity endpoints
pub const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// Env vars set by App Service / Functions when managed identity is enabled
pub const IDENTITY_ENDPOINT_ENV: &str = "IDENTITY_ENDPOINT";
pub const IDENTITY_HEADER_ENV: &str = "IDENTITY_HEADER";

/// Suffix that turns a resource URI into a v2 scope
pub const DEFAULT_SCOPE_SUFFIX: &str = "/.default";

/// Token lifetime assumed when the identity platform omits one
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;
