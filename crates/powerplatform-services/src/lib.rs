//! Typed clients for Power Platform admin APIs
//!
//! Each client wraps a shared `powerplatform_api::Client` and knows the URLs,
//! scopes, acceptable statuses and payloads of one service area:
//! - `EnvironmentClient`: BAPI environments and their Dataverse instance URL
//! - `ApplicationUserClient`: Dataverse application users and security roles
//! - `PowerPagesClient`: Power Pages websites (asynchronous create/delete)
//! - `TenantSettingsClient`: tenant settings with field-wise merging

pub mod application_user;
pub mod environment;
pub mod error;
pub mod powerpages;
pub mod tenant_settings;

#[cfg(test)]
mod testing;

pub use application_user::{
    ApplicationUserClient, ApplicationUserDto, ApplicationUserUpdate, SecurityRoleDto,
};
pub use environment::{EnvironmentClient, EnvironmentDto, LinkedEnvironmentMetadata};
pub use error::{Error, Result};
pub use powerpages::{PowerPagesClient, WebsiteCreateDto, WebsiteDto};
pub use tenant_settings::{MergeSettings, TenantSettingsClient, TenantSettingsDto};

pub(crate) const BAPI_API_VERSION: &str = "2023-06-01";
pub(crate) const DATAVERSE_API_PATH: &str = "/api/data/v9.2";

/// Append query parameters to `base`, percent-encoding them.
pub(crate) fn build_url(base: &str, query: &[(&str, &str)]) -> Result<String> {
    reqwest::Url::parse_with_params(base, query)
        .map(String::from)
        .map_err(|e| Error::Validation(format!("invalid URL {base}: {e}")))
}

/// An identifier that is safe to splice into a URL path.
pub(crate) fn path_segment<'a>(what: &str, value: &'a str) -> Result<&'a str> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && value != "."
        && value != "..";
    if ok {
        Ok(value)
    } else {
        Err(Error::Validation(format!("{what} {value:?} is not a valid identifier")))
    }
}

/// A Dataverse record id. Braces and case are normalised away.
pub(crate) fn guid(what: &str, value: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(value.trim_matches(|c| c == '{' || c == '}'))
        .map_err(|_| Error::Validation(format!("{what} {value:?} is not a GUID")))
}
