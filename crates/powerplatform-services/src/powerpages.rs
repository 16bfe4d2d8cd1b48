//! Power Pages websites
//!
//! Creating and deleting a website answers 202 and finishes asynchronously;
//! both go through `Client::execute_and_wait`. The finished create is then
//! looked up by subdomain, which is unique per tenant.

use std::sync::Arc;

use common::CloudConfig;
use powerplatform_api::{ApiRequest, Client, OperationContext};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::{build_url, guid, path_segment};

const POWERPAGES_API_VERSION: &str = "2022-03-01-preview";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteCreateDto {
    pub dataverse_organization_id: String,
    pub name: String,
    pub selected_base_language: i32,
    pub subdomain: String,
    pub template_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website_record_id: Option<String>,
}

impl WebsiteCreateDto {
    fn validate(&self) -> Result<()> {
        guid("dataverse organization id", &self.dataverse_organization_id)?;
        if self.name.trim().is_empty() {
            return Err(Error::Validation("website name must not be empty".into()));
        }
        if self.template_name.trim().is_empty() {
            return Err(Error::Validation("template name must not be empty".into()));
        }
        let valid_subdomain = !self.subdomain.is_empty()
            && !self.subdomain.starts_with('-')
            && !self.subdomain.ends_with('-')
            && self
                .subdomain
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid_subdomain {
            return Err(Error::Validation(format!(
                "subdomain {:?} must be lowercase letters, digits and inner hyphens",
                self.subdomain
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebsiteDto {
    pub id: String,
    pub name: String,
    pub status: Option<String>,
    pub subdomain: String,
    pub website_url: Option<String>,
    pub website_record_id: Option<String>,
    pub environment_id: Option<String>,
    pub environment_name: Option<String>,
    pub dataverse_instance_url: Option<String>,
    pub dataverse_organization_id: Option<String>,
    pub template_name: Option<String>,
    pub selected_base_language: Option<i32>,
    pub site_visibility: Option<String>,
    pub package_install_status: Option<String>,
    pub package_version: Option<String>,
    pub custom_host_names: Vec<String>,
    pub owner_id: Option<String>,
    pub tenant_id: Option<String>,
    pub created_on: Option<String>,
    #[serde(rename = "type")]
    pub website_type: Option<String>,
    pub trial_expiring_in_days: Option<i32>,
    pub suspended_website_deleting_in_days: Option<i32>,
    pub is_custom_error_enabled: Option<bool>,
    pub is_early_upgrade_enabled: Option<bool>,
    pub application_user_aad_app_id: Option<String>,
}

#[derive(Deserialize)]
struct WebsiteList {
    #[serde(default)]
    value: Vec<WebsiteDto>,
}

/// Power Pages client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PowerPagesClient {
    api: Arc<Client>,
    cloud: CloudConfig,
}

impl PowerPagesClient {
    pub fn new(api: Arc<Client>, cloud: CloudConfig) -> Self {
        Self { api, cloud }
    }

    fn websites_url(&self, environment_id: &str) -> Result<String> {
        let env = path_segment("environment id", environment_id)?;
        Ok(format!(
            "https://{}/powerpages/environments/{env}/websites",
            self.cloud.powerplatform_host
        ))
    }

    fn website_url(&self, environment_id: &str, website_id: &str) -> Result<String> {
        let id = guid("website id", website_id)?;
        build_url(
            &format!("{}/{id}", self.websites_url(environment_id)?),
            &[("api-version", POWERPAGES_API_VERSION)],
        )
    }

    pub async fn list(&self, ctx: &OperationContext, environment_id: &str) -> Result<Vec<WebsiteDto>> {
        let url = build_url(
            &self.websites_url(environment_id)?,
            &[("api-version", POWERPAGES_API_VERSION)],
        )?;
        let request = ApiRequest::get(url).scope(self.cloud.powerplatform_default_scope());
        let list: WebsiteList = self.api.execute_json(ctx, request).await?;
        Ok(list.value)
    }

    /// Website by id, or `None` once it no longer exists.
    pub async fn get(
        &self,
        ctx: &OperationContext,
        environment_id: &str,
        website_id: &str,
    ) -> Result<Option<WebsiteDto>> {
        let request = ApiRequest::get(self.website_url(environment_id, website_id)?)
            .scope(self.cloud.powerplatform_default_scope())
            .accept(&[200, 404]);
        let response = self.api.execute(ctx, request).await?;
        if response.status == 404 {
            return Ok(None);
        }
        Ok(Some(response.json()?))
    }

    /// Provision a website and wait until it is ready.
    pub async fn create(
        &self,
        ctx: &OperationContext,
        environment_id: &str,
        website: &WebsiteCreateDto,
    ) -> Result<WebsiteDto> {
        website.validate()?;
        let url = build_url(
            &self.websites_url(environment_id)?,
            &[("api-version", POWERPAGES_API_VERSION)],
        )?;
        let request = ApiRequest::post(url)
            .scope(self.cloud.powerplatform_default_scope())
            .accept(&[202])
            .json(website)?;

        let completion = self.api.execute_and_wait(ctx, request).await?;
        if let Some(ref operation) = completion.operation {
            info!(
                environment_id,
                subdomain = %website.subdomain,
                polls = operation.history.len(),
                "website provisioning finished"
            );
        }

        self.list(ctx, environment_id)
            .await?
            .into_iter()
            .find(|w| w.subdomain.eq_ignore_ascii_case(&website.subdomain))
            .ok_or_else(|| Error::NotFound(format!("website with subdomain {}", website.subdomain)))
    }

    /// Delete a website and wait for the deletion to finish. Deleting a
    /// website that is already gone succeeds.
    pub async fn delete(
        &self,
        ctx: &OperationContext,
        environment_id: &str,
        website_id: &str,
    ) -> Result<()> {
        let request = ApiRequest::delete(self.website_url(environment_id, website_id)?)
            .scope(self.cloud.powerplatform_default_scope())
            .accept(&[202, 204, 404]);
        self.api.execute_and_wait(ctx, request).await?;
        info!(environment_id, website_id, "website deleted");
        Ok(())
    }
}
