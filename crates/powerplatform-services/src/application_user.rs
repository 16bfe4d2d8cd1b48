//! Dataverse application users and their security roles
//!
//! Users live in the environment's Dataverse instance, so every call first
//! resolves the instance URL through BAPI. Creation goes through BAPI's
//! `addUser`, which fails with `userNotLicensed` until Entra has finished
//! assigning licenses; that case is retried on a fixed interval for a bounded
//! time.

use std::sync::Arc;
use std::time::Duration;

use common::CloudConfig;
use powerplatform_api::{ApiRequest, Client, OperationContext};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::environment::EnvironmentClient;
use crate::error::{Error, Result};
use crate::{BAPI_API_VERSION, DATAVERSE_API_PATH, build_url, guid, path_segment};

const USER_NOT_LICENSED: &str = "userNotLicensed";
const LICENSE_RETRY_INTERVAL: Duration = Duration::from_secs(10);
const LICENSE_RETRY_MAX_WAIT: Duration = Duration::from_secs(9 * 60);
const ROLE_EXPAND: &str = "systemuserroles_association($select=roleid,name,ismanaged,_businessunitid_value)";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationUserDto {
    #[serde(rename = "systemuserid", alias = "systemapplicationuserid", default)]
    pub id: String,
    #[serde(rename = "applicationname", default)]
    pub application_name: Option<String>,
    #[serde(rename = "_businessunitid_value", default)]
    pub business_unit_id: Option<String>,
    #[serde(
        rename = "systemuserroles_association",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub security_roles: Vec<SecurityRoleDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityRoleDto {
    #[serde(rename = "roleid")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "ismanaged", default)]
    pub is_managed: bool,
    #[serde(rename = "_businessunitid_value", default)]
    pub business_unit_id: Option<String>,
}

/// Fields of an application user that can be changed in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplicationUserUpdate {
    pub application_name: Option<String>,
    pub business_unit_id: Option<String>,
}

impl ApplicationUserUpdate {
    fn to_body(&self) -> Result<serde_json::Value> {
        let mut body = serde_json::Map::new();
        if let Some(ref name) = self.application_name {
            body.insert("applicationname".into(), json!(name));
        }
        if let Some(ref bu) = self.business_unit_id {
            let bu = guid("business unit id", bu)?;
            body.insert(
                "businessunitid@odata.bind".into(),
                json!(format!("/businessunits({bu})")),
            );
        }
        if body.is_empty() {
            return Err(Error::Validation("update changes nothing".into()));
        }
        Ok(serde_json::Value::Object(body))
    }
}

#[derive(Deserialize)]
struct ODataList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

/// Application user client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ApplicationUserClient {
    api: Arc<Client>,
    cloud: CloudConfig,
    environments: EnvironmentClient,
}

impl ApplicationUserClient {
    pub fn new(api: Arc<Client>, cloud: CloudConfig) -> Self {
        let environments = EnvironmentClient::new(api.clone(), cloud.clone());
        Self {
            api,
            cloud,
            environments,
        }
    }

    pub async fn list(
        &self,
        ctx: &OperationContext,
        environment_id: &str,
    ) -> Result<Vec<ApplicationUserDto>> {
        let instance = self.environments.instance_url(ctx, environment_id).await?;
        let url = format!("{instance}{DATAVERSE_API_PATH}/systemusers");
        let request = ApiRequest::get(url).scope(CloudConfig::dataverse_scope(&instance));
        let list: ODataList<ApplicationUserDto> = self.api.execute_json(ctx, request).await?;
        Ok(list.value)
    }

    /// Fetch one user with its security roles expanded.
    pub async fn get(
        &self,
        ctx: &OperationContext,
        environment_id: &str,
        user_id: &str,
    ) -> Result<ApplicationUserDto> {
        let instance = self.environments.instance_url(ctx, environment_id).await?;
        self.get_in(ctx, &instance, user_id).await
    }

    async fn get_in(
        &self,
        ctx: &OperationContext,
        instance: &str,
        user_id: &str,
    ) -> Result<ApplicationUserDto> {
        let user_id = guid("user id", user_id)?;
        let url = build_url(
            &format!("{instance}{DATAVERSE_API_PATH}/systemusers({user_id})"),
            &[("$expand", ROLE_EXPAND)],
        )?;
        let request = ApiRequest::get(url).scope(CloudConfig::dataverse_scope(instance));
        Ok(self.api.execute_json(ctx, request).await?)
    }

    /// Add an Entra application (by object id) to the environment.
    ///
    /// Retries every 10 seconds for up to 9 minutes while the service answers
    /// `userNotLicensed`; any other failure is returned at once.
    pub async fn create(
        &self,
        ctx: &OperationContext,
        environment_id: &str,
        object_id: &str,
    ) -> Result<ApplicationUserDto> {
        let env = path_segment("environment id", environment_id)?;
        let object_id = guid("object id", object_id)?;
        let url = build_url(
            &format!(
                "https://{}/providers/Microsoft.BusinessAppPlatform/scopes/admin/environments/{env}/addUser",
                self.cloud.bapi_host
            ),
            &[("api-version", BAPI_API_VERSION)],
        )?;
        let request = ApiRequest::post(url)
            .scope(self.cloud.bapi_scope())
            .json(&json!({ "objectId": object_id.to_string() }))?;

        let started = Instant::now();
        loop {
            match self.api.execute(ctx, request.clone()).await {
                Ok(_) => break,
                Err(e) => {
                    let err = Error::from(e);
                    if !err.has_service_code(USER_NOT_LICENSED)
                        || started.elapsed() + LICENSE_RETRY_INTERVAL >= LICENSE_RETRY_MAX_WAIT
                    {
                        return Err(err);
                    }
                    warn!(
                        environment_id,
                        object_id = %object_id,
                        waited_secs = started.elapsed().as_secs(),
                        "application user not licensed yet, retrying"
                    );
                    ctx.sleep(LICENSE_RETRY_INTERVAL).await?;
                }
            }
        }
        info!(environment_id, object_id = %object_id, "application user added");

        let instance = self.environments.instance_url(ctx, environment_id).await?;
        self.get_in(ctx, &instance, &object_id.to_string()).await
    }

    pub async fn update(
        &self,
        ctx: &OperationContext,
        environment_id: &str,
        user_id: &str,
        update: &ApplicationUserUpdate,
    ) -> Result<ApplicationUserDto> {
        let body = update.to_body()?;
        let id = guid("user id", user_id)?;
        let instance = self.environments.instance_url(ctx, environment_id).await?;
        let url = format!("{instance}{DATAVERSE_API_PATH}/systemusers({id})");
        let request = ApiRequest::patch(url)
            .scope(CloudConfig::dataverse_scope(&instance))
            .accept(&[200, 204])
            .json(&body)?;
        self.api.execute(ctx, request).await?;
        self.get_in(ctx, &instance, user_id).await
    }

    pub async fn delete(
        &self,
        ctx: &OperationContext,
        environment_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let id = guid("user id", user_id)?;
        let instance = self.environments.instance_url(ctx, environment_id).await?;
        let url = format!("{instance}{DATAVERSE_API_PATH}/systemusers({id})");
        let request = ApiRequest::delete(url)
            .scope(CloudConfig::dataverse_scope(&instance))
            .accept(&[204]);
        self.api.execute(ctx, request).await?;
        debug!(environment_id, user_id, "application user deleted");
        Ok(())
    }

    /// Associate security roles and return the user as it now stands.
    pub async fn add_roles(
        &self,
        ctx: &OperationContext,
        environment_id: &str,
        user_id: &str,
        role_ids: &[String],
    ) -> Result<ApplicationUserDto> {
        let id = guid("user id", user_id)?;
        let roles = role_ids
            .iter()
            .map(|r| guid("role id", r))
            .collect::<Result<Vec<_>>>()?;
        let instance = self.environments.instance_url(ctx, environment_id).await?;
        let url = format!("{instance}{DATAVERSE_API_PATH}/systemusers({id})/systemuserroles_association/$ref");

        for role in roles {
            let request = ApiRequest::post(url.clone())
                .scope(CloudConfig::dataverse_scope(&instance))
                .accept(&[204])
                .json(&json!({ "@odata.id": role_ref(&instance, &role.to_string()) }))?;
            self.api.execute(ctx, request).await?;
            debug!(user_id, role_id = %role, "security role added");
        }
        self.get_in(ctx, &instance, user_id).await
    }

    /// Disassociate security roles and return the user as it now stands.
    pub async fn remove_roles(
        &self,
        ctx: &OperationContext,
        environment_id: &str,
        user_id: &str,
        role_ids: &[String],
    ) -> Result<ApplicationUserDto> {
        let id = guid("user id", user_id)?;
        let roles = role_ids
            .iter()
            .map(|r| guid("role id", r))
            .collect::<Result<Vec<_>>>()?;
        let instance = self.environments.instance_url(ctx, environment_id).await?;
        let base = format!("{instance}{DATAVERSE_API_PATH}/systemusers({id})/systemuserroles_association/$ref");

        for role in roles {
            let url = build_url(&base, &[("$id", &role_ref(&instance, &role.to_string()))])?;
            let request = ApiRequest::delete(url)
                .scope(CloudConfig::dataverse_scope(&instance))
                .accept(&[204]);
            self.api.execute(ctx, request).await?;
            debug!(user_id, role_id = %role, "security role removed");
        }
        self.get_in(ctx, &instance, user_id).await
    }

    /// Security roles of the environment, optionally limited to one
    /// business unit.
    pub async fn list_roles(
        &self,
        ctx: &OperationContext,
        environment_id: &str,
        business_unit_id: Option<&str>,
    ) -> Result<Vec<SecurityRoleDto>> {
        let instance = self.environments.instance_url(ctx, environment_id).await?;
        let base = format!("{instance}{DATAVERSE_API_PATH}/roles");
        let url = match business_unit_id {
            Some(bu) => {
                let bu = guid("business unit id", bu)?;
                build_url(&base, &[("$filter", &format!("_businessunitid_value eq {bu}"))])?
            }
            None => base,
        };
        let request = ApiRequest::get(url).scope(CloudConfig::dataverse_scope(&instance));
        let list: ODataList<SecurityRoleDto> = self.api.execute_json(ctx, request).await?;
        Ok(list.value)
    }
}

fn role_ref(instance: &str, role_id: &str) -> String {
    format!("{instance}{DATAVERSE_API_PATH}/roles({role_id})")
}
