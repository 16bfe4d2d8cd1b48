//! Environment lookups against BAPI

use std::sync::Arc;

use common::CloudConfig;
use powerplatform_api::{ApiRequest, Client, OperationContext};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::{BAPI_API_VERSION, build_url, path_segment};

const ENVIRONMENT_EXPAND: &str = "permissions,properties.capacity,properties/billingPolicy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDto {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub properties: EnvironmentProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentProperties {
    pub display_name: Option<String>,
    pub environment_sku: Option<String>,
    pub azure_region: Option<String>,
    pub is_default: Option<bool>,
    pub linked_environment_metadata: Option<LinkedEnvironmentMetadata>,
}

/// Dataverse database attached to an environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkedEnvironmentMetadata {
    pub instance_url: Option<String>,
    pub domain_name: Option<String>,
    pub unique_name: Option<String>,
    pub version: Option<String>,
}

impl EnvironmentDto {
    /// Dataverse instance URL without the trailing slash.
    pub fn instance_url(&self) -> Option<String> {
        self.properties
            .linked_environment_metadata
            .as_ref()
            .and_then(|m| m.instance_url.as_deref())
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
    }
}

#[derive(Deserialize)]
struct EnvironmentList {
    #[serde(default)]
    value: Vec<EnvironmentDto>,
}

/// Environment client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EnvironmentClient {
    api: Arc<Client>,
    cloud: CloudConfig,
}

impl EnvironmentClient {
    pub fn new(api: Arc<Client>, cloud: CloudConfig) -> Self {
        Self { api, cloud }
    }

    fn environments_url(&self) -> String {
        format!(
            "https://{}/providers/Microsoft.BusinessAppPlatform/scopes/admin/environments",
            self.cloud.bapi_host
        )
    }

    pub async fn list(&self, ctx: &OperationContext) -> Result<Vec<EnvironmentDto>> {
        let url = build_url(
            &self.environments_url(),
            &[("api-version", BAPI_API_VERSION)],
        )?;
        let request = ApiRequest::get(url).scope(self.cloud.bapi_scope());
        let list: EnvironmentList = self.api.execute_json(ctx, request).await?;
        Ok(list.value)
    }

    pub async fn get(&self, ctx: &OperationContext, environment_id: &str) -> Result<EnvironmentDto> {
        let id = path_segment("environment id", environment_id)?;
        let url = build_url(
            &format!("{}/{id}", self.environments_url()),
            &[
                ("$expand", ENVIRONMENT_EXPAND),
                ("api-version", BAPI_API_VERSION),
            ],
        )?;
        let request = ApiRequest::get(url).scope(self.cloud.bapi_scope());
        Ok(self.api.execute_json(ctx, request).await?)
    }

    /// Dataverse instance URL of an environment.
    pub async fn instance_url(&self, ctx: &OperationContext, environment_id: &str) -> Result<String> {
        let environment = self.get(ctx, environment_id).await?;
        let url = environment
            .instance_url()
            .ok_or_else(|| Error::NoDataverse(environment_id.to_string()))?;
        debug!(environment_id, instance_url = %url, "resolved Dataverse instance");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RoutedTransport, client, cloud, environment_body, json};
    use reqwest::Method;

    const ENV: &str = "00000000-0000-0000-0000-000000000001";
    const ENV_PATH: &str = "/providers/Microsoft.BusinessAppPlatform/scopes/admin/environments/00000000-0000-0000-0000-000000000001";

    #[tokio::test]
    async fn get_sends_expand_and_api_version() {
        let transport = Arc::new(RoutedTransport::new().route(
            Method::GET,
            ENV_PATH,
            vec![json(200, &environment_body(ENV, Some("https://contoso.crm.dynamics.com/")))],
        ));
        let environments = EnvironmentClient::new(client(transport.clone()), cloud());

        let env = environments
            .get(&OperationContext::background(), ENV)
            .await
            .unwrap();
        assert_eq!(env.name, ENV);
        assert_eq!(env.properties.display_name.as_deref(), Some("Contoso"));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url.host_str(), Some("api.bap.microsoft.com"));
        let query: Vec<(String, String)> = sent[0].url.query_pairs().into_owned().collect();
        assert!(query.contains(&("$expand".to_string(), ENVIRONMENT_EXPAND.to_string())));
        assert!(query.contains(&("api-version".to_string(), "2023-06-01".to_string())));
    }

    #[tokio::test]
    async fn instance_url_is_trimmed() {
        let transport = Arc::new(RoutedTransport::new().route(
            Method::GET,
            ENV_PATH,
            vec![json(200, &environment_body(ENV, Some("https://contoso.crm.dynamics.com/")))],
        ));
        let environments = EnvironmentClient::new(client(transport), cloud());

        let url = environments
            .instance_url(&OperationContext::background(), ENV)
            .await
            .unwrap();
        assert_eq!(url, "https://contoso.crm.dynamics.com");
    }

    #[tokio::test]
    async fn environment_without_dataverse_is_reported() {
        let transport = Arc::new(RoutedTransport::new().route(
            Method::GET,
            ENV_PATH,
            vec![json(200, &environment_body(ENV, None))],
        ));
        let environments = EnvironmentClient::new(client(transport), cloud());

        let err = environments
            .instance_url(&OperationContext::background(), ENV)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoDataverse(ref id) if id == ENV));
    }

    #[tokio::test]
    async fn list_reads_value_array() {
        let body = format!(
            r#"{{"value":[{},{}]}}"#,
            environment_body("env-a", None),
            environment_body("env-b", Some("https://b.crm.dynamics.com"))
        );
        let transport = Arc::new(RoutedTransport::new().route(
            Method::GET,
            "/providers/Microsoft.BusinessAppPlatform/scopes/admin/environments",
            vec![json(200, &body)],
        ));
        let environments = EnvironmentClient::new(client(transport), cloud());

        let list = environments
            .list(&OperationContext::background())
            .await
            .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].instance_url().as_deref(), Some("https://b.crm.dynamics.com"));
    }

    #[tokio::test]
    async fn id_with_path_separator_is_rejected_before_sending() {
        let transport = Arc::new(RoutedTransport::new());
        let environments = EnvironmentClient::new(client(transport.clone()), cloud());

        let err = environments
            .get(&OperationContext::background(), "../tenant")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(transport.sent().is_empty());
    }
}
