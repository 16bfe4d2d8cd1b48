//! Tenant-wide settings
//!
//! BAPI only offers "read everything" and "write everything". Callers usually
//! manage a handful of fields, so an update is the current document with the
//! configured fields laid over it, and the result is trimmed back down to
//! what was configured. Both steps are plain per-field functions generated
//! from the field lists below.

use std::sync::Arc;

use common::CloudConfig;
use powerplatform_api::{ApiRequest, Client, OperationContext};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::{BAPI_API_VERSION, build_url};

/// Field-wise combination of two settings documents. `None` means "not
/// configured" throughout.
pub trait MergeSettings: Sized {
    /// `self` with every field set in `configured` replaced by its value.
    fn merge_configured(&self, configured: &Self) -> Self;

    /// `self` restricted to the fields that are set in `configured`.
    fn filter_configured(&self, configured: &Self) -> Self;
}

macro_rules! leaf_setting {
    ($($ty:ty),+) => {
        $(impl MergeSettings for $ty {
            fn merge_configured(&self, configured: &Self) -> Self {
                configured.clone()
            }

            fn filter_configured(&self, _configured: &Self) -> Self {
                self.clone()
            }
        })+
    };
}

leaf_setting!(bool, i64, String);

impl<T: MergeSettings + Clone> MergeSettings for Option<T> {
    fn merge_configured(&self, configured: &Self) -> Self {
        match (self, configured) {
            (_, None) => self.clone(),
            (None, Some(c)) => Some(c.clone()),
            (Some(current), Some(c)) => Some(current.merge_configured(c)),
        }
    }

    fn filter_configured(&self, configured: &Self) -> Self {
        match (self, configured) {
            (Some(actual), Some(c)) => Some(actual.filter_configured(c)),
            _ => None,
        }
    }
}

macro_rules! settings_group {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl MergeSettings for $ty {
            fn merge_configured(&self, configured: &Self) -> Self {
                Self {
                    $($field: self.$field.merge_configured(&configured.$field)),+
                }
            }

            fn filter_configured(&self, configured: &Self) -> Self {
                Self {
                    $($field: self.$field.filter_configured(&configured.$field)),+
                }
            }
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantSettingsDto {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub walk_me_opt_out: Option<bool>,
    #[serde(rename = "disableNPSCommentsReachout", skip_serializing_if = "Option::is_none")]
    pub disable_nps_comments_reachout: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_newsletter_sendout: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_environment_creation_by_non_admin_users: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_portals_creation_by_non_admin_users: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_survey_feedback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_trial_environment_creation_by_non_admin_users: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_capacity_allocation_by_environment_admins: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_support_tickets_visible_by_all_users: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_platform: Option<PowerPlatformSettings>,
}

settings_group!(TenantSettingsDto {
    walk_me_opt_out,
    disable_nps_comments_reachout,
    disable_newsletter_sendout,
    disable_environment_creation_by_non_admin_users,
    disable_portals_creation_by_non_admin_users,
    disable_survey_feedback,
    disable_trial_environment_creation_by_non_admin_users,
    disable_capacity_allocation_by_environment_admins,
    disable_support_tickets_visible_by_all_users,
    power_platform,
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PowerPlatformSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teams_integration: Option<TeamsIntegrationSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_apps: Option<PowerAppsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_automate: Option<PowerAutomateSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environments: Option<EnvironmentsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub governance: Option<GovernanceSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intelligence: Option<IntelligenceSettings>,
}

settings_group!(PowerPlatformSettings {
    search,
    teams_integration,
    power_apps,
    power_automate,
    environments,
    governance,
    intelligence,
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_docs_search: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_community_search: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_bing_video_search: Option<bool>,
}

settings_group!(SearchSettings {
    disable_docs_search,
    disable_community_search,
    disable_bing_video_search,
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TeamsIntegrationSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_with_colleagues_user_limit: Option<i64>,
}

settings_group!(TeamsIntegrationSettings {
    share_with_colleagues_user_limit
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PowerAppsSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_share_with_everyone: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_guests_to_make: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_members_indicator: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_maker_match: Option<bool>,
}

settings_group!(PowerAppsSettings {
    disable_share_with_everyone,
    enable_guests_to_make,
    disable_members_indicator,
    disable_maker_match,
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PowerAutomateSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_copilot: Option<bool>,
}

settings_group!(PowerAutomateSettings { disable_copilot });

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentsSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_preferred_data_location_for_teams_environment: Option<bool>,
}

settings_group!(EnvironmentsSettings {
    disable_preferred_data_location_for_teams_environment
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GovernanceSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_admin_digest: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_developer_environment_creation_by_non_admin_users: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_default_environment_routing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_routing_target_security_group_id: Option<String>,
}

settings_group!(GovernanceSettings {
    disable_admin_digest,
    disable_developer_environment_creation_by_non_admin_users,
    enable_default_environment_routing,
    environment_routing_target_security_group_id,
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntelligenceSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_copilot: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_open_ai_bot_publishing: Option<bool>,
}

settings_group!(IntelligenceSettings {
    disable_copilot,
    enable_open_ai_bot_publishing,
});

/// Tenant settings client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TenantSettingsClient {
    api: Arc<Client>,
    cloud: CloudConfig,
}

impl TenantSettingsClient {
    pub fn new(api: Arc<Client>, cloud: CloudConfig) -> Self {
        Self { api, cloud }
    }

    fn url(&self, action: &str) -> Result<String> {
        build_url(
            &format!(
                "https://{}/providers/Microsoft.BusinessAppPlatform/{action}",
                self.cloud.bapi_host
            ),
            &[("api-version", BAPI_API_VERSION)],
        )
    }

    /// The full settings document.
    pub async fn get(&self, ctx: &OperationContext) -> Result<TenantSettingsDto> {
        let request = ApiRequest::post(self.url("listTenantSettings")?)
            .scope(self.cloud.bapi_scope())
            .json(&serde_json::json!({}))?;
        Ok(self.api.execute_json(ctx, request).await?)
    }

    /// Apply the configured fields and return the resulting values of just
    /// those fields.
    pub async fn update(
        &self,
        ctx: &OperationContext,
        configured: &TenantSettingsDto,
    ) -> Result<TenantSettingsDto> {
        let current = self.get(ctx).await?;
        let desired = current.merge_configured(configured);
        let request = ApiRequest::post(self.url("scopes/admin/updateTenantSettings")?)
            .scope(self.cloud.bapi_scope())
            .json(&desired)?;
        let updated: TenantSettingsDto = self.api.execute_json(ctx, request).await?;
        info!("tenant settings updated");
        Ok(updated.filter_configured(configured))
    }
}
