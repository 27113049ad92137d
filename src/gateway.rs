//! Gateway service: optional collaborator that enriches the user context with location and
//! user-agent details and answers attribute-list membership checks.
use std::collections::HashMap;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::network::NetworkClient;
use crate::{Error, Result};

const GET_USER_DATA_ENDPOINT: &str = "/get-user-details";
const ATTRIBUTE_CHECK_ENDPOINT: &str = "/check-attribute";

/// Location and user-agent details returned by the gateway service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayUserData {
    /// `country`, `region`, `city`.
    #[serde(default)]
    pub location: HashMap<String, String>,
    /// `os`, `device_type`, `browser_string`, `device`, `browser_version`, `os_version`.
    #[serde(default)]
    pub user_agent: HashMap<String, String>,
}

/// A service that provides data for location, user-agent and list segments.
pub trait GatewayService {
    /// Resolve location and user-agent details for a user.
    fn get_user_data(&self, user_agent: Option<&str>, ip_address: Option<&str>)
        -> Result<GatewayUserData>;

    /// Check whether `attribute` is a member of attribute list `list_id`.
    fn check_attribute(&self, attribute: &str, list_id: &str) -> Result<bool>;
}

/// [`GatewayService`] backed by a self-hosted VWO gateway over HTTP.
pub(crate) struct HttpGatewayService {
    base_url: String,
    account_id: i64,
    sdk_key: String,
    network: NetworkClient,
}

impl HttpGatewayService {
    pub(crate) fn new(
        base_url: impl Into<String>,
        account_id: i64,
        sdk_key: impl Into<String>,
        network: NetworkClient,
    ) -> HttpGatewayService {
        HttpGatewayService {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            account_id,
            sdk_key: sdk_key.into(),
            network,
        }
    }

    fn get(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<String> {
        let account_id = self.account_id.to_string();
        let mut query = vec![("accountId", &*account_id), ("sdkKey", &*self.sdk_key)];
        query.extend_from_slice(params);
        let url = Url::parse_with_params(&format!("{}{}", self.base_url, endpoint), &query)
            .map_err(Error::InvalidBaseUrl)?;
        self.network.get_text(url)
    }
}

impl GatewayService for HttpGatewayService {
    fn get_user_data(
        &self,
        user_agent: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<GatewayUserData> {
        let mut params = Vec::new();
        if let Some(user_agent) = user_agent {
            params.push(("userAgent", user_agent));
        }
        if let Some(ip_address) = ip_address {
            params.push(("ipAddress", ip_address));
        }
        let body = self.get(GET_USER_DATA_ENDPOINT, &params)?;
        serde_json::from_str(&body).map_err(|err| Error::Gateway(err.to_string()))
    }

    fn check_attribute(&self, attribute: &str, list_id: &str) -> Result<bool> {
        let body = self.get(
            ATTRIBUTE_CHECK_ENDPOINT,
            &[("attribute", attribute), ("listId", list_id)],
        )?;
        Ok(body.trim() == "true")
    }
}
