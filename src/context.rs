use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::GatewayUserData;

/// Key under which the user id (or its UUID) is exposed to segmentation.
pub(crate) const VWO_USER_ID_KEY: &str = "_vwoUserId";

/// Key-value attributes used for segmentation and event properties.
pub type Attributes = HashMap<String, AttributeValue>;

/// A value of a user attribute.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numeric value. Integers are represented as `f64` as well.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl AttributeValue {
    /// String form used when comparing against segmentation operands.
    ///
    /// Integral numbers are printed without a fractional part so that `123.0` and `123` compare
    /// equal. `Null` becomes an empty string.
    pub(crate) fn to_tag_string(&self) -> String {
        match self {
            AttributeValue::String(s) => s.clone(),
            AttributeValue::Number(n) => format_number(*n),
            AttributeValue::Boolean(b) => b.to_string(),
            AttributeValue::Null => String::new(),
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        match self {
            AttributeValue::String(s) => serde_json::Value::String(s.clone()),
            AttributeValue::Number(n) => number_to_json(*n),
            AttributeValue::Boolean(b) => serde_json::Value::Bool(*b),
            AttributeValue::Null => serde_json::Value::Null,
        }
    }
}

pub(crate) fn attributes_to_json(attributes: &Attributes) -> serde_json::Value {
    serde_json::Value::Object(
        attributes
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    )
}

/// Print `n` without scientific notation, dropping `.0` for integral values.
pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Request-scoped description of the user a flag is evaluated for.
///
/// ```
/// # use vwo_fme::UserContext;
/// let context = UserContext::new("user-1")
///     .with_user_agent("Mozilla/5.0")
///     .with_custom_variable("plan", "premium")
///     .with_custom_variable("age", 21);
/// ```
#[derive(Debug, Clone)]
pub struct UserContext {
    pub(crate) id: String,
    pub(crate) user_agent: Option<String>,
    pub(crate) ip_address: Option<String>,
    pub(crate) custom_variables: Attributes,
    pub(crate) variation_targeting_variables: Attributes,
    pub(crate) session_id: i64,
    /// Location and user-agent details fetched from the gateway service.
    pub(crate) gateway_data: Option<GatewayUserData>,
}

impl UserContext {
    /// Create a context for user `id`. Session id defaults to the current time in seconds.
    pub fn new(id: impl Into<String>) -> UserContext {
        UserContext {
            id: id.into(),
            user_agent: None,
            ip_address: None,
            custom_variables: Attributes::new(),
            variation_targeting_variables: Attributes::new(),
            session_id: chrono::Utc::now().timestamp(),
            gateway_data: None,
        }
    }

    /// User id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Set the user agent used for user-agent segmentation and sent with events.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the IP address used for location segmentation and sent with events.
    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    /// Add a single custom variable used for pre-segmentation.
    pub fn with_custom_variable(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.custom_variables.insert(key.into(), value.into());
        self
    }

    /// Replace all custom variables.
    pub fn with_custom_variables(mut self, custom_variables: Attributes) -> Self {
        self.custom_variables = custom_variables;
        self
    }

    /// Replace variables used for whitelisting (forced variations).
    pub fn with_variation_targeting_variables(mut self, variables: Attributes) -> Self {
        self.variation_targeting_variables = variables;
        self
    }

    /// Override the session id (seconds since epoch).
    pub fn with_session_id(mut self, session_id: i64) -> Self {
        self.session_id = session_id;
        self
    }

    pub(crate) fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref().filter(|ua| !ua.is_empty())
    }

    pub(crate) fn ip_address(&self) -> Option<&str> {
        self.ip_address.as_deref().filter(|ip| !ip.is_empty())
    }

    /// Account-scoped visitor UUID, see [`visitor_uuid`].
    pub(crate) fn uuid(&self, account_id: i64) -> String {
        visitor_uuid(&self.id, account_id)
    }
}

/// Derive the visitor UUID for `user_id` in `account_id`.
///
/// The UUID is a chain of name-based (v5) UUIDs: URL namespace → `https://vwo.com` → account id →
/// user id. It is emitted uppercase without dashes.
pub(crate) fn visitor_uuid(user_id: &str, account_id: i64) -> String {
    let vwo_namespace = Uuid::new_v5(&Uuid::NAMESPACE_URL, b"https://vwo.com");
    let account_namespace = Uuid::new_v5(&vwo_namespace, account_id.to_string().as_bytes());
    let user_uuid = Uuid::new_v5(&account_namespace, user_id.as_bytes());
    user_uuid.simple().to_string().to_uppercase()
}
