//! Event payloads: impressions, custom events and visitor attributes.
use serde_json::{json, Map, Value};

use crate::context::{Attributes, UserContext};
use crate::get_flag::Impression;

/// SDK name reported with every event.
pub(crate) const SDK_NAME: &str = "vwo-fme-rust-sdk";
/// SDK version reported with every event.
pub(crate) const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) const VARIATION_SHOWN_EVENT: &str = "vwo_variationShown";
pub(crate) const SYNC_VISITOR_PROP_EVENT: &str = "vwo_syncVisitorProp";
/// Events sent fire-once, without retries.
const NON_RETRYABLE_EVENTS: [&str; 3] = ["vwo_sdkDebug", "vwo_sdkUsageStats", "vwo_fmeSdkInit"];

const PRODUCT: &str = "fme";
const FS_ENVIRONMENT_KEY: &str = "vwo_fs_environment";

/// An event ready to be sent, either on its own or inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EventPayload {
    pub name: String,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    /// `{"d": {...}}`
    pub body: Value,
}

impl EventPayload {
    pub(crate) fn is_retryable(&self) -> bool {
        !NON_RETRYABLE_EVENTS.contains(&self.name.as_str())
    }
}

/// Builds payloads for one account.
#[derive(Debug, Clone)]
pub(crate) struct EventBuilder {
    account_id: i64,
    sdk_key: String,
}

impl EventBuilder {
    pub(crate) fn new(account_id: i64, sdk_key: impl Into<String>) -> EventBuilder {
        EventBuilder {
            account_id,
            sdk_key: sdk_key.into(),
        }
    }

    /// `vwo_variationShown` for a campaign decision.
    pub(crate) fn impression(&self, user: &UserContext, impression: Impression) -> EventPayload {
        let mut props = Map::new();
        props.insert("id".to_owned(), json!(impression.campaign_id));
        props.insert(
            "variation".to_owned(),
            json!(impression.variation_id.to_string()),
        );
        props.insert("isFirst".to_owned(), json!(1));
        log::debug!(target: "vwo",
                    user_id = user.id,
                    campaign_id = impression.campaign_id,
                    variation_id = impression.variation_id;
                    "creating impression");
        self.build(user, VARIATION_SHOWN_EVENT, props, None, true)
    }

    /// A custom event. Caller properties sit next to the standard props.
    pub(crate) fn track(
        &self,
        user: &UserContext,
        event_name: &str,
        properties: &Attributes,
    ) -> EventPayload {
        let mut props = Map::new();
        props.insert("isCustomEvent".to_owned(), json!(true));
        props.extend(to_map(properties));
        self.build(user, event_name, props, None, true)
    }

    /// `vwo_syncVisitorProp`. The attributes replace the visitor props.
    pub(crate) fn set_attribute(&self, user: &UserContext, attributes: &Attributes) -> EventPayload {
        let mut props = Map::new();
        props.insert("isCustomEvent".to_owned(), json!(true));
        self.build(
            user,
            SYNC_VISITOR_PROP_EVENT,
            props,
            Some(to_map(attributes)),
            false,
        )
    }

    fn build(
        &self,
        user: &UserContext,
        event_name: &str,
        props: Map<String, Value>,
        visitor_props: Option<Map<String, Value>>,
        with_visitor_details: bool,
    ) -> EventPayload {
        let uuid = user.uuid(self.account_id);
        let now = chrono::Utc::now().timestamp_millis();

        let mut event_props = Map::new();
        event_props.insert("vwo_sdkName".to_owned(), json!(SDK_NAME));
        event_props.insert("vwo_sdkVersion".to_owned(), json!(SDK_VERSION));
        event_props.insert("vwo_envKey".to_owned(), json!(self.sdk_key));
        event_props.insert("product".to_owned(), json!(PRODUCT));
        event_props.extend(props);

        let visitor_props = visitor_props.unwrap_or_else(|| {
            Map::from_iter([(FS_ENVIRONMENT_KEY.to_owned(), json!(self.sdk_key))])
        });

        let (user_agent, ip_address) = if with_visitor_details {
            (
                user.user_agent().map(str::to_owned),
                user.ip_address().map(str::to_owned),
            )
        } else {
            (None, None)
        };

        let mut data = json!({
            "msgId": format!("{uuid}-{now}"),
            "visId": uuid,
            "sessionId": user.session_id,
            "event": {
                "props": event_props,
                "name": event_name,
                "time": now,
            },
            "visitor": {
                "props": visitor_props,
            },
        });
        if let Some(user_agent) = &user_agent {
            data["visitor_ua"] = json!(user_agent);
        }
        if let Some(ip_address) = &ip_address {
            data["visitor_ip"] = json!(ip_address);
        }

        EventPayload {
            name: event_name.to_owned(),
            user_agent,
            ip_address,
            body: json!({ "d": data }),
        }
    }
}

fn to_map(attributes: &Attributes) -> Map<String, Value> {
    attributes
        .iter()
        .map(|(key, value)| (key.clone(), value.to_json()))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::context::AttributeValue;

    fn builder() -> EventBuilder {
        EventBuilder::new(123456, "sdk-key")
    }

    #[test]
    fn impression_payload() {
        let user = UserContext::new("Ashley")
            .with_user_agent("Mozilla/5.0")
            .with_ip_address("1.2.3.4")
            .with_session_id(1700000000);
        let payload = builder().impression(
            &user,
            Impression {
                campaign_id: 2,
                variation_id: 1,
            },
        );

        assert_eq!(payload.name, "vwo_variationShown");
        assert!(payload.is_retryable());
        assert_eq!(payload.user_agent.as_deref(), Some("Mozilla/5.0"));

        let d = &payload.body["d"];
        assert_eq!(d["visId"], json!("4C9BA81BAF53591488EB5FD5E66A98B9"));
        assert!(d["msgId"]
            .as_str()
            .unwrap()
            .starts_with("4C9BA81BAF53591488EB5FD5E66A98B9-"));
        assert_eq!(d["sessionId"], json!(1700000000));
        assert_eq!(d["visitor_ua"], json!("Mozilla/5.0"));
        assert_eq!(d["visitor_ip"], json!("1.2.3.4"));
        assert_eq!(d["event"]["name"], json!("vwo_variationShown"));
        assert_eq!(
            d["event"]["props"],
            json!({
                "vwo_sdkName": "vwo-fme-rust-sdk",
                "vwo_sdkVersion": env!("CARGO_PKG_VERSION"),
                "vwo_envKey": "sdk-key",
                "product": "fme",
                "id": 2,
                "variation": "1",
                "isFirst": 1,
            })
        );
        assert_eq!(d["visitor"]["props"], json!({"vwo_fs_environment": "sdk-key"}));
    }

    #[test]
    fn track_payload_carries_properties() {
        let user = UserContext::new("Ashley");
        let properties = Attributes::from([
            ("amount".to_owned(), AttributeValue::from(12.5)),
            ("currency".to_owned(), AttributeValue::from("EUR")),
        ]);
        let payload = builder().track(&user, "purchase", &properties);

        let d = &payload.body["d"];
        assert_eq!(d["event"]["name"], json!("purchase"));
        assert_eq!(d["event"]["props"]["isCustomEvent"], json!(true));
        assert_eq!(d["event"]["props"]["amount"], json!(12.5));
        assert_eq!(d["event"]["props"]["currency"], json!("EUR"));
        assert!(d.get("visitor_ua").is_none());
    }

    #[test]
    fn set_attribute_payload_replaces_visitor_props() {
        let user = UserContext::new("Ashley").with_user_agent("Mozilla/5.0");
        let attributes = Attributes::from([
            ("plan".to_owned(), AttributeValue::from("gold")),
            ("age".to_owned(), AttributeValue::from(30)),
        ]);
        let payload = builder().set_attribute(&user, &attributes);

        let d = &payload.body["d"];
        assert_eq!(payload.name, "vwo_syncVisitorProp");
        assert_eq!(d["visitor"]["props"], json!({"plan": "gold", "age": 30}));
        assert_eq!(d["event"]["props"]["isCustomEvent"], json!(true));
        assert!(d.get("visitor_ua").is_none());
        assert_eq!(payload.user_agent, None);
    }

    #[test]
    fn sdk_events_are_not_retried() {
        let mut payload = builder().track(&UserContext::new("u"), "vwo_sdkDebug", &Attributes::new());
        assert!(!payload.is_retryable());
        payload.name = "signup".to_owned();
        assert!(payload.is_retryable());
    }
}
