//! Segmentation DSL.
//!
//! Segments arrive as JSON trees (`{"and": [...]}`, `{"or": [...]}`, `{"not": {...}}` and leaf
//! operators) and are compiled into a [`Segment`] once, when settings are loaded. Evaluation never
//! panics: malformed nodes and unknown operators compile into leaves that evaluate to `false`.
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::context::{AttributeValue, Attributes, UserContext, VWO_USER_ID_KEY};
use crate::gateway::GatewayService;
use crate::settings::Settings;
use crate::storage::StorageFacade;

mod operand;

pub(crate) use operand::Operand;

/// A compiled segmentation tree. Keeps the original JSON around for the gateway requirement scan.
#[derive(Debug, Clone, Default)]
pub(crate) struct Segment {
    raw: serde_json::Value,
    node: Node,
}

#[derive(Debug, Clone, Default)]
enum Node {
    /// `{}` or a missing segment: no constraint.
    #[default]
    Empty,
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    CustomVariable {
        name: String,
        operand: Operand,
    },
    /// `{"custom_variable": {"<name>": "inlist(<list_id>)"}}`
    InList {
        name: String,
        list_id: String,
    },
    /// Comma-separated list of user ids.
    User(Vec<String>),
    UserAgent(Operand),
    IpAddress(Operand),
    BrowserVersion(Operand),
    OsVersion(Operand),
    /// `country`, `region` or `city` compared against gateway location.
    Location {
        field: String,
        value: String,
    },
    /// `os`, `device_type`, `browser_string` or `device` compared against gateway user-agent data.
    UserAgentInfo {
        field: String,
        values: Vec<UaPattern>,
    },
    /// `{"featureId": {"<id>": "on" | "off"}}`
    Feature {
        feature_id: i64,
        enabled: bool,
    },
    /// Unknown operator or malformed node.
    Invalid,
}

#[derive(Debug, Clone)]
enum UaPattern {
    /// `wildcard(...)` converted to a case-insensitive regex.
    Wildcard(Option<Regex>),
    /// Lowercased literal.
    Exact(String),
}

/// Everything a segment may look at while being evaluated.
pub(crate) struct SegmentContext<'a> {
    pub settings: &'a Settings,
    pub user: &'a UserContext,
    pub storage: &'a StorageFacade,
    pub gateway: Option<&'a (dyn GatewayService + Send + Sync)>,
}

impl Segment {
    pub(crate) fn compile(raw: serde_json::Value) -> Segment {
        let node = Node::compile(&raw);
        Segment { raw, node }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self.node, Node::Empty)
    }

    /// Evaluate the segment against `properties`.
    pub(crate) fn evaluate(&self, properties: &Attributes, context: &SegmentContext) -> bool {
        let result = self.node.evaluate(properties, context);
        log::trace!(target: "vwo",
                    user_id = context.user.id,
                    segment:serde = self.raw,
                    result;
                    "evaluated segment");
        result
    }

    /// Whether the segment references data only the gateway service can provide: location or
    /// user-agent operators outside of a `custom_variable` object, or an `inlist(...)` operand.
    pub(crate) fn requires_gateway(&self) -> bool {
        if self.is_empty() {
            return false;
        }
        let Ok(json) = serde_json::to_string(&self.raw) else {
            return false;
        };
        requires_gateway(&json)
    }
}

fn requires_gateway(json: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(
            r#"\b(country|region|city|os|device_type|browser_string|ua|browser_version|os_version)\b|"custom_variable"\s*:\s*\{\s*"name"\s*:\s*"inlist\([^)]*\)""#,
        )
        .expect("static pattern must compile")
    });

    pattern.find_iter(json).any(|m| {
        if m.as_str().starts_with("\"custom_variable\"") {
            return true;
        }
        // Keywords inside a custom_variable object are user attribute names, not gateway data.
        let Some(object_start) = json[..m.start()].rfind("\"custom_variable\"") else {
            return true;
        };
        match json[object_start..].find('}') {
            Some(offset) => object_start + offset < m.start(),
            None => true,
        }
    })
}

impl<'de> Deserialize<'de> for Segment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(Segment::compile(raw))
    }
}

impl Serialize for Segment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl Node {
    fn compile(value: &serde_json::Value) -> Node {
        let Some(object) = value.as_object() else {
            return if value.is_null() {
                Node::Empty
            } else {
                Node::Invalid
            };
        };
        let Some((operator, operand)) = object.iter().next() else {
            return Node::Empty;
        };

        match operator.as_str() {
            "and" => Node::compile_list(operand).map_or(Node::Invalid, Node::And),
            "or" => Node::compile_list(operand).map_or(Node::Invalid, Node::Or),
            "not" if operand.is_object() => Node::Not(Box::new(Node::compile(operand))),
            "custom_variable" => Node::compile_custom_variable(operand),
            "user" => match operand.as_str() {
                Some(users) => Node::User(
                    users
                        .split(',')
                        .map(|user| user.replace('"', "").trim().to_owned())
                        .collect(),
                ),
                None => Node::Invalid,
            },
            "ua" => string_operand(operand).map_or(Node::Invalid, Node::UserAgent),
            "ip_address" => string_operand(operand).map_or(Node::Invalid, Node::IpAddress),
            "browser_version" => {
                string_operand(operand).map_or(Node::Invalid, Node::BrowserVersion)
            }
            "os_version" => string_operand(operand).map_or(Node::Invalid, Node::OsVersion),
            field @ ("country" | "region" | "city") => match scalar_to_string(operand) {
                Some(value) => Node::Location {
                    field: field.to_owned(),
                    value: normalize_location(&value),
                },
                None => Node::Invalid,
            },
            field @ ("os" | "device_type" | "browser_string" | "device") => {
                let values: Vec<&str> = match operand {
                    serde_json::Value::String(s) => vec![s.as_str()],
                    serde_json::Value::Array(items) => {
                        items.iter().filter_map(|item| item.as_str()).collect()
                    }
                    _ => return Node::Invalid,
                };
                Node::UserAgentInfo {
                    field: field.to_owned(),
                    values: values.into_iter().map(UaPattern::compile).collect(),
                }
            }
            "featureId" => Node::compile_feature(operand),
            other => {
                log::debug!(target: "vwo", operator = other; "unknown segmentation operator");
                Node::Invalid
            }
        }
    }

    /// Non-object entries are skipped.
    fn compile_list(value: &serde_json::Value) -> Option<Vec<Node>> {
        let items = value.as_array()?;
        Some(
            items
                .iter()
                .filter(|item| item.is_object())
                .map(Node::compile)
                .collect(),
        )
    }

    fn compile_custom_variable(value: &serde_json::Value) -> Node {
        let Some((name, operand)) = value.as_object().and_then(|object| object.iter().next())
        else {
            return Node::Invalid;
        };
        let Some(operand) = scalar_to_string(operand) else {
            return Node::Invalid;
        };

        if operand.contains("inlist") {
            static PATTERN: OnceLock<Regex> = OnceLock::new();
            let pattern = PATTERN.get_or_init(|| {
                Regex::new(r"inlist\(([^)]+)\)").expect("static pattern must compile")
            });
            return match pattern.captures(&operand).and_then(|c| c.get(1)) {
                Some(list_id) => Node::InList {
                    name: name.clone(),
                    list_id: list_id.as_str().to_owned(),
                },
                None => {
                    log::debug!(target: "vwo", operand; "invalid attribute list format");
                    Node::Invalid
                }
            };
        }

        Node::CustomVariable {
            name: name.clone(),
            operand: Operand::parse(&operand),
        }
    }

    fn compile_feature(value: &serde_json::Value) -> Node {
        let Some((feature_id, state)) = value.as_object().and_then(|object| object.iter().next())
        else {
            return Node::Invalid;
        };
        let enabled = match state.as_str() {
            Some("on") => true,
            Some("off") => false,
            _ => return Node::Invalid,
        };
        match feature_id.parse() {
            Ok(feature_id) => Node::Feature {
                feature_id,
                enabled,
            },
            Err(_) => Node::Invalid,
        }
    }

    fn evaluate(&self, properties: &Attributes, context: &SegmentContext) -> bool {
        match self {
            Node::Empty => true,
            Node::And(nodes) => nodes.iter().all(|node| node.evaluate(properties, context)),
            Node::Or(nodes) => nodes.iter().any(|node| node.evaluate(properties, context)),
            Node::Not(node) => !node.evaluate(properties, context),
            Node::CustomVariable { name, operand } => match properties.get(name) {
                Some(AttributeValue::Null) | None => false,
                Some(value) => operand.matches(&value.to_tag_string()),
            },
            Node::InList { name, list_id } => {
                let Some(value) = properties.get(name).filter(|v| **v != AttributeValue::Null)
                else {
                    return false;
                };
                let Some(gateway) = context.gateway else {
                    log::debug!(target: "vwo", list_id; "gateway service required for list segments");
                    return false;
                };
                let attribute = value.to_tag_string();
                gateway
                    .check_attribute(attribute.trim(), list_id)
                    .unwrap_or_else(|err| {
                        log::warn!(target: "vwo", list_id; "failed to check attribute list: {err:?}");
                        false
                    })
            }
            Node::User(users) => match properties.get(VWO_USER_ID_KEY) {
                Some(user_id) => {
                    let user_id = user_id.to_tag_string();
                    users.iter().any(|user| *user == user_id)
                }
                None => false,
            },
            Node::UserAgent(operand) => match context.user.user_agent() {
                Some(user_agent) => operand.matches(user_agent),
                None => {
                    log::debug!(target: "vwo", user_id = context.user.id; "user agent is required for ua segment");
                    false
                }
            },
            Node::IpAddress(operand) => context
                .user
                .ip_address()
                .is_some_and(|ip| operand.matches_raw(ip)),
            Node::BrowserVersion(operand) => {
                user_agent_field(context, "browser_version").is_some_and(|v| operand.matches_raw(v))
            }
            Node::OsVersion(operand) => {
                user_agent_field(context, "os_version").is_some_and(|v| operand.matches_raw(v))
            }
            Node::Location { field, value } => {
                if context.user.ip_address().is_none() {
                    log::debug!(target: "vwo", user_id = context.user.id; "ip address is required for location segment");
                    return false;
                }
                let Some(location) = context
                    .user
                    .gateway_data
                    .as_ref()
                    .map(|data| &data.location)
                    .filter(|location| !location.is_empty())
                else {
                    return false;
                };
                location
                    .get(field)
                    .is_some_and(|actual| normalize_location(actual) == *value)
            }
            Node::UserAgentInfo { field, values } => {
                if context.user.user_agent().is_none() {
                    return false;
                }
                let Some(actual) = user_agent_field(context, field) else {
                    return false;
                };
                values.iter().any(|pattern| pattern.matches(actual))
            }
            Node::Feature {
                feature_id,
                enabled,
            } => {
                let Some(feature) = context.settings.feature_by_id(*feature_id) else {
                    log::debug!(target: "vwo", feature_id; "feature referenced by segment not found");
                    return false;
                };
                let has_decision = context
                    .storage
                    .get(&feature.key, &context.user.id)
                    .is_some();
                has_decision == *enabled
            }
            Node::Invalid => false,
        }
    }
}

impl UaPattern {
    fn compile(value: &str) -> UaPattern {
        match value
            .strip_prefix("wildcard(")
            .and_then(|v| v.strip_suffix(')'))
        {
            Some(pattern) => UaPattern::Wildcard(
                Regex::new(&format!("(?i){}", pattern.replace('*', ".*"))).ok(),
            ),
            None => UaPattern::Exact(value.to_lowercase()),
        }
    }

    fn matches(&self, actual: &str) -> bool {
        match self {
            UaPattern::Wildcard(regex) => regex.as_ref().is_some_and(|r| r.is_match(actual)),
            UaPattern::Exact(expected) => *expected == actual.trim().to_lowercase(),
        }
    }
}

fn user_agent_field<'a>(context: &'a SegmentContext, field: &str) -> Option<&'a str> {
    context
        .user
        .gateway_data
        .as_ref()?
        .user_agent
        .get(field)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn string_operand(value: &serde_json::Value) -> Option<Operand> {
    value.as_str().map(Operand::parse)
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn normalize_location(value: &str) -> String {
    value.trim().trim_matches('"').to_owned()
}
