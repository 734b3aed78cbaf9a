//! Typed ACL rule model.
//!
//! A [`LogicalRule`] is one rule as declared by the operator. It expands into
//! one or more sub-rules on the control plane, each tracked by its remote id
//! under a sub-rule key:
//! - `"icmp"` for icmp rules
//! - `"all"` for the all-protocol case and numeric protocols
//! - the literal port token (`"80"`, `"443-445"`) for tcp/udp

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Sub-rule key used for icmp rules.
pub const ICMP_KEY: &str = "icmp";
/// Sub-rule key used for all-protocol and numeric-protocol rules.
pub const ALL_KEY: &str = "all";

/// Rule action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
        }
    }

    /// Parse an action, ignoring case (the control plane reports `Allow`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Some(Action::Allow),
            "deny" => Some(Action::Deny),
            _ => None,
        }
    }
}

/// Traffic direction a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficType {
    Ingress,
    Egress,
}

impl TrafficType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficType::Ingress => "ingress",
            TrafficType::Egress => "egress",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ingress" => Some(TrafficType::Ingress),
            "egress" => Some(TrafficType::Egress),
            _ => None,
        }
    }
}

/// Transport protocol of a port-based rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

/// A single port or an inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub start: u16,
    pub end: u16,
}

impl PortSpec {
    /// Parse `"80"` or `"80-90"`. Returns `None` for anything else, including
    /// ranges whose start is greater than their end.
    pub fn parse(token: &str) -> Option<Self> {
        let (start, end) = match token.split_once('-') {
            Some((start, end)) => (parse_port(start)?, parse_port(end)?),
            None => {
                let port = parse_port(token)?;
                (port, port)
            }
        };
        if start > end {
            return None;
        }
        Some(Self { start, end })
    }

    /// Sub-rule key for a remote rule covering this range.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Protocol-specific part of a rule, one variant per protocol family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum RuleProtocol {
    Icmp {
        icmp_type: i32,
        icmp_code: i32,
    },
    All,
    /// tcp/udp with the declared port tokens, in declaration order.
    Ports {
        transport: Transport,
        ports: Vec<String>,
    },
    /// Any other IP protocol given by number.
    Number { number: u8 },
    /// Placeholder for a remote rule this declaration does not own.
    Unmanaged { remote_id: String },
}

impl RuleProtocol {
    /// Protocol string as submitted to the control plane.
    pub fn wire_name(&self) -> String {
        match self {
            RuleProtocol::Icmp { .. } => "icmp".to_string(),
            RuleProtocol::All => "all".to_string(),
            RuleProtocol::Ports { transport, .. } => transport.as_str().to_string(),
            RuleProtocol::Number { number } => number.to_string(),
            RuleProtocol::Unmanaged { remote_id } => remote_id.clone(),
        }
    }

    /// Sub-rule keys implied by this protocol configuration, in expansion order.
    pub fn expected_keys(&self) -> Vec<String> {
        match self {
            RuleProtocol::Icmp { .. } => vec![ICMP_KEY.to_string()],
            RuleProtocol::All | RuleProtocol::Number { .. } => vec![ALL_KEY.to_string()],
            RuleProtocol::Ports { ports, .. } => ports.clone(),
            RuleProtocol::Unmanaged { remote_id } => vec![remote_id.clone()],
        }
    }

    fn family(&self) -> Family {
        match self {
            RuleProtocol::Icmp { .. } => Family::Icmp,
            RuleProtocol::All => Family::All,
            RuleProtocol::Ports { .. } => Family::Ports,
            RuleProtocol::Number { .. } => Family::Number,
            RuleProtocol::Unmanaged { .. } => Family::Unmanaged,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Icmp,
    All,
    Ports,
    Number,
    Unmanaged,
}

/// Remote identifiers of a rule's sub-rules, keyed by sub-rule key.
pub type SubRuleIds = BTreeMap<String, String>;

/// One declared firewall rule plus the remote ids of its sub-rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalRule {
    pub action: Action,
    pub cidr_list: BTreeSet<String>,
    pub traffic_type: TrafficType,
    #[serde(flatten)]
    pub protocol: RuleProtocol,
    #[serde(default)]
    pub sub_rule_ids: SubRuleIds,
}

impl LogicalRule {
    pub fn new(
        action: Action,
        protocol: RuleProtocol,
        cidr_list: impl IntoIterator<Item = String>,
        traffic_type: TrafficType,
    ) -> Self {
        Self {
            action,
            cidr_list: cidr_list.into_iter().collect(),
            traffic_type,
            protocol,
            sub_rule_ids: SubRuleIds::new(),
        }
    }

    /// Placeholder for a remote rule nobody declared.
    pub fn unmanaged(remote_id: &str) -> Self {
        let mut rule = Self::new(
            Action::Allow,
            RuleProtocol::Unmanaged {
                remote_id: remote_id.to_string(),
            },
            [remote_id.to_string()],
            TrafficType::Ingress,
        );
        rule.sub_rule_ids
            .insert(remote_id.to_string(), remote_id.to_string());
        rule
    }

    pub fn is_unmanaged(&self) -> bool {
        matches!(self.protocol, RuleProtocol::Unmanaged { .. })
    }

    /// Structural equality over the declared fields, ignoring remote ids.
    pub fn same_declaration(&self, other: &LogicalRule) -> bool {
        self.action == other.action
            && self.cidr_list == other.cidr_list
            && self.traffic_type == other.traffic_type
            && self.protocol == other.protocol
    }

    pub fn expected_keys(&self) -> Vec<String> {
        self.protocol.expected_keys()
    }

    /// Short human readable description used in logs and errors.
    pub fn describe(&self) -> String {
        match &self.protocol {
            RuleProtocol::Ports { transport, ports } => format!(
                "{} {} [{}] {}",
                self.action.as_str(),
                transport.as_str(),
                ports.join(","),
                self.traffic_type.as_str()
            ),
            RuleProtocol::Unmanaged { remote_id } => format!("unmanaged {}", remote_id),
            other => format!(
                "{} {} {}",
                self.action.as_str(),
                other.wire_name(),
                self.traffic_type.as_str()
            ),
        }
    }
}

/// A sub-rule as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRule {
    pub id: String,
    pub protocol: String,
    pub action: String,
    pub cidr_list: Vec<String>,
    pub traffic_type: String,
    #[serde(default)]
    pub icmp_type: Option<i32>,
    #[serde(default)]
    pub icmp_code: Option<i32>,
    #[serde(default)]
    pub start_port: Option<u16>,
    #[serde(default)]
    pub end_port: Option<u16>,
    #[serde(default)]
    pub number: Option<u32>,
}

impl RemoteRule {
    /// CIDRs with comma-joined entries split apart.
    pub fn cidrs(&self) -> BTreeSet<String> {
        self.cidr_list
            .iter()
            .flat_map(|c| c.split(','))
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    }

    fn port_spec(&self) -> Option<PortSpec> {
        let start = self.start_port?;
        let end = self.end_port.unwrap_or(start);
        Some(PortSpec { start, end })
    }

    /// Rebuild a single-sub-rule logical rule from the remote fields alone.
    ///
    /// Returns `None` when the remote values are not representable (unknown
    /// action, traffic type or protocol).
    pub fn to_logical(&self) -> Option<LogicalRule> {
        let action = Action::parse(&self.action)?;
        let traffic_type = TrafficType::parse(&self.traffic_type)?;
        let proto = self.protocol.trim().to_ascii_lowercase();
        let (protocol, key) = match proto.as_str() {
            "icmp" => (
                RuleProtocol::Icmp {
                    icmp_type: self.icmp_type.unwrap_or(-1),
                    icmp_code: self.icmp_code.unwrap_or(-1),
                },
                ICMP_KEY.to_string(),
            ),
            "all" => (RuleProtocol::All, ALL_KEY.to_string()),
            "tcp" | "udp" => {
                let key = self.port_spec()?.key();
                let transport = if proto == "tcp" {
                    Transport::Tcp
                } else {
                    Transport::Udp
                };
                (
                    RuleProtocol::Ports {
                        transport,
                        ports: vec![key.clone()],
                    },
                    key,
                )
            }
            other => (
                RuleProtocol::Number {
                    number: other.parse().ok()?,
                },
                ALL_KEY.to_string(),
            ),
        };

        let mut rule = LogicalRule::new(action, protocol, self.cidrs(), traffic_type);
        rule.sub_rule_ids.insert(key, self.id.clone());
        Some(rule)
    }
}

/// Overwrite the declared fields of `rule` with the remote truth.
///
/// Only valid when the remote protocol stays within the rule's protocol
/// family; returns `false` (leaving the rule untouched) otherwise.
pub(crate) fn refresh_from_remote(rule: &mut LogicalRule, remote: &LogicalRule) -> bool {
    if rule.protocol.family() != remote.protocol.family() {
        return false;
    }

    rule.action = remote.action;
    rule.cidr_list = remote.cidr_list.clone();
    rule.traffic_type = remote.traffic_type;
    match (&mut rule.protocol, &remote.protocol) {
        (
            RuleProtocol::Ports { transport, .. },
            RuleProtocol::Ports {
                transport: remote_transport,
                ..
            },
        ) => *transport = *remote_transport,
        (local, remote) => *local = remote.clone(),
    }
    true
}

/// Parameters of a single create call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateRuleRequest {
    pub acl_id: String,
    pub action: Action,
    pub protocol: String,
    pub cidr_list: Vec<String>,
    pub traffic_type: TrafficType,
    /// Ordinal (priority) at the control plane.
    pub number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_type: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,
}

impl CreateRuleRequest {
    /// What the control plane would report back for this request.
    pub fn to_remote(&self, id: &str) -> RemoteRule {
        RemoteRule {
            id: id.to_string(),
            protocol: self.protocol.clone(),
            action: self.action.as_str().to_string(),
            cidr_list: self.cidr_list.clone(),
            traffic_type: self.traffic_type.as_str().to_string(),
            icmp_type: self.icmp_type,
            icmp_code: self.icmp_code,
            start_port: self.start_port,
            end_port: self.end_port,
            number: Some(self.number),
        }
    }
}
