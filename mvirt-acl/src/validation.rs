//! Validation of declared ACL rules.
//!
//! Everything here runs before the first remote call, so a bad declaration
//! never leaves partial state behind.

use std::collections::HashSet;

use thiserror::Error;

use crate::config::AclConfig;
use crate::config::RuleDecl;
use crate::rule::{Action, LogicalRule, PortSpec, RuleProtocol, TrafficType, Transport};

/// Validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("ACL identifier is required")]
    AclIdRequired,

    #[error("Parallelism must be at least 1")]
    InvalidParallelism,

    #[error("Retry budget must be at least 1 attempt")]
    InvalidRetryBudget,

    #[error("You must supply at least one rule when unmanaged extras are not allowed")]
    NoRules,

    #[error("Rule {rule}: parameter action only accepts 'allow' or 'deny' as values, got {value:?}")]
    InvalidAction { rule: usize, value: String },

    #[error("Rule {rule}: parameter traffic_type only accepts 'ingress' or 'egress' as values, got {value:?}")]
    InvalidTrafficType { rule: usize, value: String },

    #[error("Rule {rule}: {value:?} is not a valid protocol. Valid options are 'tcp', 'udp', 'icmp', 'all' or a valid protocol number")]
    InvalidProtocol { rule: usize, value: String },

    #[error("Rule {rule}: parameter {field} is required when using protocol 'icmp'")]
    IcmpFieldRequired { rule: usize, field: &'static str },

    #[error("Rule {rule}: parameter ports is required when using protocol {protocol}")]
    PortsRequired { rule: usize, protocol: String },

    #[error("Rule {rule}: ports not allowed for protocol {protocol}")]
    PortsNotAllowed { rule: usize, protocol: String },

    #[error("Rule {rule}: {value:?} is not a valid port value. Valid options are '80' or '80-90'")]
    InvalidPortSpec { rule: usize, value: String },

    #[error("Rule {rule}: port {value:?} is declared more than once")]
    DuplicatePort { rule: usize, value: String },

    #[error("Rule {rule}: at least one CIDR is required")]
    CidrRequired { rule: usize },
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Validate the container-level settings.
pub fn validate_settings(config: &AclConfig) -> Result<()> {
    if config.acl_id.trim().is_empty() {
        return Err(ValidationError::AclIdRequired);
    }
    if config.parallelism == 0 {
        return Err(ValidationError::InvalidParallelism);
    }
    if config.retry.max_attempts == 0 {
        return Err(ValidationError::InvalidRetryBudget);
    }
    Ok(())
}

/// Validate a whole declaration and convert it into typed rules.
pub fn validate_rules(rules: &[RuleDecl], unmanaged_extras_allowed: bool) -> Result<Vec<LogicalRule>> {
    if rules.is_empty() && !unmanaged_extras_allowed {
        return Err(ValidationError::NoRules);
    }

    rules
        .iter()
        .enumerate()
        .map(|(index, decl)| validate_rule(index, decl))
        .collect()
}

/// Validate a single declared rule. `index` is only used for error context.
pub fn validate_rule(index: usize, decl: &RuleDecl) -> Result<LogicalRule> {
    let action = Action::parse(&decl.action)
        .filter(|_| decl.action == decl.action.to_ascii_lowercase())
        .ok_or_else(|| ValidationError::InvalidAction {
            rule: index,
            value: decl.action.clone(),
        })?;

    let traffic_type = TrafficType::parse(&decl.traffic_type)
        .filter(|_| decl.traffic_type == decl.traffic_type.to_ascii_lowercase())
        .ok_or_else(|| ValidationError::InvalidTrafficType {
            rule: index,
            value: decl.traffic_type.clone(),
        })?;

    let cidr_list: Vec<String> = decl
        .cidr_list
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if cidr_list.is_empty() {
        return Err(ValidationError::CidrRequired { rule: index });
    }

    let protocol = match decl.protocol.as_str() {
        "icmp" => {
            reject_ports(index, decl)?;
            let icmp_type = decl.icmp_type.ok_or(ValidationError::IcmpFieldRequired {
                rule: index,
                field: "icmp_type",
            })?;
            let icmp_code = decl.icmp_code.ok_or(ValidationError::IcmpFieldRequired {
                rule: index,
                field: "icmp_code",
            })?;
            RuleProtocol::Icmp {
                icmp_type,
                icmp_code,
            }
        }
        "all" => {
            reject_ports(index, decl)?;
            RuleProtocol::All
        }
        "tcp" | "udp" => {
            let transport = if decl.protocol == "tcp" {
                Transport::Tcp
            } else {
                Transport::Udp
            };
            RuleProtocol::Ports {
                transport,
                ports: validate_ports(index, decl)?,
            }
        }
        other => {
            let number = other
                .parse::<u8>()
                .map_err(|_| ValidationError::InvalidProtocol {
                    rule: index,
                    value: other.to_string(),
                })?;
            reject_ports(index, decl)?;
            RuleProtocol::Number { number }
        }
    };

    Ok(LogicalRule::new(action, protocol, cidr_list, traffic_type))
}

fn reject_ports(index: usize, decl: &RuleDecl) -> Result<()> {
    if !decl.ports.is_empty() {
        return Err(ValidationError::PortsNotAllowed {
            rule: index,
            protocol: decl.protocol.clone(),
        });
    }
    Ok(())
}

fn validate_ports(index: usize, decl: &RuleDecl) -> Result<Vec<String>> {
    if decl.ports.is_empty() {
        return Err(ValidationError::PortsRequired {
            rule: index,
            protocol: decl.protocol.clone(),
        });
    }

    let mut seen = HashSet::new();
    for port in &decl.ports {
        if PortSpec::parse(port).is_none() {
            return Err(ValidationError::InvalidPortSpec {
                rule: index,
                value: port.clone(),
            });
        }
        if !seen.insert(port.as_str()) {
            return Err(ValidationError::DuplicatePort {
                rule: index,
                value: port.clone(),
            });
        }
    }
    Ok(decl.ports.clone())
}
