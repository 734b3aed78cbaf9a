//! Expansion of logical rules into sub-rule create operations.

use std::collections::BTreeSet;

use crate::rule::{CreateRuleRequest, LogicalRule, PortSpec, RuleProtocol};
use crate::validation::ValidationError;

/// One remote create to perform for a logical rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOp {
    /// Sub-rule key the resulting id is stored under
    pub key: String,
    /// Ordinal assigned at the control plane
    pub ordinal: u32,
    pub request: CreateRuleRequest,
}

/// First ordinal of each rule in a declared sequence.
///
/// Ordinals start at 1 and every rule consumes one ordinal per expected
/// sub-rule key, whether or not that sub-rule already exists. Numbering is
/// therefore a pure function of the declaration.
pub fn plan_ordinals(rules: &[LogicalRule]) -> Vec<u32> {
    let mut next = 1u32;
    rules
        .iter()
        .map(|rule| {
            let start = next;
            next = next.saturating_add(rule.expected_keys().len() as u32);
            start
        })
        .collect()
}

/// Expand `rule` into the creates still missing from its `sub_rule_ids`.
///
/// `start` is the ordinal of the rule's first sub-rule. Keys already present
/// are skipped but still consume their ordinal.
pub fn expand(
    acl_id: &str,
    rule_index: usize,
    rule: &LogicalRule,
    start: u32,
) -> Result<Vec<CreateOp>, ValidationError> {
    let cidr_list: Vec<String> = rule.cidr_list.iter().cloned().collect();
    let base = CreateRuleRequest {
        acl_id: acl_id.to_string(),
        action: rule.action,
        protocol: rule.protocol.wire_name(),
        cidr_list,
        traffic_type: rule.traffic_type,
        number: start,
        icmp_type: None,
        icmp_code: None,
        start_port: None,
        end_port: None,
    };

    let mut ops = Vec::new();
    let mut push = |key: String, request: CreateRuleRequest| {
        if !rule.sub_rule_ids.contains_key(&key) {
            ops.push(CreateOp {
                key,
                ordinal: request.number,
                request,
            });
        }
    };

    match &rule.protocol {
        RuleProtocol::Icmp {
            icmp_type,
            icmp_code,
        } => push(
            crate::rule::ICMP_KEY.to_string(),
            CreateRuleRequest {
                icmp_type: Some(*icmp_type),
                icmp_code: Some(*icmp_code),
                ..base
            },
        ),
        RuleProtocol::All | RuleProtocol::Number { .. } => {
            push(crate::rule::ALL_KEY.to_string(), base)
        }
        RuleProtocol::Ports { ports, .. } => {
            for (offset, token) in ports.iter().enumerate() {
                let spec = PortSpec::parse(token).ok_or_else(|| ValidationError::InvalidPortSpec {
                    rule: rule_index,
                    value: token.clone(),
                })?;
                push(
                    token.clone(),
                    CreateRuleRequest {
                        number: start.saturating_add(offset as u32),
                        start_port: Some(spec.start),
                        end_port: Some(spec.end),
                        ..base.clone()
                    },
                );
            }
        }
        // Placeholders describe remote state we do not own; nothing to create.
        RuleProtocol::Unmanaged { .. } => {}
    }

    Ok(ops)
}

/// Move ops whose ordinal is in `taken`, or already used by an earlier op,
/// past the highest ordinal seen. Returns how many ops were moved.
pub fn avoid_taken(ops: &mut [(usize, CreateOp)], taken: &BTreeSet<u32>) -> usize {
    let highest = ops
        .iter()
        .map(|(_, op)| op.ordinal)
        .chain(taken.iter().copied())
        .max()
        .unwrap_or(0);
    let mut next = highest.saturating_add(1);
    let mut used = taken.clone();
    let mut moved = 0;

    for (_, op) in ops.iter_mut() {
        if used.contains(&op.ordinal) {
            op.ordinal = next;
            op.request.number = next;
            next = next.saturating_add(1);
            moved += 1;
        }
        used.insert(op.ordinal);
    }
    moved
}
