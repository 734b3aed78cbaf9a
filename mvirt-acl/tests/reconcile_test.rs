//! ACL reconciliation integration tests.
//!
//! Drive `AclReconciler` end to end against the in-memory control plane,
//! including injected failures and concurrent dispatch.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mvirt_acl::config::{AclConfig, DiffMode, RateLimitConfig, RuleDecl};
use mvirt_acl::error::{AclError, OperationKind};
use mvirt_acl::reconciler::{AclReconciler, Phase, TrackedState};
use mvirt_acl::rule::{RemoteRule, RuleProtocol};
use mvirt_acl::test_util::{Fault, MemoryAclClient};
use mvirt_acl::validation::{validate_rules, ValidationError};

const ACL: &str = "acl-test";

fn test_config() -> AclConfig {
    let mut config = AclConfig::new(ACL);
    config.rate_limit = RateLimitConfig::unlimited();
    config
}

fn setup() -> Arc<MemoryAclClient> {
    Arc::new(MemoryAclClient::new(&[ACL]))
}

fn reconciler(client: &Arc<MemoryAclClient>, config: &AclConfig) -> AclReconciler {
    AclReconciler::new(client.clone(), config).expect("valid settings")
}

fn tcp(ports: &[&str]) -> RuleDecl {
    RuleDecl::ports("tcp", "0.0.0.0/0", ports)
}

fn untracked_remote(id: &str, number: u32) -> RemoteRule {
    RemoteRule {
        id: id.to_string(),
        protocol: "udp".to_string(),
        action: "Allow".to_string(),
        cidr_list: vec!["192.168.0.0/16".to_string()],
        traffic_type: "Ingress".to_string(),
        icmp_type: None,
        icmp_code: None,
        start_port: Some(53),
        end_port: Some(53),
        number: Some(number),
    }
}

#[tokio::test]
async fn test_port_range_token_is_one_sub_rule() {
    let client = setup();
    let outcome = reconciler(&client, &test_config())
        .create(&[tcp(&["80", "443-445"])])
        .await;

    assert!(outcome.is_ok(), "{:?}", outcome.result);

    let calls = client.create_calls();
    assert_eq!(calls.len(), 2);
    let mut numbered: Vec<(u32, Option<u16>, Option<u16>)> = calls
        .iter()
        .map(|c| (c.number, c.start_port, c.end_port))
        .collect();
    numbered.sort();
    assert_eq!(
        numbered,
        vec![(1, Some(80), Some(80)), (2, Some(443), Some(445))]
    );

    let state = outcome.state;
    assert_eq!(state.phase, Phase::Reconciled);
    assert!(state.last_reconciled.is_some());
    assert_eq!(state.rules.len(), 1);
    let keys: Vec<&str> = state.rules[0].sub_rule_ids.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["443-445", "80"]);
}

#[tokio::test]
async fn test_ordinals_unique_across_declaration() {
    let client = setup();
    let rules = vec![
        tcp(&["22", "80", "1000-2000"]),
        RuleDecl::icmp("0.0.0.0/0", 8, 0),
        RuleDecl::ports("udp", "10.0.0.0/8", &["53", "123"]),
    ];

    let outcome = reconciler(&client, &test_config()).create(&rules).await;
    assert!(outcome.is_ok(), "{:?}", outcome.result);

    let ordinals: Vec<u32> = client.create_calls().iter().map(|c| c.number).collect();
    let unique: BTreeSet<u32> = ordinals.iter().copied().collect();
    assert_eq!(ordinals.len(), 6);
    assert_eq!(unique, (1..=6).collect());

    // Ordinals follow declaration order: tcp 1-3, icmp 4, udp 5-6.
    let remote = client.rules(ACL);
    let protocols: Vec<&str> = remote.iter().map(|r| r.protocol.as_str()).collect();
    assert_eq!(protocols, vec!["tcp", "tcp", "tcp", "icmp", "udp", "udp"]);
}

#[tokio::test]
async fn test_partial_failure_is_durable() {
    let client = setup();
    client.fail_create(2, Fault::Always);

    let outcome = reconciler(&client, &test_config())
        .create(&[tcp(&["22", "80", "443"])])
        .await;

    let AclError::Batch(batch) = outcome.result.unwrap_err() else {
        panic!("expected a batch error");
    };
    assert_eq!(batch.len(), 1);
    assert!(batch.contains(0, "80"));
    assert_eq!(batch.errors[0].kind, OperationKind::Create);
    assert!(batch.to_string().contains("failed to create rule #2"));

    let state = outcome.state;
    assert_eq!(state.phase, Phase::Reconciled);
    assert_eq!(state.rules.len(), 1);
    let ids = &state.rules[0].sub_rule_ids;
    assert!(ids.contains_key("22"));
    assert!(ids.contains_key("443"));
    assert!(!ids.contains_key("80"));

    // The failing operation used the whole retry budget.
    let attempts = client.create_calls().iter().filter(|c| c.number == 2).count();
    assert_eq!(attempts, 4);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let client = setup();
    client.fail_create(1, Fault::Times(2));

    let outcome = reconciler(&client, &test_config()).create(&[tcp(&["80"])]).await;

    assert!(outcome.is_ok(), "{:?}", outcome.result);
    assert_eq!(client.create_calls().len(), 3);
    assert_eq!(client.rules(ACL).len(), 1);
}

#[tokio::test]
async fn test_update_resumes_missing_sub_rules() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);
    let rules = [tcp(&["22", "80", "443"])];

    client.fail_create(2, Fault::Times(4));
    let outcome = r.create(&rules).await;
    assert!(outcome.result.is_err());
    let before = client.create_calls().len();
    let kept: Vec<String> = outcome.state.rules[0].sub_rule_ids.values().cloned().collect();

    let outcome = r.update(outcome.state, &rules).await;
    assert!(outcome.is_ok(), "{:?}", outcome.result);

    // Only the missing sub-rule is created, with its original ordinal.
    let calls = client.create_calls();
    assert_eq!(calls.len(), before + 1);
    assert_eq!(calls[before].number, 2);
    assert_eq!(calls[before].start_port, Some(80));
    assert!(client.delete_calls().is_empty());

    let ids = &outcome.state.rules[0].sub_rule_ids;
    assert_eq!(ids.len(), 3);
    for id in kept {
        assert!(ids.values().any(|v| *v == id));
    }
}

#[tokio::test]
async fn test_update_without_changes_is_noop() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);
    let rules = [tcp(&["80"]), RuleDecl::icmp("0.0.0.0/0", -1, -1)];

    let created = r.create(&rules).await;
    assert!(created.is_ok());
    let calls = client.create_calls().len();

    let updated = r.update(created.state.clone(), &rules).await;
    assert!(updated.is_ok(), "{:?}", updated.result);
    assert_eq!(client.create_calls().len(), calls);
    assert!(client.delete_calls().is_empty());
    assert_eq!(updated.state.rules, created.state.rules);
}

#[tokio::test]
async fn test_delete_treats_already_gone_as_success() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    let created = r.create(&[tcp(&["80", "443"])]).await;
    assert!(created.is_ok());
    let gone = created.state.rules[0].sub_rule_ids["80"].clone();
    client.remove_rule(&gone);

    let deleted = r.delete(created.state).await;
    assert!(deleted.is_ok(), "{:?}", deleted.result);
    assert!(deleted.state.is_absent());
    assert!(deleted.state.rules.is_empty());
    assert!(client.delete_calls().contains(&gone));
    assert!(client.rules(ACL).is_empty());
}

#[tokio::test]
async fn test_delete_keeps_failed_sub_rules() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    let created = r.create(&[tcp(&["80", "443"]), RuleDecl::icmp("0.0.0.0/0", 8, 0)]).await;
    assert!(created.is_ok());
    let stuck = created.state.rules[0].sub_rule_ids["443"].clone();
    client.fail_delete(&stuck, Fault::Always);

    let deleted = r.delete(created.state).await;
    let AclError::Batch(batch) = deleted.result.unwrap_err() else {
        panic!("expected a batch error");
    };
    assert!(batch.contains(0, "443"));
    assert_eq!(batch.errors[0].kind, OperationKind::Delete);

    let state = deleted.state;
    assert_eq!(state.phase, Phase::Reconciled);
    assert_eq!(state.rules.len(), 1);
    assert_eq!(state.rules[0].sub_rule_ids.len(), 1);
    assert_eq!(state.rules[0].sub_rule_ids["443"], stuck);

    // A second delete only retries what is left.
    client.fail_delete(&stuck, Fault::Times(0));
    let deleted = r.delete(state).await;
    assert!(deleted.is_ok());
    assert!(deleted.state.is_absent());
    assert!(client.rules(ACL).is_empty());
}

#[tokio::test]
async fn test_create_then_read_round_trip() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    let mut deny = RuleDecl::icmp("10.0.0.0/8", 8, 0);
    deny.action = "deny".to_string();
    deny.traffic_type = "egress".to_string();
    let gre = RuleDecl::ports("47", "172.16.0.0/12", &[]);
    let mut all = RuleDecl::ports("all", "0.0.0.0/0", &[]);
    all.cidr_list.push("::/0".to_string());
    let rules = vec![
        RuleDecl {
            cidr_list: vec!["10.0.0.0/8".to_string(), "192.168.0.0/16".to_string()],
            ..tcp(&["22", "8000-8080"])
        },
        deny,
        gre,
        all,
    ];

    let created = r.create(&rules).await;
    assert!(created.is_ok(), "{:?}", created.result);

    let read = r.read(created.state).await;
    assert!(read.is_ok(), "{:?}", read.result);

    let declared = validate_rules(&rules, false).unwrap();
    assert_eq!(read.state.rules.len(), declared.len());
    for (tracked, declared) in read.state.rules.iter().zip(&declared) {
        assert!(
            tracked.same_declaration(declared),
            "{} != {}",
            tracked.describe(),
            declared.describe()
        );
        assert_eq!(tracked.sub_rule_ids.len(), declared.expected_keys().len());
    }
}

#[tokio::test]
async fn test_read_refreshes_drifted_fields() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    let created = r.create(&[tcp(&["80"])]).await;
    let id = created.state.rules[0].sub_rule_ids["80"].clone();
    client.update_rule(&id, |rule| {
        rule.action = "Deny".to_string();
        rule.cidr_list = vec!["10.0.0.0/8,10.1.0.0/16".to_string()];
    });

    let read = r.read(created.state).await;
    assert!(read.is_ok());
    let rule = &read.state.rules[0];
    assert_eq!(rule.action.as_str(), "deny");
    assert_eq!(
        rule.cidr_list.iter().map(String::as_str).collect::<Vec<_>>(),
        vec!["10.0.0.0/8", "10.1.0.0/16"]
    );
    assert_eq!(rule.sub_rule_ids["80"], id);
}

#[tokio::test]
async fn test_read_synthesizes_unmanaged_placeholders() {
    let client = setup();
    let mut config = test_config();
    config.unmanaged_extras_allowed = true;
    let r = reconciler(&client, &config);

    let created = r.create(&[tcp(&["80"])]).await;
    assert!(created.is_ok());
    client.insert_rule(ACL, untracked_remote("extra-a", 100));
    client.insert_rule(ACL, untracked_remote("extra-b", 101));

    let read = r.read(created.state).await;
    assert!(read.is_ok(), "{:?}", read.result);
    let state = read.state;
    assert_eq!(state.phase, Phase::Reconciled);
    assert_eq!(state.rules.len(), 3);
    assert!(!state.rules[0].is_unmanaged());

    let placeholders: Vec<_> = state.rules.iter().filter(|r| r.is_unmanaged()).collect();
    assert_eq!(placeholders.len(), 2);
    for (placeholder, id) in placeholders.iter().zip(["extra-a", "extra-b"]) {
        assert_eq!(
            placeholder.protocol,
            RuleProtocol::Unmanaged {
                remote_id: id.to_string()
            }
        );
        assert_eq!(placeholder.cidr_list.iter().collect::<Vec<_>>(), vec![id]);
    }

    // Placeholders survive an update and are never deleted remotely.
    let updated = r.update(state, &[tcp(&["80"])]).await;
    assert!(updated.is_ok(), "{:?}", updated.result);
    assert_eq!(updated.state.rules.len(), 3);
    assert!(client.delete_calls().is_empty());
}

#[tokio::test]
async fn test_read_only_extras_keeps_state() {
    let client = setup();
    let mut config = test_config();
    config.unmanaged_extras_allowed = true;
    let r = reconciler(&client, &config);

    let created = r.create(&[]).await;
    assert!(created.is_ok(), "{:?}", created.result);
    assert!(client.create_calls().is_empty());
    assert_eq!(created.state.phase, Phase::Reconciled);

    client.insert_rule(ACL, untracked_remote("extra-a", 1));
    client.insert_rule(ACL, untracked_remote("extra-b", 2));
    let read = r.read(created.state).await;
    assert_eq!(read.state.rules.len(), 2);
    assert!(read.state.rules.iter().all(|r| r.is_unmanaged()));
    assert!(!read.state.is_absent());
}

#[tokio::test]
async fn test_read_ignores_untracked_rules_by_default() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    let created = r.create(&[tcp(&["80"])]).await;
    client.insert_rule(ACL, untracked_remote("extra-a", 100));

    let read = r.read(created.state).await;
    assert!(read.is_ok());
    assert_eq!(read.state.rules.len(), 1);
    assert!(!read.state.rules[0].is_unmanaged());
}

#[tokio::test]
async fn test_read_after_all_rules_vanished_is_absent() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    let created = r.create(&[tcp(&["80"])]).await;
    for rule in client.rules(ACL) {
        client.remove_rule(&rule.id);
    }

    let read = r.read(created.state).await;
    assert!(read.is_ok());
    assert!(read.state.is_absent());
    assert!(read.state.rules.is_empty());
}

#[tokio::test]
async fn test_read_of_removed_container_clears_state() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    let created = r.create(&[tcp(&["80", "443"])]).await;
    assert!(created.is_ok());
    client.remove_acl(ACL);

    let read = r.read(created.state).await;
    assert!(read.is_ok(), "{:?}", read.result);
    assert!(read.state.is_absent());
    assert!(read.state.rules.is_empty());
}

#[tokio::test]
async fn test_positional_update_compares_by_index() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    // old = [A, B], new = [B, C]
    let created = r.create(&[tcp(&["22"]), tcp(&["80"])]).await;
    assert!(created.is_ok());
    let old_ids: BTreeSet<String> = client.rules(ACL).into_iter().map(|r| r.id).collect();
    let creates_before = client.create_calls().len();

    let updated = r.update(created.state, &[tcp(&["80"]), tcp(&["443"])]).await;
    assert!(updated.is_ok(), "{:?}", updated.result);

    // Both slots differ, so both old rules are deleted and both new ones created.
    let deleted: BTreeSet<String> = client.delete_calls().into_iter().collect();
    assert_eq!(deleted, old_ids);
    let new_calls = &client.create_calls()[creates_before..];
    let mut created_ports: Vec<(u32, Option<u16>)> =
        new_calls.iter().map(|c| (c.number, c.start_port)).collect();
    created_ports.sort();
    assert_eq!(created_ports, vec![(1, Some(80)), (2, Some(443))]);

    let ports: Vec<Option<u16>> = client.rules(ACL).iter().map(|r| r.start_port).collect();
    assert_eq!(ports, vec![Some(80), Some(443)]);
    assert_eq!(updated.state.rules.len(), 2);
}

#[tokio::test]
async fn test_positional_update_ignores_trailing_rules() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    let created = r.create(&[tcp(&["22"]), tcp(&["80"])]).await;
    let updated = r.update(created.state, &[tcp(&["22"])]).await;
    assert!(updated.is_ok(), "{:?}", updated.result);

    // The second rule lies beyond the compared range and stays in place.
    assert!(client.delete_calls().is_empty());
    assert_eq!(client.rules(ACL).len(), 2);
    assert_eq!(updated.state.rules.len(), 2);
}

#[tokio::test]
async fn test_set_update_only_touches_changed_rules() {
    let client = setup();
    let mut config = test_config();
    config.diff_mode = DiffMode::Set;
    let r = reconciler(&client, &config);

    let created = r.create(&[tcp(&["22"]), tcp(&["80"])]).await;
    assert!(created.is_ok());
    let id_22 = created.state.rules[0].sub_rule_ids["22"].clone();
    let id_80 = created.state.rules[1].sub_rule_ids["80"].clone();
    let creates_before = client.create_calls().len();

    let updated = r.update(created.state, &[tcp(&["80"]), tcp(&["443"])]).await;
    assert!(updated.is_ok(), "{:?}", updated.result);

    assert_eq!(client.delete_calls(), vec![id_22]);
    let new_calls = &client.create_calls()[creates_before..];
    assert_eq!(new_calls.len(), 1);
    assert_eq!(new_calls[0].start_port, Some(443));
    // Ordinal 2 is still held by the kept rule.
    assert_eq!(new_calls[0].number, 3);

    let state = updated.state;
    assert_eq!(state.rules.len(), 2);
    assert_eq!(state.rules[0].sub_rule_ids["80"], id_80);
    assert!(state.rules[1].sub_rule_ids.contains_key("443"));
}

#[tokio::test]
async fn test_update_stops_after_failed_delete() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    let created = r.create(&[tcp(&["22"])]).await;
    let id = created.state.rules[0].sub_rule_ids["22"].clone();
    client.fail_delete(&id, Fault::Always);
    let creates_before = client.create_calls().len();

    let updated = r.update(created.state, &[tcp(&["443"])]).await;
    assert!(matches!(updated.result, Err(AclError::Batch(_))));
    assert_eq!(client.create_calls().len(), creates_before);

    let state = updated.state;
    assert_eq!(state.phase, Phase::Reconciled);
    assert_eq!(state.rules.len(), 1);
    assert_eq!(state.rules[0].sub_rule_ids["22"], id);

    // Once the delete goes through, the next update finishes the job.
    client.fail_delete(&id, Fault::Times(0));
    let updated = r.update(state, &[tcp(&["443"])]).await;
    assert!(updated.is_ok(), "{:?}", updated.result);
    let ports: Vec<Option<u16>> = client.rules(ACL).iter().map(|r| r.start_port).collect();
    assert_eq!(ports, vec![Some(443)]);
}

#[tokio::test]
async fn test_update_converges_after_failed_delete_of_later_rule() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    let created = r.create(&[tcp(&["22"]), tcp(&["80"])]).await;
    assert!(created.is_ok(), "{:?}", created.result);
    let stuck = created.state.rules[1].sub_rule_ids["80"].clone();
    client.fail_delete(&stuck, Fault::Always);

    let declared = [tcp(&["443"]), tcp(&["8080"])];
    let updated = r.update(created.state, &declared).await;
    assert!(matches!(updated.result, Err(AclError::Batch(_))));

    // The first slot is emptied but still held, so the second stays aligned.
    let state = updated.state;
    assert_eq!(state.rules.len(), 2);
    assert!(state.rules[0].sub_rule_ids.is_empty());
    assert_eq!(state.rules[1].sub_rule_ids["80"], stuck);

    client.fail_delete(&stuck, Fault::Times(0));
    let updated = r.update(state, &declared).await;
    assert!(updated.is_ok(), "{:?}", updated.result);

    let ports: Vec<Option<u16>> = client.rules(ACL).iter().map(|r| r.start_port).collect();
    assert_eq!(ports, vec![Some(443), Some(8080)]);
    assert_eq!(updated.state.rules.len(), 2);
    assert_eq!(updated.state.sub_rule_count(), 2);
}

#[tokio::test]
async fn test_emptied_slot_survives_read_between_updates() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    let created = r.create(&[tcp(&["22"]), tcp(&["80"])]).await;
    let stuck = created.state.rules[1].sub_rule_ids["80"].clone();
    client.fail_delete(&stuck, Fault::Always);
    let declared = [tcp(&["443"]), tcp(&["8080"])];
    let updated = r.update(created.state, &declared).await;
    assert!(updated.result.is_err());

    let read = r.read(updated.state).await;
    assert!(read.is_ok(), "{:?}", read.result);
    assert_eq!(read.state.rules.len(), 2);

    client.fail_delete(&stuck, Fault::Times(0));
    let updated = r.update(read.state, &declared).await;
    assert!(updated.is_ok(), "{:?}", updated.result);
    let ports: Vec<Option<u16>> = client.rules(ACL).iter().map(|r| r.start_port).collect();
    assert_eq!(ports, vec![Some(443), Some(8080)]);
}

#[tokio::test]
async fn test_positional_update_keeps_ordinals_unique() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    let created = r.create(&[tcp(&["22"]), tcp(&["80"])]).await;
    assert!(created.is_ok(), "{:?}", created.result);

    // The trailing rule keeps ordinal 2 while the first rule grows to two ports.
    let updated = r.update(created.state, &[tcp(&["22", "23"])]).await;
    assert!(updated.is_ok(), "{:?}", updated.result);

    let remote = client.rules(ACL);
    assert_eq!(remote.len(), 3);
    let numbers: BTreeSet<Option<u32>> = remote.iter().map(|r| r.number).collect();
    assert_eq!(numbers.len(), remote.len());
    let mut numbered: Vec<(Option<u32>, Option<u16>)> =
        remote.iter().map(|r| (r.number, r.start_port)).collect();
    numbered.sort();
    assert_eq!(
        numbered,
        vec![(Some(1), Some(22)), (Some(2), Some(80)), (Some(3), Some(23))]
    );
}

#[tokio::test]
async fn test_update_releases_placeholders_when_extras_disallowed() {
    let client = setup();
    let mut config = test_config();
    config.unmanaged_extras_allowed = true;

    let created = reconciler(&client, &config).create(&[tcp(&["80"])]).await;
    client.insert_rule(ACL, untracked_remote("extra-a", 100));
    let read = reconciler(&client, &config).read(created.state).await;
    assert_eq!(read.state.rules.len(), 2);

    config.unmanaged_extras_allowed = false;
    let updated = reconciler(&client, &config)
        .update(read.state, &[tcp(&["80"])])
        .await;
    assert!(updated.is_ok(), "{:?}", updated.result);
    assert_eq!(client.delete_calls(), vec!["extra-a".to_string()]);
    assert_eq!(updated.state.rules.len(), 1);
}

#[tokio::test]
async fn test_parallelism_is_bounded() {
    let client = Arc::new(MemoryAclClient::new(&[ACL]).with_latency(Duration::from_millis(20)));
    let mut config = test_config();
    config.parallelism = 3;

    let ports: Vec<String> = (1000..1012).map(|p| p.to_string()).collect();
    let ports: Vec<&str> = ports.iter().map(String::as_str).collect();
    let outcome = reconciler(&client, &config).create(&[tcp(&ports)]).await;

    assert!(outcome.is_ok(), "{:?}", outcome.result);
    assert_eq!(client.rules(ACL).len(), 12);
    assert!(client.max_in_flight() <= 3);
    assert!(client.max_in_flight() >= 2);
}

#[tokio::test]
async fn test_dispatch_is_rate_limited() {
    let client = setup();
    let mut config = test_config();
    config.parallelism = 4;
    config.rate_limit = RateLimitConfig {
        interval_ms: 50,
        burst: 1,
    };

    let start = Instant::now();
    let outcome = reconciler(&client, &config)
        .create(&[tcp(&["1", "2", "3", "4"])])
        .await;

    assert!(outcome.is_ok());
    assert!(start.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn test_invalid_declaration_makes_no_remote_calls() {
    let client = setup();
    let config = test_config();
    let r = reconciler(&client, &config);

    let mut bad = tcp(&["80"]);
    bad.action = "permit".to_string();
    let outcome = r.create(&[tcp(&["22"]), bad]).await;

    assert!(matches!(
        outcome.result,
        Err(AclError::Validation(ValidationError::InvalidAction { rule: 1, .. }))
    ));
    assert!(outcome.state.is_absent());
    assert!(client.create_calls().is_empty());

    let outcome = r.create(&[tcp(&["80-70"])]).await;
    assert!(matches!(
        outcome.result,
        Err(AclError::Validation(ValidationError::InvalidPortSpec { .. }))
    ));

    let outcome = r.create(&[]).await;
    assert_eq!(outcome.result, Err(AclError::Validation(ValidationError::NoRules)));
    assert!(client.create_calls().is_empty());
}

#[tokio::test]
async fn test_invalid_settings_are_rejected() {
    let client = setup();
    let mut config = test_config();
    config.parallelism = 0;
    assert!(matches!(
        AclReconciler::new(client.clone(), &config),
        Err(ValidationError::InvalidParallelism)
    ));
}

#[tokio::test]
async fn test_delete_of_absent_state_is_noop() {
    let client = setup();
    let outcome = reconciler(&client, &test_config())
        .delete(TrackedState::absent(ACL))
        .await;
    assert!(outcome.is_ok());
    assert!(outcome.state.is_absent());
    assert!(client.delete_calls().is_empty());
}
