//! In-memory control plane for tests.
//!
//! `MemoryAclClient` behaves like the real control plane for a set of ACL
//! containers: creates return fresh ids, deletes of unknown ids fail with the
//! "entity does not exist" message, and listing echoes back what was created.
//! Failures and latency can be injected per call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::clients::{AclApi, AclInfo};
use crate::error::{already_gone_message, RemoteError};
use crate::rule::{CreateRuleRequest, RemoteRule};

/// How often an injected failure fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail the next `n` calls, then succeed
    Times(usize),
    /// Fail every call
    Always,
}

impl Fault {
    /// Returns true if this call should fail, consuming one failure.
    fn fire(&mut self) -> bool {
        match self {
            Fault::Always => true,
            Fault::Times(0) => false,
            Fault::Times(n) => {
                *n -= 1;
                true
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    acls: HashSet<String>,
    /// Rule id -> (ACL id, rule)
    rules: BTreeMap<String, (String, RemoteRule)>,
    create_faults: HashMap<u32, Fault>,
    delete_faults: HashMap<String, Fault>,
    list_fault: Option<RemoteError>,
    creates: Vec<CreateRuleRequest>,
    deletes: Vec<String>,
}

/// In-memory implementation of [`AclApi`].
#[derive(Debug, Default)]
pub struct MemoryAclClient {
    inner: Mutex<Inner>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryAclClient {
    /// A control plane holding the given (empty) ACL containers.
    pub fn new(acl_ids: &[&str]) -> Self {
        let client = Self::default();
        client.with_inner(|inner| {
            inner.acls = acl_ids.iter().map(|id| id.to_string()).collect();
        });
        client
    }

    /// Delay every create and delete by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }

    /// Make creates with the given ordinal fail.
    pub fn fail_create(&self, ordinal: u32, fault: Fault) {
        self.with_inner(|inner| {
            inner.create_faults.insert(ordinal, fault);
        });
    }

    /// Make deletes of the given id fail.
    pub fn fail_delete(&self, id: &str, fault: Fault) {
        self.with_inner(|inner| {
            inner.delete_faults.insert(id.to_string(), fault);
        });
    }

    /// Make every list call fail with `error`.
    pub fn fail_list(&self, error: RemoteError) {
        self.with_inner(|inner| inner.list_fault = Some(error));
    }

    /// Add a rule directly, bypassing the API.
    pub fn insert_rule(&self, acl_id: &str, rule: RemoteRule) {
        self.with_inner(|inner| {
            inner.rules.insert(rule.id.clone(), (acl_id.to_string(), rule));
        });
    }

    /// Remove a rule behind the reconciler's back.
    pub fn remove_rule(&self, id: &str) -> Option<RemoteRule> {
        self.with_inner(|inner| inner.rules.remove(id).map(|(_, rule)| rule))
    }

    /// Change a rule behind the reconciler's back.
    pub fn update_rule(&self, id: &str, f: impl FnOnce(&mut RemoteRule)) {
        self.with_inner(|inner| {
            if let Some((_, rule)) = inner.rules.get_mut(id) {
                f(rule);
            }
        });
    }

    /// Remove an ACL container and all of its rules.
    pub fn remove_acl(&self, acl_id: &str) {
        self.with_inner(|inner| {
            inner.acls.remove(acl_id);
            inner.rules.retain(|_, (acl, _)| acl != acl_id);
        });
    }

    /// Rules currently active in an ACL, ordered by ordinal.
    pub fn rules(&self, acl_id: &str) -> Vec<RemoteRule> {
        let mut rules: Vec<RemoteRule> = self.with_inner(|inner| {
            inner
                .rules
                .values()
                .filter(|(acl, _)| acl == acl_id)
                .map(|(_, rule)| rule.clone())
                .collect()
        });
        rules.sort_by_key(|r| r.number);
        rules
    }

    /// Every create request received, including failed ones, in arrival order.
    pub fn create_calls(&self) -> Vec<CreateRuleRequest> {
        self.with_inner(|inner| inner.creates.clone())
    }

    /// Every delete request received, including failed ones, in arrival order.
    pub fn delete_calls(&self) -> Vec<String> {
        self.with_inner(|inner| inner.deletes.clone())
    }

    /// Highest number of concurrent create/delete calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AclApi for MemoryAclClient {
    async fn create_rule(&self, request: &CreateRuleRequest) -> Result<String, RemoteError> {
        self.enter().await;
        let result = self.with_inner(|inner| {
            inner.creates.push(request.clone());

            if !inner.acls.contains(&request.acl_id) {
                return Err(RemoteError::Api {
                    status: 431,
                    message: format!("ACL {} does not exist", request.acl_id),
                });
            }
            if let Some(fault) = inner.create_faults.get_mut(&request.number) {
                if fault.fire() {
                    return Err(RemoteError::Api {
                        status: 530,
                        message: format!("failed to create rule #{}", request.number),
                    });
                }
            }

            let id = Uuid::new_v4().to_string();
            inner
                .rules
                .insert(id.clone(), (request.acl_id.clone(), request.to_remote(&id)));
            Ok(id)
        });
        self.leave();
        result
    }

    async fn delete_rule(&self, id: &str) -> Result<(), RemoteError> {
        self.enter().await;
        let result = self.with_inner(|inner| {
            inner.deletes.push(id.to_string());

            if let Some(fault) = inner.delete_faults.get_mut(id) {
                if fault.fire() {
                    return Err(RemoteError::Api {
                        status: 530,
                        message: format!("failed to delete rule {}", id),
                    });
                }
            }
            match inner.rules.remove(id) {
                Some(_) => Ok(()),
                None => Err(RemoteError::Api {
                    status: 431,
                    message: already_gone_message(id),
                }),
            }
        });
        self.leave();
        result
    }

    async fn list_rules(
        &self,
        acl_id: &str,
        _project: Option<&str>,
    ) -> Result<Vec<RemoteRule>, RemoteError> {
        if let Some(err) = self.with_inner(|inner| inner.list_fault.clone()) {
            return Err(err);
        }
        Ok(self.rules(acl_id))
    }

    async fn get_acl(&self, acl_id: &str, project: Option<&str>) -> Result<AclInfo, RemoteError> {
        let exists = self.with_inner(|inner| inner.acls.contains(acl_id));
        if !exists {
            return Err(RemoteError::NotFound(format!("ACL {}", acl_id)));
        }
        Ok(AclInfo {
            id: acl_id.to_string(),
            name: acl_id.to_string(),
            project: project.map(str::to_string),
        })
    }
}
