//! Clients for the rule control API.
//!
//! The reconciler only talks to the control plane through [`AclApi`]:
//! - `HttpAclClient`: REST client used by the `mvirt-acl` binary
//! - `test_util::MemoryAclClient`: in-memory control plane for tests

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::rule::{CreateRuleRequest, RemoteRule};

pub use http::HttpAclClient;

/// ACL container as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project: Option<String>,
}

/// Remote operations on ACL rules.
#[async_trait]
pub trait AclApi: Send + Sync {
    /// Create one sub-rule and return its remote identifier.
    async fn create_rule(&self, request: &CreateRuleRequest) -> Result<String, RemoteError>;

    /// Delete one sub-rule. Deleting an unknown id fails with a message
    /// recognized by [`RemoteError::is_already_gone`].
    async fn delete_rule(&self, id: &str) -> Result<(), RemoteError>;

    /// List all sub-rules active in an ACL container.
    async fn list_rules(&self, acl_id: &str, project: Option<&str>)
        -> Result<Vec<RemoteRule>, RemoteError>;

    /// Look up an ACL container. Fails with [`RemoteError::NotFound`] once it is gone.
    async fn get_acl(&self, acl_id: &str, project: Option<&str>) -> Result<AclInfo, RemoteError>;
}
