//! mvirt-acl: reconciler for network ACL rules.
//!
//! Converges a declared list of firewall rules onto a remote ACL container,
//! expanding each rule into its remote sub-rules, applying them with bounded
//! parallelism and tracking the resulting ids across runs.

pub mod clients;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod reconciler;
pub mod retry;
pub mod rule;
pub mod state;
pub mod test_util;
pub mod validation;

pub use clients::{AclApi, HttpAclClient};
pub use config::AclConfig;
pub use error::{AclError, BatchError, RemoteError};
pub use reconciler::{AclReconciler, Outcome, Phase, TrackedState};
pub use rule::LogicalRule;
