//! Declared ACL configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_parallelism() -> usize {
    2
}

fn default_action() -> String {
    "allow".to_string()
}

fn default_traffic_type() -> String {
    "ingress".to_string()
}

/// How the old and new rule declarations are compared on update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffMode {
    /// Compare index by index up to the shorter length.
    #[default]
    Positional,
    /// Compare as multisets of declarations.
    Set,
}

/// Attempt budget for a single remote create or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 4 }
    }
}

/// Pacing of operation dispatch towards the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Token refill interval in milliseconds (0 = unlimited)
    pub interval_ms: u64,
    /// Bucket capacity
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            burst: 1,
        }
    }
}

impl RateLimitConfig {
    pub fn unlimited() -> Self {
        Self {
            interval_ms: 0,
            burst: 1,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// One rule as written by the operator, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDecl {
    #[serde(default = "default_action")]
    pub action: String,
    pub protocol: String,
    pub cidr_list: Vec<String>,
    #[serde(default)]
    pub icmp_type: Option<i32>,
    #[serde(default)]
    pub icmp_code: Option<i32>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default = "default_traffic_type")]
    pub traffic_type: String,
}

impl RuleDecl {
    /// A tcp/udp declaration with default action and traffic type.
    pub fn ports(protocol: &str, cidr: &str, ports: &[&str]) -> Self {
        Self {
            action: default_action(),
            protocol: protocol.to_string(),
            cidr_list: vec![cidr.to_string()],
            icmp_type: None,
            icmp_code: None,
            ports: ports.iter().map(|p| p.to_string()).collect(),
            traffic_type: default_traffic_type(),
        }
    }

    /// An icmp declaration with default action and traffic type.
    pub fn icmp(cidr: &str, icmp_type: i32, icmp_code: i32) -> Self {
        Self {
            action: default_action(),
            protocol: "icmp".to_string(),
            cidr_list: vec![cidr.to_string()],
            icmp_type: Some(icmp_type),
            icmp_code: Some(icmp_code),
            ports: Vec::new(),
            traffic_type: default_traffic_type(),
        }
    }
}

/// Full declaration for one ACL container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclConfig {
    pub acl_id: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default, alias = "managed")]
    pub unmanaged_extras_allowed: bool,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub diff_mode: DiffMode,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub rules: Vec<RuleDecl>,
}

impl AclConfig {
    pub fn new(acl_id: impl Into<String>) -> Self {
        Self {
            acl_id: acl_id.into(),
            project: None,
            unmanaged_extras_allowed: false,
            parallelism: default_parallelism(),
            diff_mode: DiffMode::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            rules: Vec::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid ACL configuration")
    }

    /// Load a configuration file.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&raw)
    }
}
