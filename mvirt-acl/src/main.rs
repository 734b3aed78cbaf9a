//! mvirt-acl: converge declared network ACL rules onto the control plane.
//!
//! Each subcommand runs one reconciler operation for the ACL named in the
//! config file and writes the resulting state back to the state file, also
//! when the operation failed part way.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_acl::reconciler::{AclReconciler, Outcome, TrackedState};
use mvirt_acl::{state, AclConfig, HttpAclClient};

/// mvirt ACL reconciler
#[derive(Parser, Debug)]
#[command(name = "mvirt-acl", version, about)]
struct Args {
    /// Rule control API endpoint
    #[arg(long, default_value = "http://[::1]:8096/v1")]
    api_endpoint: String,

    /// ACL configuration file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Tracked state file
    #[arg(short, long, default_value = "acl-state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create all declared rules
    Create,
    /// Converge tracked rules onto the current declaration
    Update,
    /// Refresh tracked rules from the control plane and print them
    Read,
    /// Delete all tracked rules
    Delete,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_acl=info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = AclConfig::load(&args.config).await?;

    info!("Starting mvirt-acl for ACL {}", config.acl_id);
    info!("API endpoint: {}", args.api_endpoint);

    let api = Arc::new(HttpAclClient::new(&args.api_endpoint));
    let reconciler = AclReconciler::new(api, &config).context("Invalid ACL configuration")?;

    let outcome = match args.command {
        Command::Create => {
            if let Some(existing) = state::load(&args.state).await? {
                if !existing.is_absent() {
                    bail!(
                        "{} already tracks ACL {}; use update instead",
                        args.state.display(),
                        existing.acl_id
                    );
                }
            }
            reconciler.create(&config.rules).await
        }
        Command::Update => {
            let tracked = state::load(&args.state).await?.with_context(|| {
                format!("No state at {}; run create first", args.state.display())
            })?;
            reconciler.update(tracked, &config.rules).await
        }
        Command::Read => {
            let tracked = load_or_absent(&args.state, &config.acl_id).await?;
            let outcome = reconciler.read(tracked).await;
            println!("{}", serde_json::to_string_pretty(&outcome.state)?);
            outcome
        }
        Command::Delete => {
            let tracked = load_or_absent(&args.state, &config.acl_id).await?;
            reconciler.delete(tracked).await
        }
    };

    persist(&args.state, outcome).await
}

async fn load_or_absent(path: &Path, acl_id: &str) -> Result<TrackedState> {
    Ok(state::load(path)
        .await?
        .unwrap_or_else(|| TrackedState::absent(acl_id)))
}

/// Save the outcome's state, then report its result.
async fn persist(path: &Path, outcome: Outcome) -> Result<()> {
    let (tracked, result) = outcome.into_parts();
    state::save(path, &tracked).await?;
    info!(
        "ACL {} is {} with {} sub-rules tracked",
        tracked.acl_id,
        tracked.phase,
        tracked.sub_rule_count()
    );
    result.context("Reconciliation failed")
}
