//! On-disk persistence of [`TrackedState`].
//!
//! State is stored as pretty-printed JSON. Writes go to a sibling temp file
//! that is renamed over the target, so a crash never leaves a torn file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::reconciler::TrackedState;

/// Load state from `path`. Returns `None` if the file does not exist.
pub async fn load(path: &Path) -> Result<Option<TrackedState>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read state {}", path.display()))
        }
    };
    let state = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid state file {}", path.display()))?;
    Ok(Some(state))
}

/// Write `state` to `path`.
pub async fn save(path: &Path, state: &TrackedState) -> Result<()> {
    let json = serde_json::to_string_pretty(state).context("Failed to encode state")?;
    let tmp = temp_path(path);

    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace state {}", path.display()))?;

    debug!(
        "Saved state of ACL {} ({} rules) to {}",
        state.acl_id,
        state.rules.len(),
        path.display()
    );
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "acl-state.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}
