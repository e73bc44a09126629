//! Instance identity: a UUID persisted on first start and reused forever
//! after, so the router can address this installation across restarts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

use crate::protocol::InstanceId;

const IDENTITY_DIR: &str = "instance";
const IDENTITY_FILE: &str = "client_id.txt";

/// `~/.config/instance/client_id.txt`
pub fn default_identity_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".config").join(IDENTITY_DIR).join(IDENTITY_FILE))
}

/// Read the identity stored at `path`, or generate and save a new one if the
/// file is missing or blank.
pub fn load_or_generate(path: &Path) -> Result<InstanceId> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read identity file: {}", path.display()))?;
        let stored = contents.trim();
        if !stored.is_empty() {
            info!(path = %path.display(), identity = stored, "loaded instance identity");
            return Ok(InstanceId::new(stored));
        }
    }

    let identity = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, &identity)
        .with_context(|| format!("failed to write identity file: {}", path.display()))?;
    info!(path = %path.display(), %identity, "generated new instance identity");
    Ok(InstanceId::new(identity))
}
