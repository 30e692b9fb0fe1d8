//! Stable per-installation device identifier

use crate::config::Config;
use crate::telemetry::generate_device_id;
use std::path::Path;
use tracing::{debug, warn};

/// Whether a string looks like an id produced by `generate_device_id`.
pub fn is_valid_device_id(id: &str) -> bool {
    id.len() == 34
        && id.starts_with("d_")
        && id[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Load the device id from `path`, or generate one and save it there.
pub fn load_or_create_device_id(path: &Path) -> std::io::Result<String> {
    if path.exists() {
        let id = std::fs::read_to_string(path)?;
        let id = id.trim().to_string();
        if is_valid_device_id(&id) {
            return Ok(id);
        }
        warn!(path = %path.display(), "Ignoring malformed device id file");
    }

    let id = generate_device_id();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, &id)?;
    debug!(path = %path.display(), "Created device id");
    Ok(id)
}

/// Device id for a new client: the configured one, else the persisted one
/// when enabled, else a fresh id for this process only.
pub fn resolve_device_id(config: &Config) -> String {
    if let Some(id) = config
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        return id.to_string();
    }

    if config.persist_device_id {
        let path = config.resolved_device_id_path();
        match load_or_create_device_id(&path) {
            Ok(id) => return id,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to persist device id, using an ephemeral one");
            }
        }
    }

    generate_device_id()
}
