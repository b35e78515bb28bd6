//! Stable tunnel id persisted on disk so the public URL survives restarts.

use anyhow::{Context, Result};
use proxyhub_shared::identity::{is_valid_stable_id, random_stable_id, sanitize_stable_id, validate_stable_id};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory of `tunnel-<port>.id` files.
#[derive(Debug, Clone)]
pub struct IdStore {
    dir: PathBuf,
}

impl IdStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.proxyhub`
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".proxyhub"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the id for a local port. Mock-only tunnels share one file.
    pub fn path_for(&self, port: Option<u16>) -> PathBuf {
        match port {
            Some(port) => self.dir.join(format!("tunnel-{}.id", port)),
            None => self.dir.join("tunnel-mock.id"),
        }
    }

    /// Reuse the stored id for `port`, or create and store a fresh one.
    pub fn load_or_create(&self, port: Option<u16>) -> Result<String> {
        let path = self.path_for(port);
        match std::fs::read_to_string(&path) {
            Ok(stored) => {
                let id = sanitize_stable_id(stored.trim());
                if is_valid_stable_id(&id) {
                    debug!("Reusing stable id from {}", path.display());
                    return Ok(id);
                }
                warn!("Ignoring invalid stable id in {}", path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        }

        let id = random_stable_id();
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        std::fs::write(&path, &id)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Generated stable id {} ({})", id, path.display());
        Ok(id)
    }
}

/// An explicit `--id` wins over the persisted one; it must already be usable.
pub fn resolve_stable_id(explicit: Option<&str>, store: &IdStore, port: Option<u16>) -> Result<String> {
    match explicit {
        Some(raw) => validate_stable_id(raw).context("Invalid tunnel id"),
        None => store.load_or_create(port),
    }
}
