//! Persistence of published group states across restarts.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

use super::state::EntityState;

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("Failed to access '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode '{}': {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON file of group states keyed by group entity id.
#[derive(Debug, Clone)]
pub struct RestoreStore {
    path: PathBuf,
}

impl RestoreStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load stored states. A missing file is an empty store.
    pub fn load(&self) -> Result<BTreeMap<String, EntityState>, RestoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No restore file at {}", self.path.display());
                return Ok(BTreeMap::new());
            }
            Err(source) => {
                return Err(RestoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_str(&content).map_err(|source| RestoreError::Json {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the stored states. Written to a sibling file first and renamed
    /// into place.
    pub fn save(&self, states: &BTreeMap<String, EntityState>) -> Result<(), RestoreError> {
        let io_err = |source| RestoreError::Io {
            path: self.path.clone(),
            source,
        };

        let content = serde_json::to_string_pretty(states).map_err(|source| RestoreError::Json {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!("Saved {} state(s) to {}", states.len(), self.path.display());
        Ok(())
    }
}
