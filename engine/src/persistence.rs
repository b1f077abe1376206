//! Rule persistence
//!
//! Threshold rules survive restarts as a JSON document in the state
//! directory. Writes go to a sibling temp file that is then renamed over the
//! target, so a crash mid-write leaves the previous rule set intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PersistenceError, PersistenceResult};
use crate::rules::ThresholdRule;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RuleDocument {
    version: u32,
    rules: Vec<ThresholdRule>,
}

pub struct RuleStore {
    path: PathBuf,
}

impl RuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted rules; a missing file means no rules yet
    pub fn load(&self) -> PersistenceResult<Vec<ThresholdRule>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No rule store at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(PersistenceError::ReadFailed {
                    path: self.display(),
                    reason: e.to_string(),
                })
            }
        };

        let document: RuleDocument = serde_json::from_str(&content).map_err(|e| PersistenceError::Corrupt {
            path: self.display(),
            reason: e.to_string(),
        })?;

        if document.version != FORMAT_VERSION {
            return Err(PersistenceError::Corrupt {
                path: self.display(),
                reason: format!("unsupported format version {}", document.version),
            });
        }

        tracing::info!(rules = document.rules.len(), "Loaded persisted rules from {}", self.path.display());
        Ok(document.rules)
    }

    /// Replace the persisted rule set
    pub fn save(&self, rules: &[ThresholdRule]) -> PersistenceResult<()> {
        let document = RuleDocument {
            version: FORMAT_VERSION,
            rules: rules.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&document).map_err(|e| self.write_failed(e))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.write_failed(e))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let written = write_file(&tmp_path, &json).and_then(|()| fs::rename(&tmp_path, &self.path));
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove {}: {}", tmp_path.display(), cleanup);
                }
            }
            return Err(self.write_failed(e));
        }

        tracing::debug!(rules = rules.len(), "Persisted rules to {}", self.path.display());
        Ok(())
    }

    fn display(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    fn write_failed(&self, error: impl std::fmt::Display) -> PersistenceError {
        PersistenceError::WriteFailed {
            path: self.display(),
            reason: error.to_string(),
        }
    }
}

fn write_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
