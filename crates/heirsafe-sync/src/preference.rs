use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PREFERENCE_VERSION: u32 = 1;

fn default_version() -> u32 {
    PREFERENCE_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreferenceFile {
    #[serde(default = "default_version")]
    version: u32,
    last_account: Option<Address>,
}

/// The "last used account" preference.
///
/// A convenience default only: a missing or unreadable file yields no
/// account, and the stored value is never trusted beyond pre-filling input.
#[derive(Debug, Clone)]
pub struct PreferenceStore {
    path: PathBuf,
}

impl PreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last selected account, if one was stored and the file parses.
    pub fn load_last_account(&self) -> Option<Address> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read preference file");
                return None;
            }
        };
        match serde_json::from_str::<PreferenceFile>(&json) {
            Ok(file) => {
                if file.version > PREFERENCE_VERSION {
                    debug!(version = file.version, "preference file has newer version");
                }
                file.last_account.filter(|a| !a.is_zero())
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unparsable preference file");
                None
            }
        }
    }

    /// Overwrites the stored account.
    ///
    /// Writes a temp file and renames it over the target so a crash never
    /// leaves a truncated file.
    pub fn save_last_account(&self, account: Address) -> io::Result<()> {
        let file = PreferenceFile { version: PREFERENCE_VERSION, last_account: Some(account) };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(json.as_bytes())?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)
    }
}
