//! # State File
//!
//! The CLI keeps everything between invocations in one JSON document: the
//! oracle prices it serves and the engine snapshot. Writes go to a sibling
//! temp file first and are renamed into place, so a crash mid-write leaves
//! the previous state intact.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use sharevault_engine::snapshot::EngineSnapshot;
use sharevault_engine::{SharePrice, VaultId};

/// Everything persisted between invocations.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateFile {
    /// NAV per share for each vault, as served by the CLI's oracle.
    #[serde(default)]
    pub prices: BTreeMap<VaultId, SharePrice>,
    /// Engine state.
    #[serde(default)]
    pub engine: EngineSnapshot,
}

/// Loads the state file. A missing file is an empty state.
pub fn load(path: &Path) -> Result<StateFile> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no state file, starting empty");
        return Ok(StateFile::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse state file {}", path.display()))
}

/// Writes the state file atomically.
pub fn save(path: &Path, state: &StateFile) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    let body = serde_json::to_string_pretty(state).context("failed to encode state")?;
    let tmp = temp_path(path);
    fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", tmp.display()))?;

    tracing::debug!(path = %path.display(), "state saved");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharevault_engine::Address;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = load(&dir.path().join("absent.json")).unwrap();
        assert!(state.prices.is_empty());
        assert!(state.engine.vaults.is_empty());
    }

    #[test]
    fn save_then_load_keeps_prices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let vault = Address::derive_vault("store");

        let mut state = StateFile::default();
        state.prices.insert(vault, "1.25".parse().unwrap());
        save(&path, &state).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.prices.get(&vault), Some(&"1.25".parse().unwrap()));
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse state file"));
    }
}
