//! State management for built image resources.
//!
//! Persists named resource records to `~/.lxbake/state.json` with atomic
//! writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lxbake_runtime::BuiltImageState;

/// Persistent state file backed by JSON.
///
/// An ephemeral state file keeps records in memory only.
pub struct StateFile {
    path: Option<PathBuf>,
    records: BTreeMap<String, BuiltImageState>,
}

impl StateFile {
    /// Load state from disk. Creates an empty state if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let records = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data).map_err(std::io::Error::other)?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            records,
        })
    }

    /// Load from the default path (~/.lxbake/state.json).
    pub fn load_default() -> Result<Self, std::io::Error> {
        Self::load(&default_path())
    }

    /// State that is never written to disk.
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            records: BTreeMap::new(),
        }
    }

    /// Save state to disk atomically (write to .tmp, then rename).
    pub fn save(&self) -> Result<(), std::io::Error> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let data = serde_json::to_string_pretty(&self.records).map_err(std::io::Error::other)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &data)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&BuiltImageState> {
        self.records.get(name)
    }

    /// Look up a record, failing with a readable message.
    pub fn require(&self, name: &str) -> Result<BuiltImageState, String> {
        self.records
            .get(name)
            .cloned()
            .ok_or_else(|| format!("No such built image: {name}"))
    }

    /// Insert or replace a record and persist.
    pub fn upsert(&mut self, name: &str, record: BuiltImageState) -> Result<(), std::io::Error> {
        self.records.insert(name.to_string(), record);
        self.save()
    }

    /// Remove a record by name and persist.
    pub fn remove(&mut self, name: &str) -> Result<bool, std::io::Error> {
        if self.records.remove(name).is_some() {
            self.save()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// All records, ordered by name.
    pub fn records(&self) -> impl Iterator<Item = (&String, &BuiltImageState)> {
        self.records.iter()
    }
}

/// Default state file location.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".lxbake"))
        .unwrap_or_else(|| PathBuf::from(".lxbake"))
        .join("state.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_state_path(tmp: &TempDir) -> PathBuf {
        tmp.path().join("nested").join("state.json")
    }

    fn sample_record(fingerprint: &str) -> BuiltImageState {
        BuiltImageState {
            id: Some(format!("local/{fingerprint}")),
            fingerprint: Some(fingerprint.to_string()),
            aliases: vec!["alpine".to_string()],
            created_at: Some(1_546_398_245),
            ..BuiltImageState::new("image: {}")
        }
    }

    #[test]
    fn test_load_missing_creates_parent() {
        let tmp = TempDir::new().unwrap();
        let path = test_state_path(&tmp);
        let state = StateFile::load(&path).unwrap();
        assert_eq!(state.records().count(), 0);
        assert!(path.parent().unwrap().exists());
    }

    #[test]
    fn test_upsert_persists() {
        let tmp = TempDir::new().unwrap();
        let path = test_state_path(&tmp);

        let mut state = StateFile::load(&path).unwrap();
        state.upsert("web", sample_record("abc")).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = StateFile::load(&path).unwrap();
        assert_eq!(reloaded.get("web"), Some(&sample_record("abc")));
    }

    #[test]
    fn test_remove() {
        let tmp = TempDir::new().unwrap();
        let path = test_state_path(&tmp);

        let mut state = StateFile::load(&path).unwrap();
        state.upsert("web", sample_record("abc")).unwrap();
        assert!(state.remove("web").unwrap());
        assert!(!state.remove("web").unwrap());
        assert!(StateFile::load(&path).unwrap().get("web").is_none());
    }

    #[test]
    fn test_require_unknown() {
        let state = StateFile::ephemeral();
        assert!(state.require("ghost").unwrap_err().contains("ghost"));
    }

    #[test]
    fn test_ephemeral_never_writes() {
        let mut state = StateFile::ephemeral();
        state.upsert("web", sample_record("abc")).unwrap();
        assert!(state.get("web").is_some());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(StateFile::load(&path).is_err());
    }
}
