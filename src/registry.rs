//! Explicit registry of loaded configurations.
//!
//! Loaded configurations live in a registry object owned by the caller —
//! not in global mutable state — so tearing an application (or a test)
//! down removes everything it loaded. Entries are keyed by environment id;
//! loading the same id twice is an error, mirroring "env already exists"
//! at the application layer.

use crate::config::Settings;
use crate::error::ConfigError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Caller-owned map from environment id to its loaded settings.
#[derive(Default)]
pub struct ConfigRegistry {
    entries: Mutex<HashMap<String, Arc<Settings>>>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a settings file and register it under `id`.
    pub fn load(&self, id: &str, path: &Path) -> Result<Arc<Settings>, ConfigError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(id) {
            return Err(ConfigError::Invalid(format!(
                "configuration '{id}' is already registered"
            )));
        }
        let settings = Arc::new(Settings::from_file(path)?);
        entries.insert(id.to_string(), Arc::clone(&settings));
        Ok(settings)
    }

    /// Look up a previously loaded configuration.
    pub fn get(&self, id: &str) -> Option<Arc<Settings>> {
        self.entries.lock().get(id).cloned()
    }

    /// Drop a configuration; returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Ids of everything currently registered.
    pub fn ids(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("env.toml");
        let mut file = std::fs::File::create(&path).expect("create config");
        write!(
            file,
            r#"
            [application]
            name = "acqctl test"

            [capture]
            capacity = 4

            [environment]
            kind = "mock"
            "#
        )
        .expect("write config");
        path
    }

    #[test]
    fn load_get_remove_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(&dir);
        let registry = ConfigRegistry::new();

        let settings = registry.load("env_0", &path).expect("load");
        assert_eq!(settings.capture.capacity, 4);
        assert!(registry.get("env_0").is_some());
        assert_eq!(registry.ids(), vec!["env_0".to_string()]);

        assert!(registry.remove("env_0"));
        assert!(registry.get("env_0").is_none());
        assert!(!registry.remove("env_0"));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(&dir);
        let registry = ConfigRegistry::new();

        registry.load("env_0", &path).expect("first load");
        let error = registry.load("env_0", &path).expect_err("duplicate id");
        assert!(error.to_string().contains("already registered"));
    }
}
