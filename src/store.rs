//! Key/value persistence backed by a JSON file

use crate::detection::ClickSignature;
use crate::dose::DoseRecord;
use crate::state::Settings;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SIGNATURE_KEY: &str = "clickSignature";
pub const SETTINGS_KEY: &str = "settings";
pub const HISTORY_KEY: &str = "doseHistory";

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Store serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Opaque key/value store.
///
/// Values live in memory and are written back to `path` on [`JsonStore::save`].
/// A store without a path never touches the filesystem.
#[derive(Debug, Default)]
pub struct JsonStore {
    path: Option<PathBuf>,
    values: Map<String, Value>,
}

impl JsonStore {
    /// Open the store at `path`. Missing or unreadable files start empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    log::warn!("Store {} is not a JSON object, starting empty", path.display());
                    Map::new()
                }
                Err(e) => {
                    log::warn!("Store {} is corrupt ({}), starting empty", path.display(), e);
                    Map::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("Store {} does not exist yet", path.display());
                Map::new()
            }
            Err(e) => {
                log::warn!("Failed to read store {}: {}", path.display(), e);
                Map::new()
            }
        };

        Self {
            path: Some(path),
            values,
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.values.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Remove `key`, returning whether it was present
    pub fn delete(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&self.values)?;
        fs::write(path, text)?;
        log::debug!("Store saved to {}", path.display());
        Ok(())
    }
}

/// Stored click signature
pub trait SignatureStore {
    fn load_signature(&self) -> Result<Option<ClickSignature>, StoreError>;
    fn save_signature(&mut self, signature: &ClickSignature) -> Result<(), StoreError>;
    fn clear_signature(&mut self) -> Result<(), StoreError>;
}

/// Stored user settings
pub trait SettingsStore {
    fn load_settings(&self) -> Result<Option<Settings>, StoreError>;
    fn save_settings(&mut self, settings: &Settings) -> Result<(), StoreError>;
}

/// Append-only list of saved doses
pub trait DoseHistory {
    fn append_dose(&mut self, record: &DoseRecord) -> Result<(), StoreError>;
    fn dose_entries(&self) -> Result<Vec<DoseRecord>, StoreError>;
}

/// Everything the session controller persists
pub trait Store: SignatureStore + SettingsStore + DoseHistory + Send {}

impl<T: SignatureStore + SettingsStore + DoseHistory + Send> Store for T {}

impl SignatureStore for JsonStore {
    fn load_signature(&self) -> Result<Option<ClickSignature>, StoreError> {
        self.get(SIGNATURE_KEY)
    }

    fn save_signature(&mut self, signature: &ClickSignature) -> Result<(), StoreError> {
        self.set(SIGNATURE_KEY, signature)?;
        self.save()
    }

    fn clear_signature(&mut self) -> Result<(), StoreError> {
        if self.delete(SIGNATURE_KEY) {
            self.save()?;
        }
        Ok(())
    }
}

impl SettingsStore for JsonStore {
    fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        Ok(self.get::<Settings>(SETTINGS_KEY)?.map(Settings::sanitized))
    }

    fn save_settings(&mut self, settings: &Settings) -> Result<(), StoreError> {
        self.set(SETTINGS_KEY, settings)?;
        self.save()
    }
}

impl DoseHistory for JsonStore {
    fn append_dose(&mut self, record: &DoseRecord) -> Result<(), StoreError> {
        let mut entries = self.dose_entries()?;
        entries.push(record.clone());
        self.set(HISTORY_KEY, &entries)?;
        self.save()
    }

    fn dose_entries(&self) -> Result<Vec<DoseRecord>, StoreError> {
        Ok(self.get(HISTORY_KEY)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::PROFILE_BANDS;
    use crate::state::DetectionMode;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("pen-clicks-test-{}", std::process::id()))
            .join(name)
    }

    fn signature() -> ClickSignature {
        ClickSignature {
            profile: [0.3; PROFILE_BANDS],
            avg_energy: 0.3,
            sample_count: 4,
            created_at: 1_000,
        }
    }

    #[test]
    fn get_set_delete() {
        let mut store = JsonStore::in_memory();

        assert_eq!(store.get::<u32>("answer").unwrap(), None);
        store.set("answer", &42u32).unwrap();
        assert_eq!(store.get::<u32>("answer").unwrap(), Some(42));

        assert!(store.delete("answer"));
        assert!(!store.delete("answer"));
        assert_eq!(store.get::<u32>("answer").unwrap(), None);
    }

    #[test]
    fn mistyped_value_is_a_json_error() {
        let mut store = JsonStore::in_memory();
        store.set(SIGNATURE_KEY, &"not a signature").unwrap();

        assert!(matches!(store.load_signature(), Err(StoreError::Json(_))));
    }

    #[test]
    fn signature_round_trips_and_clears() {
        let mut store = JsonStore::in_memory();
        assert!(store.load_signature().unwrap().is_none());

        store.save_signature(&signature()).unwrap();
        assert_eq!(store.load_signature().unwrap(), Some(signature()));

        store.clear_signature().unwrap();
        assert!(store.load_signature().unwrap().is_none());
    }

    #[test]
    fn loaded_settings_are_sanitized() {
        let mut store = JsonStore::in_memory();
        store
            .set(SETTINGS_KEY, &serde_json::json!({ "mode": "advanced", "sensitivity": 9.0 }))
            .unwrap();

        let settings = store.load_settings().unwrap().unwrap();

        assert_eq!(settings.mode, DetectionMode::Advanced);
        assert_eq!(settings.sensitivity, 0.4);
    }

    #[test]
    fn dose_history_appends_in_order() {
        let mut store = JsonStore::in_memory();
        let pen = crate::dose::PenProfile::new("Test pen", 0.5);

        store
            .append_dose(&DoseRecord::new(2, &pen, DetectionMode::Simple, 10))
            .unwrap();
        store
            .append_dose(&DoseRecord::new(4, &pen, DetectionMode::Advanced, 20))
            .unwrap();

        let entries = store.dose_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].recorded_at, 10);
        assert_eq!(entries[1].mg, 2.0);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let path = temp_path("persist.json");
        let _ = fs::remove_file(&path);

        let mut store = JsonStore::open(&path);
        store.save_signature(&signature()).unwrap();

        let reopened = JsonStore::open(&path);
        assert_eq!(reopened.load_signature().unwrap(), Some(signature()));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn corrupt_file_opens_empty() {
        let path = temp_path("corrupt.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();

        let store = JsonStore::open(&path);

        assert!(store.load_signature().unwrap().is_none());
        assert!(store.dose_entries().unwrap().is_empty());

        let _ = fs::remove_file(&path);
    }
}
