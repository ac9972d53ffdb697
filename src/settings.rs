use anyhow::{Context, Result};
use directories::ProjectDirs;
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use crate::{
    capture::{local, network::DEFAULT_STREAM_URL, ResolutionTier},
    report::Thresholds,
};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    #[default]
    Local,
    Network,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorSettings {
    pub thresholds: Thresholds,
    pub camera: CameraKind,
    pub stream_url: String,
    pub device: String,
    pub resolution: ResolutionTier,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            camera: CameraKind::default(),
            stream_url: DEFAULT_STREAM_URL.into(),
            device: local::default_device().into(),
            resolution: ResolutionTier::default(),
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<MonitorSettings>,
}

pub fn default_settings_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", "pulsecam") {
        dirs.config_dir().join("settings.json")
    } else {
        PathBuf::from("pulsecam_settings.json")
    }
}

fn load(path: &Path) -> MonitorSettings {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) if !path.exists() => return MonitorSettings::default(),
        Err(err) => {
            warn!("Failed to read settings from {}: {}", path.display(), err);
            return MonitorSettings::default();
        }
    };
    let mut settings: MonitorSettings = serde_json::from_str(&contents).unwrap_or_default();
    if let Err(err) = settings.thresholds.validate() {
        warn!("Ignoring stored thresholds: {}", err);
        settings.thresholds = Thresholds::default();
    }
    settings
}

impl SettingsStore {
    /// Missing or unreadable files yield defaults.
    pub fn new(path: PathBuf) -> Self {
        let data = load(&path);
        Self {
            path,
            data: RwLock::new(data),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> MonitorSettings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn thresholds(&self) -> Thresholds {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .thresholds
    }

    /// Rejects invalid bounds without touching memory or disk.
    pub fn update_thresholds(&self, thresholds: Thresholds) -> Result<()> {
        thresholds.validate()?;
        self.update(|settings| settings.thresholds = thresholds)
    }

    pub fn update(&self, apply: impl FnOnce(&mut MonitorSettings)) -> Result<()> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        apply(&mut next);
        next.thresholds
            .validate()
            .context("Refusing to store invalid thresholds")?;
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }

    fn persist(&self, data: &MonitorSettings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));
        assert_eq!(store.settings(), MonitorSettings::default());
        assert_eq!(store.thresholds().min_hr(), 60);
        assert_eq!(store.thresholds().max_hr(), 220);
    }

    #[test]
    fn thresholds_persist_across_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone());
        store
            .update_thresholds(Thresholds::new(55, 180).unwrap())
            .unwrap();

        let reloaded = SettingsStore::new(path);
        assert_eq!(reloaded.thresholds(), Thresholds::new(55, 180).unwrap());
    }

    #[test]
    fn invalid_thresholds_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone());
        let inverted: Thresholds = serde_json::from_str(r#"{"minHR":120,"maxHR":80}"#).unwrap();

        assert!(store.update_thresholds(inverted).is_err());
        assert_eq!(store.thresholds(), Thresholds::default());
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_or_invalid_files_fall_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(SettingsStore::new(path.clone()).settings(), MonitorSettings::default());

        fs::write(
            &path,
            r#"{"thresholds":{"minHR":0,"maxHR":100},"camera":"network"}"#,
        )
        .unwrap();
        let settings = SettingsStore::new(path).settings();
        assert_eq!(settings.thresholds, Thresholds::default());
        assert_eq!(settings.camera, CameraKind::Network);
        assert_eq!(settings.stream_url, DEFAULT_STREAM_URL);
    }

    #[test]
    fn camera_selection_is_stored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone());
        store
            .update(|settings| {
                settings.camera = CameraKind::Network;
                settings.resolution = ResolutionTier::Low;
            })
            .unwrap();

        let reloaded = SettingsStore::new(path).settings();
        assert_eq!(reloaded.camera, CameraKind::Network);
        assert_eq!(reloaded.resolution, ResolutionTier::Low);
    }
}
