use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-project directory holding configuration and stored memory.
pub const DATA_DIR: &str = ".aidd";
const CONFIG_FILE: &str = "config.json";
/// Overrides `storage.backend` when set to `auto`, `sqlite` or `json`.
pub const BACKEND_ENV: &str = "AIDD_MEMORY_BACKEND";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub storage: StorageConfig,
    pub evolution: EvolutionConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendPreference,
    /// Relative paths resolve against the project root. Defaults to `<project>/.aidd`.
    pub data_dir: Option<PathBuf>,
}

/// Which storage backend to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// Indexed backend, falling back to flat files if it cannot be opened.
    #[default]
    Auto,
    Sqlite,
    Json,
}

impl BackendPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Sqlite => "sqlite",
            Self::Json => "json",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "sqlite" => Some(Self::Sqlite),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Confidence at or above which a candidate that passes the gate is applied directly.
    pub auto_apply_threshold: f64,
    /// Confidence at or above which a candidate that passes the gate becomes a draft.
    pub draft_threshold: f64,
    /// Most recent sessions replayed by the shadow test.
    pub shadow_sample_limit: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            auto_apply_threshold: 90.0,
            draft_threshold: 70.0,
            shadow_sample_limit: 100,
        }
    }
}

impl MemoryConfig {
    /// Load configuration for the project at `project`.
    /// Returns default config if the file doesn't exist or fails to parse.
    pub fn load(project: &Path) -> Self {
        match Self::try_load(project) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config, using defaults: {:#}", e);
                let mut config = Self::default();
                config.apply_env();
                config
            }
        }
    }

    pub fn try_load(project: &Path) -> Result<Self> {
        let config_path = config_path(project);
        let mut config = if config_path.exists() {
            let content =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            serde_json::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Save the configuration into the project's data directory.
    pub fn save(&self, project: &Path) -> Result<()> {
        let config_path = config_path(project);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Directory the stores live in for the project at `project`.
    pub fn data_dir(&self, project: &Path) -> PathBuf {
        match &self.storage.data_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project.join(dir),
            None => project.join(DATA_DIR),
        }
    }

    fn apply_env(&mut self) {
        let Ok(value) = std::env::var(BACKEND_ENV) else {
            return;
        };
        match BackendPreference::from_str(&value) {
            Some(backend) => self.storage.backend = backend,
            None => tracing::warn!("Ignoring {}={:?}: expected auto, sqlite or json", BACKEND_ENV, value),
        }
    }
}

fn config_path(project: &Path) -> PathBuf {
    project.join(DATA_DIR).join(CONFIG_FILE)
}
