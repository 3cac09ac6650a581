use anyhow::{Context, Result};
use biogate_devices::RegistryConfig;
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::anomaly::AnomalyConfig;
use crate::events::EventConfig;
use crate::fusion::FusionPolicy;
use crate::matcher::MatchConfig;
use crate::quality::QualityConfig;
use crate::store::StoreLimits;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("BIOGATE_CONFIG_PATH").unwrap_or("/usr/local/etc/biogate/config.toml"))
});

pub static DATA_DIR: Lazy<PathBuf> = Lazy::new(|| {
    ProjectDirs::from("", "", "biogate")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/var/lib/biogate"))
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentConfig {
    pub max_templates_per_modality: usize,
    pub activation_min_templates: usize,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        let limits = StoreLimits::default();
        Self {
            max_templates_per_modality: limits.max_templates_per_modality,
            activation_min_templates: limits.activation_min_templates,
        }
    }
}

impl EnrollmentConfig {
    pub fn limits(&self) -> StoreLimits {
        StoreLimits {
            max_templates_per_modality: self.max_templates_per_modality,
            activation_min_templates: self.activation_min_templates,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Template directory; defaults to the platform data dir.
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn template_dir(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| DATA_DIR.join("templates"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub devices: RegistryConfig,
    pub quality: QualityConfig,
    pub matching: MatchConfig,
    pub fusion: FusionPolicy,
    pub anomaly: AnomalyConfig,
    pub events: EventConfig,
    pub enrollment: EnrollmentConfig,
    pub storage: StorageConfig,
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
