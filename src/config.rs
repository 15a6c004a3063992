use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable consulted when the config file carries no API key
pub const API_KEY_ENV: &str = "PINPHOTOS_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Flickr API key
    #[serde(default)]
    pub api_key: String,
    /// REST endpoint of the photo search API
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// YAML index holding pins and photo records
    #[serde(default = "default_data_file")]
    pub data_file: String,
    /// Directory for cached image bytes
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    /// Search radius around a pin, in kilometres
    #[serde(default = "default_radius")]
    pub radius: u32,
    /// Number of photos requested per search
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    /// Result pages are drawn uniformly from `0..page_range`
    #[serde(default = "default_page_range")]
    pub page_range: u32,
    /// Two coordinates closer than this (in degrees, on both axes) are the same pin
    #[serde(default = "default_pin_tolerance")]
    pub pin_tolerance: f64,
}

fn default_base_url() -> String {
    "https://api.flickr.com/services/rest/".to_string()
}

fn default_data_file() -> String {
    "data/pins.yaml".to_string()
}

fn default_cache_dir() -> String {
    "data/images".to_string()
}

fn default_radius() -> u32 {
    1
}

fn default_per_page() -> u32 {
    50
}

fn default_page_range() -> u32 {
    10
}

fn default_pin_tolerance() -> f64 {
    0.0001
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            data_file: default_data_file(),
            cache_dir: default_cache_dir(),
            radius: default_radius(),
            per_page: default_per_page(),
            page_range: default_page_range(),
            pin_tolerance: default_pin_tolerance(),
        }
    }
}

impl Config {
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let mut config: Config = serde_yaml::from_str(&yaml)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        if config.api_key.is_empty() {
            if let Ok(key) = env::var(API_KEY_ENV) {
                config.api_key = key;
            }
        }

        if config.page_range == 0 {
            anyhow::bail!("page_range in {} must be at least 1", path.display());
        }

        Ok(config)
    }

    pub fn get_config_path(config_arg: &Option<PathBuf>) -> PathBuf {
        config_arg
            .clone()
            .unwrap_or_else(|| PathBuf::from("pinphotos.yaml"))
    }
}
