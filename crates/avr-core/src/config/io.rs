//! Reading and writing `avr.yaml`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::AvrConfig;

/// Read, parse and validate a config file; `None` if it does not exist
pub fn read_config(path: &Path) -> Result<Option<AvrConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: AvrConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(Some(config))
}

/// Config at `path`, or the defaults when it is missing or unusable
pub fn load_config(path: &Path) -> AvrConfig {
    match read_config(path) {
        Ok(Some(config)) => {
            log::info!("load_config: loaded {}", path.display());
            config
        }
        Ok(None) => {
            log::info!("load_config: {} not found, using defaults", path.display());
            AvrConfig::default()
        }
        Err(err) => {
            log::warn!("load_config: {:#}, using defaults", err);
            AvrConfig::default()
        }
    }
}

/// Write a validated config, creating the directory if needed
pub fn save_config(config: &AvrConfig, path: &Path) -> Result<()> {
    config.validate().context("refusing to save an invalid config")?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(path, yaml).with_context(|| format!("writing {}", path.display()))?;
    log::info!("save_config: wrote {}", path.display());
    Ok(())
}

/// `<config dir>/avr/avr.yaml`, falling back to the working directory
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("avr")
        .join("avr.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AvrConfig, HdmiLayout};

    #[test]
    fn test_load_nonexistent_returns_default() {
        let config: AvrConfig = load_config(Path::new("/nonexistent/path/avr.yaml"));
        assert_eq!(config, AvrConfig::default());
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("avr.yaml");

        let mut config = AvrConfig::default();
        config.audio.hdmi_layout = HdmiLayout::Layout1;
        config.latency.target_ms = 80;

        save_config(&config, &path).unwrap();
        let loaded: AvrConfig = load_config(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_and_broken_files() {
        let dir = tempfile::tempdir().unwrap();

        let partial = dir.path().join("partial.yaml");
        std::fs::write(&partial, "latency:\n  target_ms: 90\n").unwrap();
        let loaded: AvrConfig = load_config(&partial);
        assert_eq!(loaded.latency.target_ms, 90);
        assert_eq!(loaded.driver, AvrConfig::default().driver);

        let broken = dir.path().join("broken.yaml");
        std::fs::write(&broken, "latency: [not, a, map").unwrap();
        let loaded: AvrConfig = load_config(&broken);
        assert_eq!(loaded, AvrConfig::default());
    }

    #[test]
    fn test_out_of_range_values_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("avr.yaml");
        std::fs::write(&path, "audio:\n  input: 4\nlatency:\n  target_ms: 90\n").unwrap();

        let err = read_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("input"));
        assert_eq!(load_config(&path), AvrConfig::default());
    }

    #[test]
    fn test_invalid_config_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("avr.yaml");
        let mut config = AvrConfig::default();
        config.latency.target_ms = 500;

        assert!(save_config(&config, &path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_default_path_file_name() {
        assert!(default_config_path().ends_with("avr/avr.yaml"));
    }
}
