//! Configuration file read/write

use super::schema::PipelineConfig;
use crate::utils::error::{PipelineError, PipelineResult};
use std::fs;
use std::path::Path;

/// Read and validate a pipeline configuration from a JSON file
pub fn load_config(path: &Path) -> PipelineResult<PipelineConfig> {
    if !path.is_file() {
        return Err(PipelineError::InvalidConfiguration(format!(
            "config file not found: {}",
            path.display()
        )));
    }

    let content = fs::read_to_string(path)?;
    let config: PipelineConfig = serde_json::from_str(&content)?;
    config.validate()?;

    tracing::debug!(
        "Loaded config from {:?}: {} capture(s), {} encoder(s)",
        path,
        config.captures.len(),
        config.encoders.len()
    );
    Ok(config)
}

/// Write a configuration as pretty JSON
pub fn save_config(path: &Path, config: &PipelineConfig) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;

    tracing::debug!("Saved config to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::types::Resolution;
    use crate::recorder::switcher::SwitchStrategy;
    use crate::utils::error::ErrorKind;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.json");

        let mut config = PipelineConfig::default();
        config.sensor = "ov9750".to_string();
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(
            &path,
            r#"{
                "sensor": "gc1004",
                "runSecs": 1,
                "switch": {
                    "capture": 0,
                    "resolution": "720p",
                    "strategy": "recreate",
                    "encoders": [
                        {"index": 0, "group": 0, "resolution": "720p", "bitrateKbps": 2000},
                        {"index": 1, "group": 1, "createGroup": true, "resolution": "vga", "bitrateKbps": 1000}
                    ],
                    "bindings": [{"capture": 1, "group": 1}]
                }
            }"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.sensor, "gc1004");
        assert_eq!(config.run_secs, 1);
        assert_eq!(config.captures.len(), 2);
        let plan = config.switch.unwrap();
        assert_eq!(plan.strategy, SwitchStrategy::Recreate);
        assert_eq!(plan.encoders[1].resolution, Resolution::VGA);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let err = load_config(&dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, "{ not json").unwrap();

        let err = load_config(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
