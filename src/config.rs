use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Tuning knobs for the hierarchical evaluation engine.
///
/// None of these settings change numerical results: the serial and parallel paths
/// accumulate every output in the same ascending order and are bit-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Allow rayon to split forward and backward passes across threads.
    pub parallel: bool,
    /// Below this many (sample, control point) pairs the serial path is always used.
    pub min_parallel_terms: usize,
    /// When set, preparing a context warns about samples whose basis weights do not sum
    /// to one within this tolerance. Truncated hierarchical bases keep the partition of
    /// unity, so a violation usually means the upstream support lists are inconsistent.
    pub unity_tolerance: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            min_parallel_terms: 16_384,
            unity_tolerance: None,
        }
    }
}

/// Custom error type for loading and saving engine configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Unity tolerance must be finite and non-negative, got {0}.")]
    InvalidTolerance(f64),
}

impl EngineConfig {
    /// A config that never leaves the calling thread.
    pub fn serial() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }

    /// Whether a pass over `num_terms` pairs should run on the rayon pool.
    pub fn use_parallel(&self, num_terms: usize) -> bool {
        self.parallel && num_terms >= self.min_parallel_terms
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        Self::from_toml_str(&toml_string)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = self.to_toml_string()?;
        let mut writer = BufWriter::new(fs::File::create(path)?);
        writer.write_all(toml_string.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.unity_tolerance {
            Some(tol) if !(tol.is_finite() && tol >= 0.0) => Err(ConfigError::InvalidTolerance(tol)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config = EngineConfig::from_toml_str("parallel = false\n").unwrap();
        assert!(!config.parallel);
        assert_eq!(config.min_parallel_terms, EngineConfig::default().min_parallel_terms);
        assert_eq!(config.unity_tolerance, None);
    }

    #[test]
    fn save_and_load_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let config = EngineConfig {
            parallel: true,
            min_parallel_terms: 8,
            unity_tolerance: Some(1e-9),
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn negative_tolerance_is_rejected() {
        let err = EngineConfig::from_toml_str("unity_tolerance = -1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTolerance(t) if t == -1.0));
    }

    #[test]
    fn parallel_threshold_is_respected() {
        let config = EngineConfig {
            min_parallel_terms: 100,
            ..EngineConfig::default()
        };
        assert!(!config.use_parallel(99));
        assert!(config.use_parallel(100));
        assert!(!EngineConfig::serial().use_parallel(usize::MAX));
    }
}
