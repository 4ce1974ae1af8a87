//! Session configuration.
//! Loaded from a JSON file; every section falls back to defaults taken from the
//! SpikerBox recorder (44.1 kHz microphone, 10 kHz USB serial, 6 s live window).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::analysis::AnalysisConfig;
use crate::audio::am::AmDetectionConfig;
use crate::audio::filters::FilterSettings;
use crate::audio::recorder::QueueFullPolicy;
use crate::error::ConfigError;

/// Environment variable naming the config file read by [`SessionConfig::from_env`].
pub const CONFIG_ENV_VAR: &str = "SPIKE_RECORDER_CONFIG";

/// Acquisition pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub microphone_sample_rate: u32,
    pub usb_sample_rate: u32,
    /// Seconds of signal the live ring buffer retains.
    pub max_buffer_seconds: f64,
    pub recordings_dir: PathBuf,
    /// Batches the recording queue holds before the full-queue policy applies.
    pub recording_queue_capacity: usize,
    pub recording_queue_policy: QueueFullPolicy,
    /// Frames the playback reader pushes per batch.
    pub playback_batch_frames: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            microphone_sample_rate: 44_100,
            usb_sample_rate: 10_000,
            max_buffer_seconds: 6.0,
            recordings_dir: std::env::temp_dir().join("spike-recorder"),
            recording_queue_capacity: 64,
            recording_queue_policy: QueueFullPolicy::Block,
            playback_batch_frames: 2_048,
        }
    }
}

/// Top-level configuration for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub acquisition: AcquisitionConfig,
    pub filters: FilterSettings,
    pub am_detection: AmDetectionConfig,
    pub analysis: AnalysisConfig,
    /// `None` keeps spike analyses in memory only.
    pub database_path: Option<PathBuf>,
    pub log_json: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            acquisition: AcquisitionConfig::default(),
            filters: FilterSettings::default(),
            am_detection: AmDetectionConfig::default(),
            analysis: AnalysisConfig::default(),
            database_path: None,
            log_json: false,
        }
    }
}

impl SessionConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&raw)?;
        info!(path = %path.display(), "session config loaded");
        Ok(config)
    }

    /// The file named by [`CONFIG_ENV_VAR`], or `None` when the variable is unset.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load_from_file(Path::new(&path)).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env::temp_dir;

    fn temp_path(name: &str) -> PathBuf {
        temp_dir().join(format!("spike_recorder_config_{}_{}.json", std::process::id(), name))
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let path = temp_path("partial");
        std::fs::write(
            &path,
            r#"{ "acquisition": { "usb_sample_rate": 5000 }, "log_json": true }"#,
        )
        .unwrap();

        let config = SessionConfig::load_from_file(&path).unwrap();
        assert_eq!(config.acquisition.usb_sample_rate, 5000);
        assert_eq!(config.acquisition.microphone_sample_rate, 44_100);
        assert!(config.log_json);
        assert_eq!(config.analysis, AnalysisConfig::default());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let path = temp_path("invalid");
        std::fs::write(&path, "{ not json").unwrap();
        let err = SessionConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn env_var_names_the_config_file() {
        let path = temp_path("env");
        std::fs::write(&path, r#"{ "log_json": true }"#).unwrap();
        std::env::set_var(CONFIG_ENV_VAR, &path);
        let config = SessionConfig::from_env().unwrap().unwrap();
        std::env::remove_var(CONFIG_ENV_VAR);
        assert!(config.log_json);
        assert!(SessionConfig::from_env().unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = SessionConfig::load_from_file(&temp_path("does_not_exist")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
