use crate::render::formats::GL_SRGB8_ALPHA8;
use crate::render::framebuffer::FramebufferConfig;
use crate::vr::runtime::{ApplicationInfo, PerfLevel};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub application_name: String,
    pub application_version: u32,
    pub engine_name: String,
    pub engine_version: u32,
    /// GL internal format requested for the eye swapchains.
    pub color_format: i64,
    pub sample_count: u32,
    pub multiview: bool,
    pub cpu_level: PerfLevel,
    pub gpu_level: PerfLevel,
    pub signal_capacity: usize,
    pub max_messages_per_tick: usize,
    pub swapchain_wait_timeout_ms: u64,
    pub swapchain_wait_retries: u32,
    pub telemetry_window: usize,
    pub frame_budget_ms: f32,
    /// Abort the process when the render thread hits a fatal error.
    pub abort_on_fatal: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            application_name: "Stereo Session".to_string(),
            application_version: 1,
            engine_name: "hmd_runtime".to_string(),
            engine_version: 1,
            color_format: GL_SRGB8_ALPHA8,
            sample_count: 4,
            multiview: false,
            cpu_level: PerfLevel::Boost,
            gpu_level: PerfLevel::Boost,
            signal_capacity: 64,
            max_messages_per_tick: 20,
            swapchain_wait_timeout_ms: 1000,
            swapchain_wait_retries: 3,
            telemetry_window: 1000,
            frame_budget_ms: 11.1,
            abort_on_fatal: true,
        }
    }
}

impl AppConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid("application_name is empty".into()));
        }
        if self.sample_count == 0 {
            return Err(ConfigError::Invalid("sample_count must be at least 1".into()));
        }
        if !self.signal_capacity.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "signal_capacity {} is not a power of two",
                self.signal_capacity
            )));
        }
        if self.max_messages_per_tick == 0 {
            return Err(ConfigError::Invalid(
                "max_messages_per_tick must be at least 1".into(),
            ));
        }
        if self.telemetry_window == 0 {
            return Err(ConfigError::Invalid("telemetry_window must be at least 1".into()));
        }
        Ok(())
    }

    pub fn application_info(&self) -> ApplicationInfo {
        ApplicationInfo {
            application_name: self.application_name.clone(),
            application_version: self.application_version,
            engine_name: self.engine_name.clone(),
            engine_version: self.engine_version,
        }
    }

    pub fn swapchain_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.swapchain_wait_timeout_ms)
    }

    pub fn framebuffer_config(&self, width: u32, height: u32) -> FramebufferConfig {
        FramebufferConfig {
            wait_timeout: self.swapchain_wait_timeout(),
            wait_retries: self.swapchain_wait_retries,
            ..FramebufferConfig::new(
                self.color_format,
                width,
                height,
                self.sample_count,
                self.multiview,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = AppConfig::from_json_str(r#"{ "sample_count": 2, "multiview": true }"#)
            .expect("config should parse");

        assert_eq!(config.sample_count, 2);
        assert!(config.multiview);
        assert_eq!(config.signal_capacity, 64);
        assert_eq!(config.max_messages_per_tick, 20);
        assert_eq!(config.cpu_level, PerfLevel::Boost);
        assert!(config.abort_on_fatal);
    }

    #[test]
    fn perf_levels_parse_from_snake_case() {
        let config = AppConfig::from_json_str(r#"{ "gpu_level": "sustained_high" }"#)
            .expect("config should parse");
        assert_eq!(config.gpu_level, PerfLevel::SustainedHigh);
    }

    #[test]
    fn capacity_must_be_power_of_two() {
        let err = AppConfig::from_json_str(r#"{ "signal_capacity": 48 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "application_name": "Bench", "swapchain_wait_timeout_ms": 250 }}"#)
            .expect("write config");

        let config = AppConfig::from_path(file.path()).expect("config should load");
        assert_eq!(config.application_name, "Bench");
        assert_eq!(config.swapchain_wait_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.framebuffer_config(512, 512).wait_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = AppConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
