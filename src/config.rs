use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Tool locations and scheduler limits. CLI flags override these.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub converter_program: String,
    pub container_runtime: String,
    pub preprocess_image: String,
    pub conversion_timeout_secs: u64,
    pub termination_grace_secs: u64,
    pub cleanup_retries: u32,
    pub default_parallelism: Option<usize>,
    pub freesurfer_license: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            converter_program: "dcm2niix".to_string(),
            container_runtime: "docker".to_string(),
            preprocess_image: "nipreps/fmriprep:latest".to_string(),
            conversion_timeout_secs: 1800,
            termination_grace_secs: 5,
            cleanup_retries: 3,
            default_parallelism: None,
            freesurfer_license: None,
        }
    }
}

impl AppConfig {
    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout_secs)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }

    /// Configured worker count, or the CPU count clamped to 4..=12.
    pub fn parallelism(&self) -> usize {
        self.default_parallelism
            .filter(|n| *n > 0)
            .unwrap_or_else(|| rayon::current_num_threads().clamp(4, 12))
    }
}

pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let defaults = AppConfig::default();
    let builder = Config::builder()
        .set_default("converter_program", defaults.converter_program)?
        .set_default("container_runtime", defaults.container_runtime)?
        .set_default("preprocess_image", defaults.preprocess_image)?
        .set_default("conversion_timeout_secs", defaults.conversion_timeout_secs)?
        .set_default("termination_grace_secs", defaults.termination_grace_secs)?
        .set_default("cleanup_retries", u64::from(defaults.cleanup_retries))?
        // Add configuration values from a file named 'Config.toml', if present
        .add_source(ConfigFile::with_name("Config").required(false))
        .add_source(Environment::with_prefix("BIDSFLOW"))
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_tool_conventions() {
        let config = AppConfig::default();
        assert_eq!(config.converter_program, "dcm2niix");
        assert_eq!(config.conversion_timeout(), Duration::from_secs(30 * 60));
        assert_eq!(config.termination_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_parallelism_uses_explicit_value() {
        let config = AppConfig {
            default_parallelism: Some(3),
            ..AppConfig::default()
        };
        assert_eq!(config.parallelism(), 3);
    }

    #[test]
    fn test_parallelism_falls_back_to_clamped_cpu_count() {
        let config = AppConfig {
            default_parallelism: Some(0),
            ..AppConfig::default()
        };
        let workers = config.parallelism();
        assert!((4..=12).contains(&workers));
    }
}
