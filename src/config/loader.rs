//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered with the
//! `config` crate: built-in defaults, the base TOML file, the environment
//! override file, then `AGENTRUNNER__`-prefixed environment variables.

use super::error::{ConfigResult, ConfigurationError};
use super::AgentRunnerConfig;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Prefix for environment variable overrides, e.g.
/// `AGENTRUNNER__ORCHESTRATOR__MAX_RESTART_ATTEMPTS=5`
pub const ENV_PREFIX: &str = "AGENTRUNNER";
const ENV_SEPARATOR: &str = "__";
const BASE_FILE_NAME: &str = "agentrunner";

/// Loaded, validated configuration plus the context it was loaded in
#[derive(Debug)]
pub struct ConfigManager {
    config: AgentRunnerConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_overrides(config_dir, environment, None)
    }

    /// Load configuration with an explicit set of environment overrides
    ///
    /// When `overrides` is `Some`, it replaces the process environment as the
    /// variable source, which keeps tests independent of global state.
    pub fn load_with_overrides(
        config_dir: Option<PathBuf>,
        environment: &str,
        overrides: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = %environment,
            config_directory = %config_directory.display(),
            "Loading configuration"
        );

        let config = Self::build(&config_directory, environment, overrides)?;
        config.validate()?;

        info!(
            environment = %environment,
            broker = ?config.bus.provider,
            bus_url = %config.bus.url_redacted(),
            health_check_interval_seconds = config.orchestrator.health_check_interval_seconds,
            "⚙️ CONFIG: Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration (validated)
    pub fn from_config(config: AgentRunnerConfig, environment: &str) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        })
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &AgentRunnerConfig {
        &self.config
    }

    /// Get the detected environment
    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Detect the current environment from environment variables
    pub fn detect_environment() -> String {
        env::var("AGENTRUNNER_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn default_config_directory() -> PathBuf {
        env::var("AGENTRUNNER_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn build(
        config_directory: &Path,
        environment: &str,
        overrides: Option<HashMap<String, String>>,
    ) -> ConfigResult<AgentRunnerConfig> {
        let base_file = config_directory.join(format!("{BASE_FILE_NAME}.toml"));
        let environment_file =
            config_directory.join(format!("{BASE_FILE_NAME}.{environment}.toml"));

        let environment_source = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(overrides);

        let settings = config::Config::builder()
            .add_source(config::File::from(base_file).required(false))
            .add_source(config::File::from(environment_file).required(false))
            .add_source(environment_source)
            .build()
            .map_err(|e| ConfigurationError::environment_config_error(environment, e))?;

        settings
            .try_deserialize::<AgentRunnerConfig>()
            .map_err(ConfigurationError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerKind, LogFormat};
    use std::fs;

    #[test]
    fn test_load_defaults_from_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::load_with_overrides(
            Some(dir.path().to_path_buf()),
            "test",
            Some(HashMap::new()),
        )
        .unwrap();

        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config(), &AgentRunnerConfig::default());
    }

    #[test]
    fn test_environment_file_overrides_base_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("agentrunner.toml"),
            r#"
[orchestrator]
health_check_interval_seconds = 30
max_restart_attempts = 5

[logging]
format = "json"
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("agentrunner.production.toml"),
            r#"
[orchestrator]
health_check_interval_seconds = 15

[bus]
provider = "rabbitmq"
url = "amqp://rabbit:5672/%2F"
"#,
        )
        .unwrap();

        let manager = ConfigManager::load_with_overrides(
            Some(dir.path().to_path_buf()),
            "production",
            Some(HashMap::new()),
        )
        .unwrap();
        let config = manager.config();

        assert_eq!(config.orchestrator.health_check_interval_seconds, 15);
        assert_eq!(config.orchestrator.max_restart_attempts, 5);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.bus.provider, BrokerKind::Rabbitmq);
        assert_eq!(config.isolated_pool.max_retries, 2);
    }

    #[test]
    fn test_environment_variables_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("agentrunner.toml"),
            "[isolated_pool]\nretry_delay_seconds = 9\n",
        )
        .unwrap();

        let mut overrides = HashMap::new();
        overrides.insert(
            "AGENTRUNNER__ISOLATED_POOL__RETRY_DELAY_SECONDS".to_string(),
            "1".to_string(),
        );

        let manager = ConfigManager::load_with_overrides(
            Some(dir.path().to_path_buf()),
            "test",
            Some(overrides),
        )
        .unwrap();

        assert_eq!(manager.config().isolated_pool.retry_delay_seconds, 1);
    }

    #[test]
    fn test_invalid_configuration_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("agentrunner.toml"),
            "[persistent_runner]\nidle_check_interval_seconds = 0\n",
        )
        .unwrap();

        let result = ConfigManager::load_with_overrides(
            Some(dir.path().to_path_buf()),
            "test",
            Some(HashMap::new()),
        );
        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("agentrunner.toml"), "[orchestrator\nbroken").unwrap();

        let result = ConfigManager::load_with_overrides(
            Some(dir.path().to_path_buf()),
            "test",
            Some(HashMap::new()),
        );
        assert!(result.is_err());
    }
}
