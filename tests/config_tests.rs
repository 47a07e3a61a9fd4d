use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use agentrunner_core::config::{AgentRunnerConfig, BrokerKind, ConfigManager, LogFormat};

fn shipped_config_dir() -> Option<PathBuf> {
    Some(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config"))
}

fn load(environment: &str) -> AgentRunnerConfig {
    ConfigManager::load_with_overrides(shipped_config_dir(), environment, Some(HashMap::new()))
        .expect("shipped configuration loads")
        .config()
        .clone()
}

#[test]
fn test_base_file_matches_built_in_defaults() {
    assert_eq!(load("development"), AgentRunnerConfig::default());
}

#[test]
fn test_test_environment_shortens_timings() {
    let config = load("test");
    assert_eq!(config.isolated_pool.retry_delay(), Duration::ZERO);
    assert_eq!(config.orchestrator.health_check_interval(), Duration::from_secs(1));
    assert_eq!(config.bus.reconnect_delay(), Duration::from_millis(10));
    assert_eq!(config.logging.format, LogFormat::Compact);
    // untouched sections keep the base values
    assert_eq!(config.persistent_runner.context_window, 10);
}

#[test]
fn test_production_environment_selects_rabbitmq() {
    let config = load("production");
    assert_eq!(config.bus.provider, BrokerKind::Rabbitmq);
    assert_eq!(config.isolated_pool.instances_per_worker, 3);
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
fn test_variables_override_environment_file() {
    let overrides = HashMap::from([(
        "AGENTRUNNER__ISOLATED_POOL__MAX_RETRIES".to_string(),
        "5".to_string(),
    )]);
    let manager = ConfigManager::load_with_overrides(shipped_config_dir(), "test", Some(overrides))
        .expect("configuration loads");
    assert_eq!(manager.config().isolated_pool.max_retries, 5);
    assert_eq!(manager.environment(), "test");
}
