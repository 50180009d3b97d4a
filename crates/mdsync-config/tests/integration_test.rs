//! Integration tests for mdsync-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use mdsync_config::testing::TestEnvironment;
use mdsync_config::{Config, ConfigError, WriteStrategy};

/// Test config loading from a real global config file
#[test]
fn test_load_global_config_from_file() {
    let env = TestEnvironment::new().unwrap();
    env.write_global_config(
        r#"
[sync]
write_strategy = "centralized"
dirty_bytes_threshold = 65536
coordinator_rank = 2

[cache]
max_size = 1048576
min_clean_fraction = 0.5
evictions_enabled = false
"#,
    )
    .unwrap();

    let config = env.load_config().unwrap();

    assert_eq!(config.sync.write_strategy, WriteStrategy::Centralized);
    assert_eq!(config.sync.dirty_bytes_threshold, 65536);
    assert_eq!(config.sync.coordinator_rank, 2);
    assert!(config.sync.verify_candidate_digest);
    assert_eq!(config.cache.max_size, 1_048_576);
    assert_eq!(config.cache.min_clean_fraction, 0.5);
    assert!(!config.cache.evictions_enabled);
}

/// Test config hierarchy: project config overrides global, key by key
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let env = TestEnvironment::new().unwrap();
    env.write_global_config(
        r#"
[sync]
write_strategy = "centralized"
dirty_bytes_threshold = 4096

[cache]
max_size = 8192
"#,
    )
    .unwrap();
    env.write_project_config(
        r#"
[sync]
dirty_bytes_threshold = 1024
"#,
    )
    .unwrap();

    let config = env.load_config().unwrap();

    // Project value wins, untouched global values survive
    assert_eq!(config.sync.dirty_bytes_threshold, 1024);
    assert_eq!(config.sync.write_strategy, WriteStrategy::Centralized);
    assert_eq!(config.cache.max_size, 8192);
}

/// Test that a broken project file surfaces as a TOML error
#[test]
fn test_malformed_project_config_is_rejected() {
    let env = TestEnvironment::new().unwrap();
    env.write_project_config("[sync\nwrite_strategy = ").unwrap();

    let err = env.load_config().unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)));
}

/// Test complete config serialization/deserialization cycle
#[test]
fn test_config_full_roundtrip_with_all_sections() {
    let env = TestEnvironment::new().unwrap();
    env.write_global_config(&Config::default_toml()).unwrap();

    let loaded = env.load_config().unwrap();
    let original = Config::default();

    assert_eq!(original.sync, loaded.sync);
    assert_eq!(original.cache, loaded.cache);
    assert_eq!(original.logging.level, loaded.logging.level);
}

/// Test partial config with defaults filling in
#[test]
fn test_partial_config_defaults_applied() {
    let partial = r#"
[cache]
min_clean_fraction = 0.1
"#;
    let config: Config = toml::from_str(partial).unwrap();

    assert_eq!(config.cache.min_clean_fraction, 0.1);
    assert_eq!(config.cache.max_size, mdsync_config::DEFAULT_MAX_CACHE_SIZE);
    assert_eq!(config.sync.write_strategy, WriteStrategy::Distributed);
    assert!(config.validate().is_ok());
}
