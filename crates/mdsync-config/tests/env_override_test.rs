//! Environment overrides run in their own test binary so they cannot leak
//! into the file-based tests.

use mdsync_config::testing::TestEnvironment;
use mdsync_config::WriteStrategy;

#[test]
fn test_env_overrides_beat_files() {
    let env = TestEnvironment::new().unwrap();
    env.write_project_config("[sync]\nwrite_strategy = \"distributed\"\n")
        .unwrap();

    std::env::set_var("MDSYNC_WRITE_STRATEGY", "centralized");
    std::env::set_var("MDSYNC_DIRTY_BYTES_THRESHOLD", "777");
    let loaded = env.load_config();

    std::env::set_var("MDSYNC_DIRTY_BYTES_THRESHOLD", "lots");
    let rejected = env.load_config();

    std::env::remove_var("MDSYNC_WRITE_STRATEGY");
    std::env::remove_var("MDSYNC_DIRTY_BYTES_THRESHOLD");

    let config = loaded.unwrap();
    assert_eq!(config.sync.write_strategy, WriteStrategy::Centralized);
    assert_eq!(config.sync.dirty_bytes_threshold, 777);
    assert!(rejected.is_err());
}
