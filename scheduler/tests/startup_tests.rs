// Startup configuration tests for the daemon

use common::config::Settings;
use common::scheduler::EngineConfig;
use proptest::prelude::*;
use std::time::Duration;

#[test]
fn test_shipped_default_config_is_valid() {
    let settings = Settings::load_from_path("../config").expect("config/default.toml should load");
    settings.validate().expect("shipped defaults should validate");

    let engine_config = EngineConfig::from_settings(&settings).unwrap();
    assert_eq!(engine_config.timezone, chrono_tz::UTC);
    assert_eq!(engine_config.shutdown_grace, Duration::from_secs(30));
    assert_eq!(
        engine_config.backups.root(),
        std::path::Path::new("/var/backups/mssql")
    );
}

#[test]
fn test_unknown_timezone_is_rejected() {
    let mut settings = Settings::default();
    settings.scheduler.timezone = "Mars/Olympus_Mons".to_string();
    assert!(settings.validate().is_err());
    assert!(EngineConfig::from_settings(&settings).is_err());
}

proptest! {
    #[test]
    fn prop_shutdown_grace_is_taken_verbatim(seconds in 0u64..86_400) {
        let mut settings = Settings::default();
        settings.scheduler.shutdown_grace_seconds = seconds;
        let engine_config = EngineConfig::from_settings(&settings).unwrap();
        prop_assert_eq!(engine_config.shutdown_grace, Duration::from_secs(seconds));
    }
}
