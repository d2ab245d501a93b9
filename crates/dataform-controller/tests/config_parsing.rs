use std::{env, fs};

use dataform_controller::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("dataform.toml");

    let toml_content = r#"
[controller]
workers = 4
cache_sync_timeout_ms = 2000

[rate_limit]
base_delay_ms = 10
max_delay_ms = 60000
qps = 5.0
burst = 20

[logging]
level = "debug"

[provisioner]
region = "eu-west-1"

[store]
seed_file = "records.json"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.controller.workers, 4);
    assert_eq!(cfg.controller.cache_sync_timeout_ms, 2000);
    assert_eq!(cfg.rate_limit.base_delay_ms, 10);
    assert_eq!(cfg.rate_limit.burst, 20);
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.provisioner.region, "eu-west-1");
    assert_eq!(cfg.store.seed_file.as_deref(), Some("records.json"));

    // 2) Env override should win over file
    unsafe {
        env::set_var("DATAFORM__CONTROLLER__WORKERS", "9");
        env::set_var("DATAFORM__RATE_LIMIT__BURST", "7");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.controller.workers, 9);
    assert_eq!(cfg_env.rate_limit.burst, 7);
    unsafe {
        env::remove_var("DATAFORM__CONTROLLER__WORKERS");
        env::remove_var("DATAFORM__RATE_LIMIT__BURST");
    }

    // 3) Missing file falls back to defaults
    let missing = dir.path().join("absent.toml");
    let cfg_default = load_config(missing.to_str()).expect("defaults should be valid");
    assert_eq!(cfg_default.controller.workers, 2);
    assert_eq!(cfg_default.provisioner.region, "local");

    // 4) Invalid config (base delay above max) should error
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[rate_limit]
base_delay_ms = 5000
max_delay_ms = 100
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.contains("base_delay_ms must be <="));

    // 5) Zero workers rejected
    let zero_path = dir.path().join("zero.toml");
    fs::write(&zero_path, "[controller]\nworkers = 0\n").expect("write zero toml");
    let err = load_config(zero_path.to_str()).expect_err("expected validation error");
    assert!(err.contains("controller.workers"));
}
