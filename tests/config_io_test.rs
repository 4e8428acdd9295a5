use sinapsi_alfa::config::Config;
use std::fs;

#[test]
fn save_and_load_yaml_roundtrip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("config.yaml");

    let mut cfg = Config::default();
    cfg.device.host = "10.0.0.5".to_string();
    cfg.device.scan_interval_s = 120;
    cfg.failure.recovery_command = Some("systemctl restart alfa-gateway".to_string());

    cfg.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();

    assert_eq!(loaded.device.host, "10.0.0.5");
    assert_eq!(loaded.device.scan_interval_s, 120);
    assert_eq!(
        loaded.failure.recovery_command.as_deref(),
        Some("systemctl restart alfa-gateway")
    );
    assert!(loaded.validate().is_ok());
}

#[test]
fn partial_yaml_fills_missing_sections_with_defaults() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(
        tmp.path(),
        b"device:\n  name: Alfa\n  host: 192.168.1.50\n  port: 502\n  slave_id: 1\n  scan_interval_s: 60\n  timeout_s: 5\n",
    )
    .unwrap();

    let cfg = Config::from_file(tmp.path()).unwrap();
    assert_eq!(cfg.device.host, "192.168.1.50");
    assert!(!cfg.device.skip_mac_detection);
    assert_eq!(cfg.failure.threshold, 3);
    assert_eq!(cfg.logging.level, "INFO");
}

#[test]
fn config_validation_errors() {
    let mut cfg = Config::default();
    cfg.device.host.clear();
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.device.port = 0;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.device.scan_interval_s = 5;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.device.timeout_s = 120;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.failure.threshold = 0;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.failure.recovery_command = Some("   ".to_string());
    assert!(cfg.validate().is_err());
}

#[test]
fn from_file_with_invalid_yaml_fails() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), b"bad: [unclosed").unwrap();
    let err = Config::from_file(tmp.path()).unwrap_err();
    let msg = format!("{}", err);
    assert!(msg.contains("Serialization error"));
}
