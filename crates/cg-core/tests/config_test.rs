use cg_core::config::{expand_home, Config};

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.general.log_format, "human");
    assert_eq!(cfg.runtime.kind, "docker");
    assert_eq!(cfg.runtime.image, "frdel/agent-zero-run:latest");
    assert_eq!(cfg.runtime.container_workdir, "/code");
    assert_eq!(cfg.sessions.base_dir, "~/agent_workspaces");
    assert_eq!(cfg.terminal.idle_timeout_secs, 300);
    assert_eq!(cfg.daemon.port, 8000);
    assert_eq!(cfg.daemon.host, "0.0.0.0");
    assert_eq!(cfg.reconnect.max_attempts, 5);
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("agent-zero-run"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.daemon.port, cfg.daemon.port);
    assert_eq!(parsed.terminal.poll_interval_ms, cfg.terminal.poll_interval_ms);
    assert_eq!(parsed.daemon.allowed_origins, cfg.daemon.allowed_origins);
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[runtime]
kind = "local"

[daemon]
port = 1234
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.runtime.kind, "local");
    assert_eq!(cfg.daemon.port, 1234);
    assert_eq!(cfg.runtime.shell, "/bin/bash");
    assert_eq!(cfg.sessions.sweep_interval_secs, 60);
    cfg.validate().expect("config validates");
}

#[test]
fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[terminal]\nidle_timeout_secs = 42\n").unwrap();
    let cfg = Config::load_from(&path).expect("load");
    assert_eq!(cfg.terminal.idle_timeout_secs, 42);
}

#[test]
fn load_from_missing_file_is_io_error() {
    let err = Config::load_from("/definitely/not/here.toml").expect_err("missing file");
    assert!(err.to_string().starts_with("io:"));
}

#[test]
fn unknown_runtime_fails_validation() {
    let mut cfg = Config::default();
    cfg.runtime.kind = "podman".into();
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("runtime.kind"));
}

#[test]
fn overrides_apply_and_validate() {
    let mut cfg = Config::default();
    cfg.apply_overrides([
        ("CROGIA_PORT", "9100"),
        ("CROGIA_RUNTIME", "LOCAL"),
        ("CROGIA_IMAGE", "alpine:3"),
        ("UNRELATED", "x"),
    ])
    .expect("overrides");
    assert_eq!(cfg.daemon.port, 9100);
    assert_eq!(cfg.runtime.kind, "local");
    assert_eq!(cfg.runtime.image, "alpine:3");
}

#[test]
fn malformed_numeric_override_is_rejected() {
    let mut cfg = Config::default();
    let err = cfg
        .apply_overrides([("CROGIA_PORT", "eighty")])
        .expect_err("bad port");
    assert!(err.to_string().contains("CROGIA_PORT"));
}

#[test]
fn expand_home_handles_plain_paths() {
    assert_eq!(expand_home("/srv/ws"), std::path::PathBuf::from("/srv/ws"));
    assert!(!expand_home("~/ws").to_string_lossy().starts_with('~'));
}
