use policyserve_core::config::{BackendKind, ConfigArgs, Settings};
use policyserve_core::Error;
use std::io::Write;

#[test]
fn test_environment_overrides_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        "[backend]\nkind = \"gateway\"\nendpoint = \"http://gw.local:8080\"\n\n[pipeline]\nstate_dim = 14"
    )
    .unwrap();

    std::env::set_var("POLICYSERVE_BACKEND__MODEL_VERSION", "2024-06");
    let settings = Settings::load(&ConfigArgs {
        config: Some(file.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap();
    std::env::remove_var("POLICYSERVE_BACKEND__MODEL_VERSION");

    assert_eq!(settings.backend.kind, BackendKind::Gateway);
    assert_eq!(settings.backend.model_version, "2024-06");
    assert_eq!(settings.backend.pipeline.state_dim, 14);
    assert_eq!(settings.backend.pipeline().state_dim(), 14);
    assert!(settings.backend.validate().is_ok());
}

#[test]
fn test_cli_flags_win_over_everything() {
    let args = ConfigArgs {
        kind: Some("rpc".into()),
        endpoint: Some("127.0.0.1:9001".into()),
        model_name: Some("act_stack_cubes".into()),
        device: Some("cpu".into()),
        ..Default::default()
    };
    let settings = Settings::load(&args).unwrap();
    assert_eq!(settings.backend.kind, BackendKind::TensorRpc);
    assert_eq!(settings.backend.endpoint.as_deref(), Some("127.0.0.1:9001"));
    assert_eq!(settings.backend.model_name, "act_stack_cubes");
    assert_eq!(settings.server.model_name, "act_stack_cubes");
}

#[test]
fn test_missing_config_file_is_an_error() {
    let args = ConfigArgs {
        config: Some("/nonexistent/policyserve.toml".into()),
        ..Default::default()
    };
    assert!(matches!(Settings::load(&args), Err(Error::Config(_))));
}

#[test]
fn test_unknown_device_rejected() {
    let args = ConfigArgs {
        device: Some("tpu".into()),
        ..Default::default()
    };
    assert!(matches!(Settings::load(&args), Err(Error::Config(_))));
}

#[test]
fn test_settings_print_as_json() {
    let settings = Settings::load(&ConfigArgs::default()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&settings.to_json_pretty().unwrap()).unwrap();
    assert_eq!(json["backend"]["kind"], "local");
    assert_eq!(json["gateway"]["port"], 8080);
    assert_eq!(json["gateway"]["max_body_bytes"], 64 * 1024 * 1024);
}
