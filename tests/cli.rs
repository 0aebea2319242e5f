mod common;

use common::*;
use policyserve_core::{
    cli::{commands::client::PredictCommand, handle_predict},
    config::Settings,
};
use serde_json::json;
use std::io::Write;

fn settings_for(checkpoint: &std::path::Path) -> Settings {
    Settings {
        backend: local_config(checkpoint),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_predict_reads_observation_file() {
    let checkpoint = write_checkpoint(true);
    let obs = observation();

    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    let body = json!({
        "state": obs.state.to_nested_json(),
        "image": obs.image.to_nested_json(),
    });
    write!(file, "{}", body).unwrap();

    let cmd = PredictCommand {
        observation: file.path().to_path_buf(),
    };
    handle_predict(settings_for(checkpoint.path()), cmd)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_predict_missing_file_fails() {
    let checkpoint = write_checkpoint(true);
    let cmd = PredictCommand {
        observation: checkpoint.path().join("missing.json"),
    };
    let err = handle_predict(settings_for(checkpoint.path()), cmd)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("missing.json"));
}
