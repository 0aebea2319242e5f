mod common;

use common::*;
use policyserve_core::{
    config::BackendKind,
    model::LoadedPolicy,
    wire::TensorNames,
    BackendFactory, Error, ErrorCategory, HostTensor, Observation,
};
use std::time::Duration;

#[tokio::test]
async fn test_all_backends_return_the_same_action() {
    let checkpoint = write_checkpoint(true);
    let server = start_flight_server(load_policy(checkpoint.path()), TensorNames::default()).await;
    let gateway = start_gateway(server.addr).await;
    let obs = observation();

    let local = BackendFactory::create(&local_config(checkpoint.path()))
        .await
        .unwrap();
    let rpc = BackendFactory::create(&rpc_config(server.addr)).await.unwrap();
    let json = BackendFactory::create(&gateway_config(gateway.addr))
        .await
        .unwrap();

    let expected = local.predict(&obs).await.unwrap();
    assert_eq!(expected.len(), ACTION_DIM);
    assert_close(&rpc.predict(&obs).await.unwrap(), &expected);
    assert_close(&json.predict(&obs).await.unwrap(), &expected);

    // Same pixels in CHW float layout
    let chw = match &obs.image {
        policyserve_core::ImageData::U8(t) => {
            let hwc = t.data();
            let mut out = vec![0.0f32; hwc.len()];
            for c in 0..3 {
                for i in 0..HEIGHT * WIDTH {
                    out[c * HEIGHT * WIDTH + i] = hwc[i * 3 + c] as f32;
                }
            }
            HostTensor::new(vec![3, HEIGHT, WIDTH], out).unwrap()
        }
        other => panic!("unexpected dtype {}", other.dtype()),
    };
    let chw_obs = Observation::new(obs.state.data().to_vec(), chw);
    assert_close(&rpc.predict(&chw_obs).await.unwrap(), &expected);
}

#[tokio::test]
async fn test_stats_are_applied_once() {
    let with_stats = write_checkpoint(true);
    let without_stats = write_checkpoint(false);
    let obs = observation();

    let raw = BackendFactory::create(&local_config(without_stats.path()))
        .await
        .unwrap()
        .predict(&obs)
        .await
        .unwrap();
    let server = start_flight_server(load_policy(with_stats.path()), TensorNames::default()).await;
    let remote = BackendFactory::create(&rpc_config(server.addr))
        .await
        .unwrap()
        .predict(&obs)
        .await
        .unwrap();

    let expected: Vec<f32> = raw
        .iter()
        .enumerate()
        .map(|(i, v)| v * (1.0 + i as f32 * 0.25) + i as f32 * 0.5)
        .collect();
    assert_close(&remote, &expected);
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_construction() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = BackendFactory::create(&rpc_config(addr)).await.unwrap_err();
    assert!(matches!(err, Error::Connection { .. }), "got {:?}", err);
    assert_eq!(err.category(), ErrorCategory::Unreachable);
}

#[tokio::test]
async fn test_unknown_model_is_not_ready() {
    let checkpoint = write_checkpoint(true);
    let server = start_flight_server(load_policy(checkpoint.path()), TensorNames::default()).await;

    let mut config = rpc_config(server.addr);
    config.model_version = "2".to_string();
    let err = BackendFactory::create(&config).await.unwrap_err();
    assert!(matches!(err, Error::NotReady { .. }), "got {:?}", err);
}

#[tokio::test]
async fn test_draining_host_is_not_ready() {
    let checkpoint = write_checkpoint(true);
    let server = start_flight_server(load_policy(checkpoint.path()), TensorNames::default()).await;
    let backend = BackendFactory::create(&rpc_config(server.addr)).await.unwrap();
    backend.health().await.unwrap();

    server.host.shutdown();
    assert!(matches!(backend.health().await, Err(Error::NotReady { .. })));
    assert!(matches!(
        backend.predict(&observation()).await,
        Err(Error::Cancelled(_))
    ));
}

#[tokio::test]
async fn test_timeout_leaves_backend_usable() {
    let checkpoint = write_checkpoint(true);
    let model = SlowFirstCall::load(checkpoint.path(), Duration::from_millis(800));
    let policy = LoadedPolicy::new(
        Box::new(model),
        None,
        pipeline_settings().pipeline(),
        "cpu",
    )
    .unwrap();
    let server = start_flight_server(policy, TensorNames::default()).await;

    let mut config = rpc_config(server.addr);
    config.timeout_ms = 300;
    let backend = BackendFactory::create(&config).await.unwrap();
    let obs = observation();

    let err = backend.predict(&obs).await.unwrap_err();
    assert!(err.is_timeout(), "got {:?}", err);
    assert_eq!(err.category(), ErrorCategory::Transient);

    // Let the stalled forward pass finish before retrying on the same channel
    tokio::time::sleep(Duration::from_millis(700)).await;
    let action = backend.predict(&obs).await.unwrap();
    assert_eq!(action.len(), ACTION_DIM);
}

#[tokio::test]
async fn test_remote_shape_rejection_is_input_error() {
    let checkpoint = write_checkpoint(true);
    let server = start_flight_server(load_policy(checkpoint.path()), TensorNames::default()).await;

    // Client accepts any frame size, the host only serves HEIGHT x WIDTH
    let mut config = rpc_config(server.addr);
    config.pipeline.image_height = None;
    config.pipeline.image_width = None;
    let backend = BackendFactory::create(&config).await.unwrap();

    let small = Observation::new(
        vec![0.0; STATE_DIM],
        HostTensor::new(vec![4, 4, 3], vec![0u8; 48]).unwrap(),
    );
    let err = backend.predict(&small).await.unwrap_err();
    assert!(matches!(err, Error::Shape(_)), "got {:?}", err);

    // The channel keeps serving well-formed requests
    backend.predict(&observation()).await.unwrap();
}

#[tokio::test]
async fn test_custom_tensor_names() {
    let checkpoint = write_checkpoint(true);
    let names = TensorNames {
        state: "observation.state".to_string(),
        image: "observation.images.top_cam".to_string(),
        action: "action".to_string(),
    };
    let server = start_flight_server(load_policy(checkpoint.path()), names.clone()).await;

    let mut config = rpc_config(server.addr);
    config.tensor_names = names;
    let backend = BackendFactory::create(&config).await.unwrap();
    assert_eq!(backend.predict(&observation()).await.unwrap().len(), ACTION_DIM);

    // A client using the default names is refused by the host
    let mismatched = BackendFactory::create(&rpc_config(server.addr)).await.unwrap();
    assert!(mismatched.predict(&observation()).await.is_err());
}

#[tokio::test]
async fn test_closed_backend_cancels_calls() {
    let checkpoint = write_checkpoint(true);
    let server = start_flight_server(load_policy(checkpoint.path()), TensorNames::default()).await;

    for config in [local_config(checkpoint.path()), rpc_config(server.addr)] {
        let backend = BackendFactory::create(&config).await.unwrap();
        backend.close().await.unwrap();
        backend.close().await.unwrap();

        let err = backend.predict(&observation()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)), "{}: {:?}", backend.name(), err);
        assert!(matches!(backend.health().await, Err(Error::Cancelled(_))));
    }
}

#[tokio::test]
async fn test_local_shape_errors_before_inference() {
    let checkpoint = write_checkpoint(true);
    let backend = BackendFactory::create(&local_config(checkpoint.path()))
        .await
        .unwrap();
    assert_eq!(backend.name(), BackendKind::Local.as_str());

    let wrong_state = Observation::new(vec![0.0; STATE_DIM - 1], observation().image);
    let err = backend.predict(&wrong_state).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::InputRejected);

    let wrong_size = Observation::new(
        vec![0.0; STATE_DIM],
        HostTensor::new(vec![HEIGHT, WIDTH + 1, 3], vec![0u8; HEIGHT * (WIDTH + 1) * 3]).unwrap(),
    );
    assert!(matches!(
        backend.predict(&wrong_size).await,
        Err(Error::Shape(_))
    ));
}
