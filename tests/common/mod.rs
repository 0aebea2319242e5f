//! Shared fixtures: a small checkpoint on disk, an in-process tensor RPC
//! server and an in-process JSON gateway, all on ephemeral ports.
#![allow(dead_code)]

use candle_core::{Device, Tensor};
use policyserve_core::{
    config::{BackendConfig, BackendKind, GatewaySettings, PipelineSettings},
    constants::artifact,
    model::{Checkpoint, DevicePreference, LinearPolicy, LoadedPolicy, PolicyModel},
    server::{self, GatewayState},
    service::{HostOptions, PolicyFlightService, ServingHost},
    wire::TensorNames,
    EncodedTensor, HostTensor, InferenceClient, Observation,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

pub const STATE_DIM: usize = 8;
pub const ACTION_DIM: usize = 8;
pub const HEIGHT: usize = 24;
pub const WIDTH: usize = 32;
pub const MODEL: &str = "act_pick_place";
pub const VERSION: &str = "1";

pub fn pipeline_settings() -> PipelineSettings {
    PipelineSettings {
        state_dim: STATE_DIM,
        image_height: Some(HEIGHT),
        image_width: Some(WIDTH),
    }
}

/// Write `model.safetensors` and, if asked, the normalizer stats into a temp dir.
pub fn write_checkpoint(with_stats: bool) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let in_dim = STATE_DIM + 3;

    let weight: Vec<f32> = (0..ACTION_DIM * in_dim)
        .map(|i| ((i % 7) as f32 - 3.0) * 0.1)
        .collect();
    let bias: Vec<f32> = (0..ACTION_DIM).map(|i| i as f32 * 0.01).collect();

    let mut tensors = HashMap::new();
    tensors.insert(
        artifact::POLICY_WEIGHT_KEY.to_string(),
        Tensor::from_vec(weight, (ACTION_DIM, in_dim), &Device::Cpu).unwrap(),
    );
    tensors.insert(
        artifact::POLICY_BIAS_KEY.to_string(),
        Tensor::from_vec(bias, ACTION_DIM, &Device::Cpu).unwrap(),
    );
    candle_core::safetensors::save(&tensors, dir.path().join(artifact::WEIGHTS_FILE)).unwrap();

    if with_stats {
        let mean: Vec<f32> = (0..ACTION_DIM).map(|i| i as f32 * 0.5).collect();
        let std: Vec<f32> = (0..ACTION_DIM).map(|i| 1.0 + i as f32 * 0.25).collect();
        let mut stats = HashMap::new();
        stats.insert(
            artifact::ACTION_MEAN_KEY.to_string(),
            Tensor::from_vec(mean, ACTION_DIM, &Device::Cpu).unwrap(),
        );
        stats.insert(
            artifact::ACTION_STD_KEY.to_string(),
            Tensor::from_vec(std, ACTION_DIM, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&stats, dir.path().join(artifact::STATS_FILE)).unwrap();
    }
    dir
}

pub fn load_policy(dir: &Path) -> LoadedPolicy {
    load_policy_with(dir, pipeline_settings())
}

pub fn load_policy_with(dir: &Path, pipeline: PipelineSettings) -> LoadedPolicy {
    LoadedPolicy::load(dir, artifact::STATS_FILE, DevicePreference::Cpu, pipeline.pipeline())
        .unwrap()
}

pub fn backend_config(kind: BackendKind) -> BackendConfig {
    BackendConfig {
        kind,
        model_name: MODEL.to_string(),
        model_version: VERSION.to_string(),
        timeout_ms: 2_000,
        device: DevicePreference::Cpu,
        pipeline: pipeline_settings(),
        ..Default::default()
    }
}

pub fn local_config(dir: &Path) -> BackendConfig {
    BackendConfig {
        checkpoint_dir: Some(dir.to_path_buf()),
        ..backend_config(BackendKind::Local)
    }
}

pub fn rpc_config(addr: SocketAddr) -> BackendConfig {
    BackendConfig {
        endpoint: Some(addr.to_string()),
        ..backend_config(BackendKind::TensorRpc)
    }
}

pub fn gateway_config(addr: SocketAddr) -> BackendConfig {
    BackendConfig {
        endpoint: Some(format!("http://{}", addr)),
        ..backend_config(BackendKind::Gateway)
    }
}

/// Deterministic HWC u8 observation.
pub fn observation() -> Observation {
    let pixels: Vec<u8> = (0..HEIGHT * WIDTH * 3).map(|i| (i * 37 % 256) as u8).collect();
    let image = HostTensor::new(vec![HEIGHT, WIDTH, 3], pixels).unwrap();
    let state: Vec<f32> = (0..STATE_DIM).map(|i| 0.1 * i as f32 - 0.3).collect();
    Observation::new(state, image)
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub host: Arc<ServingHost>,
    pub handle: tokio::task::JoinHandle<()>,
}

/// Serve `policy` over Arrow Flight on an ephemeral port.
pub async fn start_flight_server(policy: LoadedPolicy, names: TensorNames) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let host = Arc::new(
        ServingHost::new(
            policy,
            HostOptions {
                workers: 2,
                model_name: MODEL.to_string(),
                model_version: VERSION.to_string(),
            },
        )
        .unwrap(),
    );
    let service = PolicyFlightService::new(Arc::clone(&host), names);

    let handle = tokio::spawn(async move {
        if let Err(e) = Server::builder()
            .add_service(service.into_server())
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
        {
            eprintln!("Test server failed: {}", e);
        }
    });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer { addr, host, handle }
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub handle: tokio::task::JoinHandle<()>,
}

/// Run the JSON gateway in front of the tensor RPC server at `upstream`.
pub async fn start_gateway(upstream: SocketAddr) -> TestGateway {
    start_gateway_with(rpc_config(upstream)).await
}

/// Start a gateway whose upstream client uses `config`.
pub async fn start_gateway_with(config: BackendConfig) -> TestGateway {
    let upstream = config.endpoint.clone();
    let client = InferenceClient::connect(config).await.unwrap();
    let settings = GatewaySettings {
        host: "127.0.0.1".to_string(),
        port: 0,
        request_timeout_ms: 5_000,
        upstream,
        ..Default::default()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = GatewayState::new(client, settings);

    let handle = tokio::spawn(async move {
        if let Err(e) = server::serve(listener, state, std::future::pending()).await {
            eprintln!("Test gateway failed: {}", e);
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestGateway { addr, handle }
}

/// Wraps a model so that its first forward pass stalls.
pub struct SlowFirstCall {
    pub inner: LinearPolicy,
    pub delay: Duration,
    pub stalled: bool,
}

impl SlowFirstCall {
    pub fn load(dir: &Path, delay: Duration) -> Self {
        let checkpoint = Checkpoint::open(dir).unwrap();
        Self {
            inner: LinearPolicy::load(&checkpoint, &Device::Cpu).unwrap(),
            delay,
            stalled: false,
        }
    }
}

impl PolicyModel for SlowFirstCall {
    fn forward(&mut self, input: &EncodedTensor) -> policyserve_core::Result<HostTensor<f32>> {
        if !self.stalled {
            self.stalled = true;
            std::thread::sleep(self.delay);
        }
        self.inner.forward(input)
    }

    fn state_dim(&self) -> usize {
        self.inner.state_dim()
    }

    fn action_dim(&self) -> usize {
        self.inner.action_dim()
    }
}

pub fn assert_close(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len(), "length mismatch: {:?} vs {:?}", a, b);
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < 1e-4, "{:?} != {:?}", a, b);
    }
}
