use crate::{
    backend::FlightBackend,
    bridge::{BrainNode, BrainOptions, BridgeMessage},
    client::InferenceClient,
    config::{BackendKind, Settings},
    constants::defaults,
    model::LoadedPolicy,
    normalize::Observation,
    server::{self, routes::predict::parse_observation, GatewayState, PredictRequest, PredictResponse},
    service::{self, HostOptions, PolicyFlightService, ServingHost, TlsIdentity},
    tensor::HostTensor,
};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

use super::commands::{BridgeCommand, CheckCommand, GatewayCommand, PredictCommand, ServeCommand};

/// Resolves on Ctrl-C. If the handler cannot be installed the server runs
/// until killed.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal, draining"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await
        }
    }
}

fn listen_addr(listen: Option<&str>, fallback: crate::Result<SocketAddr>) -> Result<SocketAddr> {
    match listen {
        Some(addr) => addr.parse().context("Invalid listen address"),
        None => Ok(fallback?),
    }
}

pub async fn handle_serve(settings: Settings, cmd: ServeCommand) -> Result<()> {
    let mut server = settings.server.clone();
    if let Some(workers) = cmd.workers {
        server.workers = workers;
    }
    if cmd.tls_cert.is_some() {
        server.tls_cert = cmd.tls_cert.clone();
        server.tls_key = cmd.tls_key.clone();
    }
    let addr = listen_addr(cmd.listen.as_deref(), server.addr())?;

    let checkpoint = server
        .checkpoint_dir
        .clone()
        .context("server.checkpoint_dir is not set")?;
    let stats_file = server.stats_file.clone();
    let device = server.device;
    let pipeline = settings.pipeline.pipeline();
    let policy = tokio::task::spawn_blocking(move || {
        LoadedPolicy::load(&checkpoint, &stats_file, device, pipeline)
    })
    .await
    .context("Model loading task failed")?
    .context("Failed to load policy")?;

    let host = ServingHost::new(
        policy,
        HostOptions {
            workers: server.workers(),
            model_name: server.model_name.clone(),
            model_version: server.model_version.clone(),
        },
    )?;

    let tls = match (&server.tls_cert, &server.tls_key) {
        (Some(cert), Some(key)) => Some(TlsIdentity {
            cert: std::fs::read(cert).context("Failed to read TLS certificate")?,
            key: std::fs::read(key).context("Failed to read TLS key")?,
        }),
        (None, None) => None,
        _ => anyhow::bail!("TLS requires both a certificate and a key"),
    };

    let service = PolicyFlightService::new(Arc::new(host), settings.backend.tensor_names.clone());
    service::serve_with_shutdown(service, addr, tls, shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

pub async fn handle_gateway(mut settings: Settings, cmd: GatewayCommand) -> Result<()> {
    if let Some(upstream) = cmd.upstream {
        settings.gateway.upstream = Some(upstream);
    }
    let addr = listen_addr(cmd.listen.as_deref(), settings.gateway.addr())?;
    let upstream = settings.gateway_upstream()?;
    info!(
        upstream = upstream.endpoint.as_deref().unwrap_or_default(),
        "Connecting gateway upstream"
    );

    let client = InferenceClient::connect(upstream)
        .await
        .context("Failed to connect to tensor RPC upstream")?;
    let state = GatewayState::new(client, settings.gateway.clone());
    server::start_server(addr, state, shutdown_signal()).await
}

pub async fn handle_predict(settings: Settings, cmd: PredictCommand) -> Result<()> {
    let raw = tokio::fs::read_to_string(&cmd.observation)
        .await
        .with_context(|| format!("Failed to read {}", cmd.observation.display()))?;
    let body: PredictRequest = serde_json::from_str(&raw).context("Invalid observation file")?;
    let observation = parse_observation(&body)?;

    let client = InferenceClient::connect(settings.backend)
        .await
        .context("Failed to create backend")?;
    let start = Instant::now();
    let action = client.predict(&observation).await?;
    info!(latency_ms = start.elapsed().as_secs_f64() * 1000.0, "Prediction complete");

    let response = PredictResponse {
        action: action.into_vec(),
    };
    println!("{}", serde_json::to_string(&response)?);
    client.close().await?;
    Ok(())
}

pub async fn handle_check(settings: Settings, cmd: CheckCommand) -> Result<()> {
    let config = settings.backend.clone();
    println!(
        "Backend: {} (model {} version {})",
        config.kind, config.model_name, config.model_version
    );

    let start = Instant::now();
    let client = if config.kind == BackendKind::TensorRpc {
        let backend = FlightBackend::connect(&config)
            .await
            .context("Tensor RPC backend check failed")?;
        match backend.model_metadata().await {
            Ok(metadata) => println!("{}", serde_json::to_string_pretty(&metadata)?),
            Err(e) => warn!("Model metadata unavailable: {}", e),
        }
        InferenceClient::with_backend(Box::new(backend), config.clone())
    } else {
        InferenceClient::connect(config.clone())
            .await
            .context("Backend check failed")?
    };
    println!(
        "Backend ready in {:.1} ms",
        start.elapsed().as_secs_f64() * 1000.0
    );

    if cmd.dummy_inference {
        let pipeline = client.pipeline();
        let (h, w) = pipeline
            .image_hw()
            .unwrap_or((defaults::IMAGE_HEIGHT, defaults::IMAGE_WIDTH));
        let observation = Observation::new(
            vec![0.0; pipeline.state_dim()],
            HostTensor::<u8>::zeros(vec![h, w, 3]),
        );
        let start = Instant::now();
        let action = client
            .predict(&observation)
            .await
            .context("Dummy inference failed")?;
        println!(
            "Dummy inference: {} action values in {:.1} ms",
            action.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
    }

    client.close().await?;
    Ok(())
}

pub async fn handle_bridge(settings: Settings, cmd: BridgeCommand) -> Result<()> {
    let options = BrainOptions {
        allow_blank_image: cmd.allow_blank_image,
        blank_hw: settings
            .pipeline
            .image_hw()
            .unwrap_or((defaults::IMAGE_HEIGHT, defaults::IMAGE_WIDTH)),
    };
    let client = InferenceClient::connect(settings.backend)
        .await
        .context("Failed to create backend")?;
    let mut node = BrainNode::new(client, options);
    info!(allow_blank_image = options.allow_blank_image, "Brain node ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: BridgeMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Skipping malformed bridge message: {}", e);
                continue;
            }
        };
        match node.handle(message).await {
            Ok(Some(command)) => {
                let mut out = serde_json::to_vec(&BridgeMessage::TargetCommand(command))?;
                out.push(b'\n');
                stdout.write_all(&out).await?;
                stdout.flush().await?;
            }
            Ok(None) => {}
            Err(e) => warn!(kind = e.category().as_str(), "Control step failed: {}", e),
        }
    }

    info!("Input closed, stopping brain node");
    node.close().await?;
    Ok(())
}

pub fn handle_config(settings: &Settings) -> Result<()> {
    println!("{}", settings.to_json_pretty()?);
    Ok(())
}
