//! Configuration management for policyserve.
//!
//! Settings are layered from, lowest to highest precedence:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/policyserve/config.toml`)
//! 3. User-specified configuration file (`--config`)
//! 4. Environment variables prefixed with `POLICYSERVE_`, nested keys joined
//!    with `__` (e.g. `POLICYSERVE_BACKEND__TIMEOUT_MS=2000`)
//! 5. Command-line arguments, each of which can also be read from its own
//!    environment variable (`INFERENCE_MODE`, `CHECKPOINT_DIR`, `MODEL_NAME`, ...)
//!
//! Configuration is resolved once at startup and validated before any backend
//! is constructed.

use crate::constants::{artifact, defaults};
use crate::error::{Error, Result};
use crate::model::DevicePreference;
use crate::normalize::NormalizationPipeline;
use crate::wire::TensorNames;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Command-line overrides shared by every subcommand.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long, global = true, env = "POLICYSERVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Backend kind (local, tensor_rpc, gateway)
    #[arg(long = "mode", global = true, env = "INFERENCE_MODE")]
    pub kind: Option<String>,

    /// Tensor RPC or gateway endpoint
    #[arg(long, global = true, env = "INFERENCE_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Checkpoint directory for the local backend and the serving host
    #[arg(long, global = true, env = "CHECKPOINT_DIR")]
    pub checkpoint: Option<PathBuf>,

    #[arg(long, global = true, env = "MODEL_NAME")]
    pub model_name: Option<String>,

    #[arg(long, global = true, env = "MODEL_VERSION")]
    pub model_version: Option<String>,

    /// Per-call timeout in milliseconds
    #[arg(long, global = true, env = "INFERENCE_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Compute device (auto, cpu, cuda, metal)
    #[arg(long, global = true, env = "INFERENCE_DEVICE")]
    pub device: Option<String>,
}

/// Closed set of backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Model loaded in the calling process
    #[default]
    Local,
    /// Remote serving host over Arrow Flight
    TensorRpc,
    /// JSON/REST gateway fronting a serving host
    Gateway,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::TensorRpc => "tensor_rpc",
            BackendKind::Gateway => "gateway",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "tensor_rpc" | "rpc" | "flight" | "triton" => Ok(BackendKind::TensorRpc),
            "gateway" | "json_gateway" | "http" => Ok(BackendKind::Gateway),
            other => Err(Error::Config(format!(
                "unknown backend kind '{}', expected local, tensor_rpc or gateway",
                other
            ))),
        }
    }
}

impl Serialize for BackendKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BackendKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Observation geometry shared by clients and the serving host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub state_dim: usize,
    /// Expected frame height; unset accepts any size
    pub image_height: Option<usize>,
    pub image_width: Option<usize>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            state_dim: defaults::STATE_DIM,
            image_height: Some(defaults::IMAGE_HEIGHT),
            image_width: Some(defaults::IMAGE_WIDTH),
        }
    }
}

impl PipelineSettings {
    pub fn image_hw(&self) -> Option<(usize, usize)> {
        self.image_height.zip(self.image_width)
    }

    pub fn pipeline(&self) -> NormalizationPipeline {
        NormalizationPipeline::new(self.state_dim, self.image_hw())
    }
}

/// Everything needed to construct exactly one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// `host:port` or URL of the tensor RPC server or gateway
    pub endpoint: Option<String>,
    pub checkpoint_dir: Option<PathBuf>,
    pub model_name: String,
    pub model_version: String,
    pub timeout_ms: u64,
    pub device: DevicePreference,
    pub stats_file: String,
    pub tensor_names: TensorNames,
    /// PEM CA used to verify a TLS tensor RPC server
    pub tls_ca: Option<PathBuf>,
    /// Filled from the `[pipeline]` section
    #[serde(skip)]
    pub pipeline: PipelineSettings,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            endpoint: None,
            checkpoint_dir: None,
            model_name: defaults::MODEL_NAME.to_string(),
            model_version: defaults::MODEL_VERSION.to_string(),
            timeout_ms: defaults::TIMEOUT_MS,
            device: DevicePreference::default(),
            stats_file: artifact::STATS_FILE.to_string(),
            tensor_names: TensorNames::default(),
            tls_ca: None,
            pipeline: PipelineSettings::default(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn pipeline(&self) -> NormalizationPipeline {
        self.pipeline.pipeline()
    }

    /// Check everything the selected variant needs, without touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(Error::Config("model_name must not be empty".into()));
        }
        if self.model_version.trim().is_empty() {
            return Err(Error::Config("model_version must not be empty".into()));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config("timeout_ms must be greater than zero".into()));
        }
        if self.pipeline.state_dim == 0 {
            return Err(Error::Config("state_dim must be greater than zero".into()));
        }
        if self.pipeline.image_height.is_some() != self.pipeline.image_width.is_some() {
            return Err(Error::Config(
                "image_height and image_width must be set together".into(),
            ));
        }
        self.tensor_names.validate()?;

        match self.kind {
            BackendKind::Local if self.checkpoint_dir.is_none() => Err(Error::Config(
                "local backend requires checkpoint_dir".into(),
            )),
            BackendKind::TensorRpc | BackendKind::Gateway
                if self.endpoint.as_deref().map_or(true, |e| e.trim().is_empty()) =>
            {
                Err(Error::Config(format!("{} backend requires an endpoint", self.kind)))
            }
            _ => Ok(()),
        }
    }
}

/// Serving host settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Pre/post-processing workers; 0 uses one per CPU
    pub workers: usize,
    pub model_name: String,
    pub model_version: String,
    pub checkpoint_dir: Option<PathBuf>,
    pub device: DevicePreference,
    pub stats_file: String,
    /// PEM certificate and key; TLS is enabled when both are set
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: defaults::RPC_PORT,
            workers: 0,
            model_name: defaults::MODEL_NAME.to_string(),
            model_version: defaults::MODEL_VERSION.to_string(),
            checkpoint_dir: None,
            device: DevicePreference::default(),
            stats_file: artifact::STATS_FILE.to_string(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerSettings {
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid server address: {}", e)))
    }

    pub fn workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

/// JSON gateway settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    pub request_timeout_ms: u64,
    /// Largest accepted `/predict` body
    pub max_body_bytes: usize,
    /// Tensor RPC server the gateway forwards to; falls back to `backend.endpoint`
    pub upstream: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: defaults::GATEWAY_PORT,
            request_timeout_ms: 10_000,
            max_body_bytes: defaults::GATEWAY_MAX_BODY_BYTES,
            upstream: None,
        }
    }
}

impl GatewaySettings {
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid gateway address: {}", e)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendConfig,
    pub pipeline: PipelineSettings,
    pub server: ServerSettings,
    pub gateway: GatewaySettings,
}

impl Settings {
    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/policyserve/config.toml").required(false));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("POLICYSERVE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply_args(args)?;
        settings.backend.pipeline = settings.pipeline.clone();
        Ok(settings)
    }

    fn apply_args(&mut self, args: &ConfigArgs) -> Result<()> {
        if let Some(kind) = &args.kind {
            self.backend.kind = kind.parse()?;
        }
        if let Some(endpoint) = &args.endpoint {
            self.backend.endpoint = Some(endpoint.clone());
        }
        if let Some(checkpoint) = &args.checkpoint {
            self.backend.checkpoint_dir = Some(checkpoint.clone());
            self.server.checkpoint_dir = Some(checkpoint.clone());
        }
        if let Some(name) = &args.model_name {
            self.backend.model_name = name.clone();
            self.server.model_name = name.clone();
        }
        if let Some(version) = &args.model_version {
            self.backend.model_version = version.clone();
            self.server.model_version = version.clone();
        }
        if let Some(timeout) = args.timeout_ms {
            self.backend.timeout_ms = timeout;
        }
        if let Some(device) = &args.device {
            let device: DevicePreference = device.parse()?;
            self.backend.device = device;
            self.server.device = device;
        }
        Ok(())
    }

    /// Backend the gateway uses to reach its tensor RPC upstream.
    pub fn gateway_upstream(&self) -> Result<BackendConfig> {
        let endpoint = self
            .gateway
            .upstream
            .clone()
            .or_else(|| self.backend.endpoint.clone())
            .ok_or_else(|| Error::Config("gateway requires an upstream endpoint".into()))?;
        let config = BackendConfig {
            kind: BackendKind::TensorRpc,
            endpoint: Some(endpoint),
            ..self.backend.clone()
        };
        config.validate()?;
        Ok(config)
    }

    /// Resolved settings as pretty JSON, printed by `policyserve config`.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let settings = Settings::load(&ConfigArgs::default()).unwrap();
        assert_eq!(settings.backend.kind, BackendKind::Local);
        assert_eq!(settings.backend.timeout(), Duration::from_millis(5000));
        assert_eq!(settings.backend.tensor_names, TensorNames::default());
        assert_eq!(settings.pipeline.image_hw(), Some((480, 640)));
        assert_eq!(settings.backend.pipeline, settings.pipeline);
        assert_eq!(settings.server.port, defaults::RPC_PORT);
        assert!(settings.backend.validate().is_ok());
    }

    #[test]
    fn test_file_and_cli_layering() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[backend]\nkind = \"tensor_rpc\"\nendpoint = \"10.0.0.5:8001\"\ntimeout_ms = 250\n\n[backend.tensor_names]\nstate = \"observation.state\"\nimage = \"observation.images.top_cam\"\n"
        )
        .unwrap();

        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            timeout_ms: Some(750),
            ..Default::default()
        };
        let settings = Settings::load(&args).unwrap();
        assert_eq!(settings.backend.kind, BackendKind::TensorRpc);
        assert_eq!(settings.backend.endpoint.as_deref(), Some("10.0.0.5:8001"));
        assert_eq!(settings.backend.timeout_ms, 750);
        assert_eq!(settings.backend.tensor_names.image, "observation.images.top_cam");
        assert_eq!(settings.backend.tensor_names.action, "action");
    }

    #[test]
    fn test_unknown_kind_is_config_error() {
        let args = ConfigArgs {
            kind: Some("onnx".into()),
            ..Default::default()
        };
        assert!(matches!(Settings::load(&args), Err(Error::Config(_))));

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[backend]\nkind = \"magic\"").unwrap();
        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(Settings::load(&args).is_err());
    }

    #[test]
    fn test_validate_requires_kind_specific_fields() {
        let rpc = BackendConfig {
            kind: BackendKind::TensorRpc,
            ..Default::default()
        };
        assert!(matches!(rpc.validate(), Err(Error::Config(_))));

        let zero_timeout = BackendConfig {
            checkpoint_dir: Some("ckpt".into()),
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(zero_timeout.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_gateway_upstream_forces_tensor_rpc() {
        let mut settings = Settings::default();
        settings.gateway.upstream = Some("127.0.0.1:9000".into());
        let upstream = settings.gateway_upstream().unwrap();
        assert_eq!(upstream.kind, BackendKind::TensorRpc);
        assert_eq!(upstream.endpoint.as_deref(), Some("127.0.0.1:9000"));
    }
}
