//! Observation-to-action policy inference serving.
//!
//! This crate provides the core functionality for:
//! - Normalizing robot observations (joint state + camera image) into model-ready tensors
//! - Running a policy in-process, behind an Arrow Flight tensor server, or behind a JSON gateway
//! - Serving batches of independent inference requests with per-request failure isolation
//! - Bridging robot state messages to control commands

pub mod backend;
pub mod bridge;
pub mod cli;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod model;
pub mod normalize;
pub mod server;
pub mod service;
pub mod tensor;
pub mod wire;

pub use backend::{BackendFactory, InferenceBackend};
pub use client::{BlockingInferenceClient, InferenceClient};
pub use config::{BackendConfig, BackendKind, Settings};
pub use error::{Error, ErrorCategory, Result};
pub use normalize::{Action, EncodedTensor, NormalizationPipeline, NormalizationStats, Observation};
pub use service::{ServingHost, PolicyFlightService};
pub use tensor::{HostTensor, ImageData};
