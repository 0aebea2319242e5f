//! Backends that turn an observation into an action.
//!
//! All variants share one contract: construction proves the backend usable,
//! `predict` blocks until an action or a typed error, and `close` tears the
//! backend down. Calls after `close` fail with [`Error::Cancelled`].

mod factory;
mod flight;
mod gateway;
mod local;

pub use factory::BackendFactory;
pub use flight::FlightBackend;
pub use gateway::GatewayBackend;
pub use local::LocalBackend;

use crate::error::{Error, Result};
use crate::normalize::{Action, Observation};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Short variant name used in logs.
    fn name(&self) -> &'static str;

    async fn predict(&self, observation: &Observation) -> Result<Action>;

    /// Re-run the liveness and readiness check.
    async fn health(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceBackend").field("name", &self.name()).finish()
    }
}

/// Open/closed flag shared by every backend.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    closed: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn ensure_open(&self, backend: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled(format!("{} backend is closed", backend)));
        }
        Ok(())
    }

    /// Returns false when already closed.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}
