//! Gateway state

use crate::client::InferenceClient;
use crate::config::GatewaySettings;
use std::sync::Arc;

/// Shared gateway state
#[derive(Clone)]
pub struct GatewayState {
    /// Client bound to the upstream tensor RPC backend
    pub client: Arc<InferenceClient>,

    pub settings: Arc<GatewaySettings>,
}

impl GatewayState {
    pub fn new(client: InferenceClient, settings: GatewaySettings) -> Self {
        Self {
            client: Arc::new(client),
            settings: Arc::new(settings),
        }
    }
}
