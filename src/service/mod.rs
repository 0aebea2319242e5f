//! Model-serving process: the batch host and its Arrow Flight endpoint.

pub mod flight;
pub mod host;

pub use flight::PolicyFlightService;
pub use host::{
    HostOptions, InferenceRequest, InferenceResponse, RequestError, RequestErrorKind,
    RequestStage, ServingHost,
};

use crate::error::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tracing::info;

/// PEM-encoded server identity.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// Run the Flight service until `shutdown` resolves, then drain and release the model.
pub async fn serve_with_shutdown<F>(
    service: PolicyFlightService,
    addr: SocketAddr,
    tls: Option<TlsIdentity>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let host = Arc::clone(service.host());
    let mut builder = Server::builder();
    if let Some(tls) = tls {
        let identity = Identity::from_pem(tls.cert, tls.key);
        builder = builder
            .tls_config(ServerTlsConfig::new().identity(identity))
            .map_err(|e| Error::Config(format!("Invalid TLS configuration: {}", e)))?;
    }

    info!(%addr, model = %host.model_name(), version = %host.model_version(), "Starting Flight server");
    let drain = Arc::clone(&host);
    builder
        .add_service(service.into_server())
        .serve_with_shutdown(addr, async move {
            shutdown.await;
            drain.shutdown();
        })
        .await
        .map_err(|e| Error::rpc("Flight server failed", e))?;

    host.finalize();
    info!("Flight server stopped");
    Ok(())
}
