use clap::Args;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct ServeCommand {
    /// Listen address in host:port format
    #[arg(long, value_name = "HOST:PORT")]
    pub listen: Option<String>,

    /// Pre/post-processing workers (0 = one per CPU)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Path to TLS certificate (PEM)
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM)
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct GatewayCommand {
    /// Listen address in host:port format
    #[arg(long, value_name = "HOST:PORT")]
    pub listen: Option<String>,

    /// Tensor RPC server to forward to
    #[arg(long, value_name = "HOST:PORT")]
    pub upstream: Option<String>,
}
