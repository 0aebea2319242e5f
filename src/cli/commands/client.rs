use clap::Args;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct PredictCommand {
    /// JSON file holding `{"state": [...], "image": nested array}`
    #[arg(long, value_name = "FILE")]
    pub observation: PathBuf,
}

#[derive(Debug, Args)]
pub struct CheckCommand {
    /// Also run one inference on a zero observation and report its latency
    #[arg(long)]
    pub dummy_inference: bool,
}

#[derive(Debug, Args)]
pub struct BridgeCommand {
    /// Use a black frame until the first camera frame arrives
    #[arg(long, env = "ALLOW_BLANK_IMAGE")]
    pub allow_blank_image: bool,
}
