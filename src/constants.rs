//! Shared constants for policyserve
//!
//! Centralizes normalization constants, artifact file names and protocol
//! names so the client and server paths can never drift apart.

/// Image normalization applied after scaling pixels to [0, 1]
pub mod imagenet {
    /// Per-channel mean [R, G, B]
    pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];

    /// Per-channel standard deviation [R, G, B]
    pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

    /// Scale applied to integer pixels before normalization
    pub const PIXEL_SCALE: f32 = 255.0;
}

/// Checkpoint artifact layout produced by training
pub mod artifact {
    /// Model weights file inside a checkpoint directory
    pub const WEIGHTS_FILE: &str = "model.safetensors";

    /// Normalization statistics written by the training preprocessor
    pub const STATS_FILE: &str = "policy_preprocessor_step_3_normalizer_processor.safetensors";

    /// Stats key holding the per-dimension action mean
    pub const ACTION_MEAN_KEY: &str = "action.mean";

    /// Stats key holding the per-dimension action std
    pub const ACTION_STD_KEY: &str = "action.std";

    /// Weight matrix of the linear policy head, shape [A, S + 3]
    pub const POLICY_WEIGHT_KEY: &str = "policy.weight";

    /// Bias of the linear policy head, shape [A]
    pub const POLICY_BIAS_KEY: &str = "policy.bias";
}

/// Names used on the tensor RPC wire
pub mod protocol {
    /// Default name of the state input tensor
    pub const STATE_TENSOR: &str = "state";

    /// Default name of the image input tensor
    pub const IMAGE_TENSOR: &str = "image";

    /// Default name of the action output tensor
    pub const ACTION_TENSOR: &str = "action";

    /// Suffix of the column carrying a tensor's shape
    pub const SHAPE_SUFFIX: &str = ":shape";

    /// Per-row outcome column in responses
    pub const STATUS_COLUMN: &str = "status";

    /// Per-row error message column in responses
    pub const ERROR_COLUMN: &str = "error";

    /// Flight action reporting host liveness
    pub const HEALTH_ACTION: &str = "health";

    /// Flight action describing the served model
    pub const METADATA_ACTION: &str = "model_metadata";
}

/// Deployment defaults
pub mod defaults {
    /// Joint-state dimensionality of the pick-and-place arm
    pub const STATE_DIM: usize = 8;

    /// Camera frame height
    pub const IMAGE_HEIGHT: usize = 480;

    /// Camera frame width
    pub const IMAGE_WIDTH: usize = 640;

    pub const MODEL_NAME: &str = "act_pick_place";
    pub const MODEL_VERSION: &str = "1";

    /// Per-call timeout for remote backends, in milliseconds
    pub const TIMEOUT_MS: u64 = 5_000;

    pub const RPC_PORT: u16 = 8001;
    pub const GATEWAY_PORT: u16 = 8080;

    /// Largest JSON body the gateway buffers. A 480x640 frame as nested
    /// integer arrays is a little over 4 MB.
    pub const GATEWAY_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

    /// Largest Flight message either side decodes.
    pub const RPC_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;
}
