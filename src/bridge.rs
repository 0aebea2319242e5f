//! Body/brain bridge between a robot's state stream and the inference client.
//!
//! The body publishes [`JointState`] and [`CameraFrame`] messages; the brain
//! answers every joint state with a [`TargetCommand`]. Messages travel as
//! [`BridgeMessage`] values so any transport that can carry JSON can host the
//! loop. The `policyserve bridge` command runs it over stdin/stdout.

use crate::client::InferenceClient;
use crate::constants::defaults;
use crate::error::{Error, Result};
use crate::normalize::Observation;
use crate::tensor::{element_count, HostTensor, ImageData};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Joint positions and velocities reported by the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointState {
    pub stamp: DateTime<Utc>,
    #[serde(default)]
    pub name: Vec<String>,
    pub position: Vec<f32>,
    #[serde(default)]
    pub velocity: Vec<f32>,
}

/// One camera frame, row-major HWC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraFrame {
    pub stamp: DateTime<Utc>,
    pub height: usize,
    pub width: usize,
    /// `rgb8` or `bgr8`
    pub encoding: String,
    pub data: Vec<u8>,
}

impl CameraFrame {
    /// Convert to an RGB `[H, W, 3]` image.
    pub fn to_image(&self) -> Result<ImageData> {
        let expected = element_count(&[self.height, self.width, 3])?;
        if self.data.len() != expected {
            return Err(Error::shape(format!(
                "camera frame {}x{} {} carries {} bytes, expected {}",
                self.height,
                self.width,
                self.encoding,
                self.data.len(),
                expected
            )));
        }

        let data = match self.encoding.as_str() {
            "rgb8" => self.data.clone(),
            "bgr8" => self
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            other => {
                return Err(Error::shape(format!(
                    "unsupported camera encoding '{}'",
                    other
                )))
            }
        };
        Ok(HostTensor::new(vec![self.height, self.width, 3], data)?.into())
    }
}

/// Joint targets sent back to the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetCommand {
    pub stamp: DateTime<Utc>,
    pub data: Vec<f32>,
}

/// Envelope for every message crossing the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    JointState(JointState),
    CameraFrame(CameraFrame),
    TargetCommand(TargetCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrainOptions {
    /// Substitute a black frame until the first camera frame arrives
    pub allow_blank_image: bool,
    /// Size of the substitute frame
    pub blank_hw: (usize, usize),
}

impl Default for BrainOptions {
    fn default() -> Self {
        Self {
            allow_blank_image: false,
            blank_hw: (defaults::IMAGE_HEIGHT, defaults::IMAGE_WIDTH),
        }
    }
}

/// Turns joint states into target commands using the most recent camera frame.
pub struct BrainNode {
    client: InferenceClient,
    options: BrainOptions,
    latest_frame: Option<ImageData>,
}

impl BrainNode {
    pub fn new(client: InferenceClient, options: BrainOptions) -> Self {
        Self {
            client,
            options,
            latest_frame: None,
        }
    }

    pub fn has_frame(&self) -> bool {
        self.latest_frame.is_some()
    }

    /// Replace the cached frame. A malformed frame is rejected and the
    /// previous one kept.
    pub fn on_camera_frame(&mut self, frame: &CameraFrame) -> Result<()> {
        let image = frame.to_image()?;
        debug!(height = frame.height, width = frame.width, "Camera frame cached");
        self.latest_frame = Some(image);
        Ok(())
    }

    fn current_image(&self) -> Result<ImageData> {
        match (&self.latest_frame, self.options.allow_blank_image) {
            (Some(frame), _) => Ok(frame.clone()),
            (None, true) => {
                let (h, w) = self.options.blank_hw;
                Ok(HostTensor::<u8>::zeros(vec![h, w, 3]).into())
            }
            (None, false) => Err(Error::shape(
                "no camera frame received yet and blank images are disabled",
            )),
        }
    }

    /// Run one control step.
    pub async fn on_joint_state(&self, state: &JointState) -> Result<TargetCommand> {
        let image = self.current_image()?;
        let observation = Observation::new(state.position.clone(), image);
        let action = self.client.predict(&observation).await?;
        Ok(TargetCommand {
            stamp: Utc::now(),
            data: action.into_vec(),
        })
    }

    /// Dispatch one incoming message; only joint states produce a reply.
    pub async fn handle(&mut self, message: BridgeMessage) -> Result<Option<TargetCommand>> {
        match message {
            BridgeMessage::CameraFrame(frame) => {
                self.on_camera_frame(&frame)?;
                Ok(None)
            }
            BridgeMessage::JointState(state) => self.on_joint_state(&state).await.map(Some),
            BridgeMessage::TargetCommand(_) => {
                warn!("Ignoring target command sent to the brain");
                Ok(None)
            }
        }
    }

    pub async fn close(self) -> Result<()> {
        self.client.close().await
    }
}
