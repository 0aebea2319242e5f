//! Batch request handling around one loaded policy.

use crate::constants::defaults;
use crate::error::{Error, Result};
use crate::model::LoadedPolicy;
use crate::normalize::{Action, EncodedTensor};
use crate::wire::RowStatus;
use rayon::prelude::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Lifecycle of a single request inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Preprocessing,
    ModelForward,
    Postprocessing,
    Responded,
    Errored,
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStage::Received => "received",
            RequestStage::Preprocessing => "preprocessing",
            RequestStage::ModelForward => "model_forward",
            RequestStage::Postprocessing => "postprocessing",
            RequestStage::Responded => "responded",
            RequestStage::Errored => "errored",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestErrorKind {
    InvalidInput,
    Inference,
    Cancelled,
}

impl RequestErrorKind {
    pub fn row_status(&self) -> RowStatus {
        match self {
            RequestErrorKind::InvalidInput => RowStatus::Rejected,
            RequestErrorKind::Inference => RowStatus::Failed,
            RequestErrorKind::Cancelled => RowStatus::Cancelled,
        }
    }
}

/// Failure of one request. Sibling requests are unaffected.
#[derive(Debug, Clone, Error)]
#[error("request {index} failed during {stage}: {message}")]
pub struct RequestError {
    pub index: usize,
    /// Last stage the request reached before failing
    pub stage: RequestStage,
    pub kind: RequestErrorKind,
    pub message: String,
}

impl RequestError {
    fn new(index: usize, stage: RequestStage, err: Error) -> Self {
        let kind = match &err {
            Error::Shape(_) => RequestErrorKind::InvalidInput,
            Error::Cancelled(_) => RequestErrorKind::Cancelled,
            _ => RequestErrorKind::Inference,
        };
        let message = match err {
            Error::Shape(msg) | Error::Cancelled(msg) | Error::Inference(msg) => msg,
            other => other.to_string(),
        };
        Self {
            index,
            stage,
            kind,
            message,
        }
    }

    /// Convert back into the library error a caller would see.
    pub fn into_error(self) -> Error {
        match self.kind {
            RequestErrorKind::InvalidInput => Error::Shape(self.message),
            RequestErrorKind::Inference => Error::Inference(self.message),
            RequestErrorKind::Cancelled => Error::Cancelled(self.message),
        }
    }
}

/// One request as received off the wire. A row that could not even be
/// decoded is carried as its decode error so it still gets a response slot.
#[derive(Debug)]
pub struct InferenceRequest {
    input: Result<EncodedTensor>,
}

impl InferenceRequest {
    pub fn new(input: EncodedTensor) -> Self {
        Self { input: Ok(input) }
    }

    pub fn malformed(err: Error) -> Self {
        Self { input: Err(err) }
    }
}

impl From<EncodedTensor> for InferenceRequest {
    fn from(input: EncodedTensor) -> Self {
        Self::new(input)
    }
}

impl From<Result<EncodedTensor>> for InferenceRequest {
    fn from(input: Result<EncodedTensor>) -> Self {
        Self { input }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResponse {
    pub action: Action,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Size of the pre/post-processing pool
    pub workers: usize,
    pub model_name: String,
    pub model_version: String,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            model_name: defaults::MODEL_NAME.to_string(),
            model_version: defaults::MODEL_VERSION.to_string(),
        }
    }
}

/// Owns a loaded policy and answers batches of independent requests.
///
/// Requests fan out over a bounded worker pool; the forward pass itself is
/// serialized by the policy's model lock.
pub struct ServingHost {
    policy: LoadedPolicy,
    options: HostOptions,
    pool: rayon::ThreadPool,
    draining: AtomicBool,
}

impl fmt::Debug for ServingHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServingHost")
            .field("policy", &self.policy)
            .field("options", &self.options)
            .field("draining", &self.draining.load(Ordering::SeqCst))
            .finish()
    }
}

impl ServingHost {
    pub fn new(policy: LoadedPolicy, options: HostOptions) -> Result<Self> {
        let workers = options.workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("policy-worker-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build worker pool: {}", e)))?;

        info!(
            model = %options.model_name,
            version = %options.model_version,
            workers,
            device = policy.device(),
            "Serving host ready"
        );

        Ok(Self {
            policy,
            options,
            pool,
            draining: AtomicBool::new(false),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.options.model_name
    }

    pub fn model_version(&self) -> &str {
        &self.options.model_version
    }

    pub fn policy(&self) -> &LoadedPolicy {
        &self.policy
    }

    pub fn serves(&self, name: &str, version: &str) -> bool {
        name == self.options.model_name && version == self.options.model_version
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Accepting work with a model loaded.
    pub fn is_ready(&self) -> bool {
        !self.is_draining() && self.policy.is_loaded()
    }

    /// Answer every request in `requests`, in order, one outcome per request.
    pub fn process_batch(
        &self,
        requests: Vec<InferenceRequest>,
    ) -> Vec<std::result::Result<InferenceResponse, RequestError>> {
        let batch_size = requests.len();
        let start = Instant::now();
        let results: Vec<_> = self.pool.install(|| {
            requests
                .into_par_iter()
                .enumerate()
                .map(|(index, request)| self.process_one(index, request))
                .collect()
        });

        let failed = results.iter().filter(|r| r.is_err()).count();
        debug!(
            batch_size,
            failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch processed"
        );
        results
    }

    fn process_one(
        &self,
        index: usize,
        request: InferenceRequest,
    ) -> std::result::Result<InferenceResponse, RequestError> {
        let start = Instant::now();
        let fail = |stage: RequestStage, err: Error| {
            let err = RequestError::new(index, stage, err);
            warn!(index, stage = %stage, kind = ?err.kind, error = %err.message, "Request failed");
            err
        };
        let advance = |stage: RequestStage| debug!(index, stage = %stage, "Request stage");

        advance(RequestStage::Received);
        if self.is_draining() {
            return Err(fail(
                RequestStage::Received,
                Error::Cancelled("host is shutting down".into()),
            ));
        }
        let input = request.input.map_err(|e| fail(RequestStage::Received, e))?;

        advance(RequestStage::Preprocessing);
        self.policy
            .validate(&input)
            .map_err(|e| fail(RequestStage::Preprocessing, e))?;
        if self.is_draining() {
            return Err(fail(
                RequestStage::Preprocessing,
                Error::Cancelled("host is shutting down".into()),
            ));
        }

        advance(RequestStage::ModelForward);
        let raw = self
            .policy
            .forward(&input)
            .map_err(|e| fail(RequestStage::ModelForward, e))?;

        advance(RequestStage::Postprocessing);
        let action = self
            .policy
            .postprocess(raw)
            .map_err(|e| fail(RequestStage::Postprocessing, e))?;

        advance(RequestStage::Responded);
        Ok(InferenceResponse {
            action,
            elapsed: start.elapsed(),
        })
    }

    /// Stop accepting work. Requests that have not reached the model yet are
    /// answered with `Cancelled`.
    pub fn shutdown(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            info!(model = %self.options.model_name, "Serving host draining");
        }
    }

    /// Drain, wait for the running forward pass, then release the model.
    pub fn finalize(&self) {
        self.shutdown();
        if self.policy.release() {
            info!(model = %self.options.model_name, "Model released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PolicyModel;
    use crate::normalize::NormalizationPipeline;
    use crate::tensor::HostTensor;

    /// Sums the state and echoes it as a two-dimensional action.
    struct SumPolicy;

    impl PolicyModel for SumPolicy {
        fn forward(&mut self, input: &EncodedTensor) -> Result<HostTensor<f32>> {
            let sum: f32 = input.state.data().iter().sum();
            HostTensor::new(vec![1, 2], vec![sum, -sum])
        }

        fn state_dim(&self) -> usize {
            2
        }

        fn action_dim(&self) -> usize {
            2
        }
    }

    fn host() -> ServingHost {
        let pipeline = NormalizationPipeline::new(2, Some((2, 2)));
        let policy = LoadedPolicy::new(Box::new(SumPolicy), None, pipeline, "cpu").unwrap();
        ServingHost::new(
            policy,
            HostOptions {
                workers: 2,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn request(v: f32) -> InferenceRequest {
        EncodedTensor {
            state: HostTensor::new(vec![1, 2], vec![v, v]).unwrap(),
            image: HostTensor::zeros(vec![1, 3, 2, 2]),
        }
        .into()
    }

    #[test]
    fn test_malformed_request_is_isolated() {
        let host = host();
        let mut batch: Vec<InferenceRequest> = (0..5).map(|i| request(i as f32)).collect();
        batch[2] = EncodedTensor {
            state: HostTensor::new(vec![1, 2], vec![0.0, 0.0]).unwrap(),
            image: HostTensor::zeros(vec![1, 3, 4, 4]),
        }
        .into();

        let results = host.process_batch(batch);
        assert_eq!(results.len(), 5);
        for (i, r) in results.iter().enumerate() {
            if i == 2 {
                let err = r.as_ref().unwrap_err();
                assert_eq!(err.index, 2);
                assert_eq!(err.stage, RequestStage::Preprocessing);
                assert_eq!(err.kind, RequestErrorKind::InvalidInput);
            } else {
                let action = &r.as_ref().unwrap().action;
                assert_eq!(&**action, &[2.0 * i as f32, -2.0 * i as f32]);
            }
        }
    }

    #[test]
    fn test_undecodable_row_errors_at_received() {
        let host = host();
        let results = host.process_batch(vec![
            InferenceRequest::malformed(Error::shape("image is missing")),
            request(1.0),
        ]);
        let err = results[0].as_ref().unwrap_err();
        assert_eq!(err.stage, RequestStage::Received);
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_shutdown_cancels_pending_requests() {
        let host = host();
        assert!(host.is_ready());
        host.shutdown();
        assert!(!host.is_ready());

        let results = host.process_batch(vec![request(1.0), request(2.0)]);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(e) if e.kind == RequestErrorKind::Cancelled)));
    }

    #[test]
    fn test_finalize_releases_model() {
        let host = host();
        host.finalize();
        assert!(!host.policy().is_loaded());
        host.finalize();
    }
}
