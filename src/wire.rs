//! Arrow encoding of the tensor RPC contract.
//!
//! A request batch carries one row per independent request with four list
//! columns: the state and image values and their shapes. A response batch
//! carries exactly one row: the action values and shape, a status string and
//! an optional error message.

use crate::constants::protocol::{
    ACTION_TENSOR, ERROR_COLUMN, IMAGE_TENSOR, SHAPE_SUFFIX, STATE_TENSOR, STATUS_COLUMN,
};
use crate::error::{Error, Result};
use crate::normalize::EncodedTensor;
use crate::tensor::HostTensor;
use arrow::array::{Array, ArrayRef, Float32Array, ListArray, StringArray, UInt32Array};
use arrow::buffer::{NullBuffer, OffsetBuffer, ScalarBuffer};
use arrow::datatypes::{DataType, Field, FieldRef, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Names of the input and output tensors on the wire.
///
/// Deployments disagree on naming, so both ends take these from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorNames {
    pub state: String,
    pub image: String,
    pub action: String,
}

impl Default for TensorNames {
    fn default() -> Self {
        Self {
            state: STATE_TENSOR.to_string(),
            image: IMAGE_TENSOR.to_string(),
            action: ACTION_TENSOR.to_string(),
        }
    }
}

impl TensorNames {
    pub fn validate(&self) -> Result<()> {
        let names = [&self.state, &self.image, &self.action];
        if names.iter().any(|n| n.is_empty()) {
            return Err(Error::Config("tensor names must not be empty".into()));
        }
        if self.state == self.image || self.state == self.action || self.image == self.action {
            return Err(Error::Config(format!(
                "tensor names must be distinct, got state={} image={} action={}",
                self.state, self.image, self.action
            )));
        }
        Ok(())
    }
}

fn shape_column(name: &str) -> String {
    format!("{}{}", name, SHAPE_SUFFIX)
}

fn item(data_type: DataType) -> FieldRef {
    Arc::new(Field::new("item", data_type, false))
}

fn list_field(name: impl Into<String>, data_type: DataType, nullable: bool) -> Field {
    Field::new(name, DataType::List(item(data_type)), nullable)
}

/// Outcome of one request as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Ok,
    /// Input failed shape or layout checks
    Rejected,
    /// Model or postprocessing failed
    Failed,
    /// Host was shutting down
    Cancelled,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Ok => "ok",
            RowStatus::Rejected => "rejected",
            RowStatus::Failed => "failed",
            RowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RowStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ok" => Ok(RowStatus::Ok),
            "rejected" => Ok(RowStatus::Rejected),
            "failed" => Ok(RowStatus::Failed),
            "cancelled" => Ok(RowStatus::Cancelled),
            other => Err(Error::Serialization(format!("unknown row status '{}'", other))),
        }
    }
}

/// Declared input or output of the served model. `-1` marks a free dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub datatype: String,
    pub shape: Vec<i64>,
}

/// Answer to the `model_metadata` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    pub version: String,
    pub device: String,
    pub ready: bool,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl ModelMetadata {
    #[allow(clippy::too_many_arguments)]
    pub fn describe(
        names: &TensorNames,
        name: &str,
        version: &str,
        device: &str,
        ready: bool,
        state_dim: usize,
        image_hw: Option<(usize, usize)>,
        action_dim: usize,
    ) -> Self {
        let (h, w) = image_hw.map_or((-1, -1), |(h, w)| (h as i64, w as i64));
        let spec = |name: &str, shape: Vec<i64>| TensorSpec {
            name: name.to_string(),
            datatype: "FP32".to_string(),
            shape,
        };
        Self {
            name: name.to_string(),
            version: version.to_string(),
            device: device.to_string(),
            ready,
            inputs: vec![
                spec(&names.state, vec![1, state_dim as i64]),
                spec(&names.image, vec![1, 3, h, w]),
            ],
            outputs: vec![spec(&names.action, vec![1, action_dim as i64])],
        }
    }
}

pub fn request_schema(names: &TensorNames) -> SchemaRef {
    Arc::new(Schema::new(vec![
        list_field(&names.state, DataType::Float32, false),
        list_field(shape_column(&names.state), DataType::UInt32, false),
        list_field(&names.image, DataType::Float32, false),
        list_field(shape_column(&names.image), DataType::UInt32, false),
    ]))
}

pub fn response_schema(names: &TensorNames) -> SchemaRef {
    Arc::new(Schema::new(vec![
        list_field(&names.action, DataType::Float32, true),
        list_field(shape_column(&names.action), DataType::UInt32, true),
        Field::new(STATUS_COLUMN, DataType::Utf8, false),
        Field::new(ERROR_COLUMN, DataType::Utf8, true),
    ]))
}

fn shape_values(shape: &[usize]) -> Vec<u32> {
    shape.iter().map(|&d| d as u32).collect()
}

fn single_row_list(values: ArrayRef, len: usize, data_type: DataType) -> ListArray {
    let offsets = OffsetBuffer::new(ScalarBuffer::from(vec![0i32, len as i32]));
    ListArray::new(item(data_type), offsets, values, None)
}

fn multi_row_list(values: ArrayRef, lengths: &[usize], data_type: DataType) -> ListArray {
    let offsets = OffsetBuffer::from_lengths(lengths.iter().copied());
    ListArray::new(item(data_type), offsets, values, None)
}

/// Encode requests into one batch, one row per request.
pub fn encode_requests(names: &TensorNames, requests: Vec<EncodedTensor>) -> Result<RecordBatch> {
    let mut state_lens = Vec::with_capacity(requests.len());
    let mut image_lens = Vec::with_capacity(requests.len());
    let mut state_ranks = Vec::with_capacity(requests.len());
    let mut image_ranks = Vec::with_capacity(requests.len());
    let mut state_vals = Vec::new();
    let mut image_vals = Vec::new();
    let mut state_shapes = Vec::new();
    let mut image_shapes = Vec::new();

    for req in requests {
        state_shapes.extend(shape_values(req.state.shape()));
        image_shapes.extend(shape_values(req.image.shape()));
        state_ranks.push(req.state.rank());
        image_ranks.push(req.image.rank());
        state_lens.push(req.state.len());
        image_lens.push(req.image.len());
        state_vals.extend(req.state.into_data());
        image_vals.extend(req.image.into_data());
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(multi_row_list(
            Arc::new(Float32Array::new(ScalarBuffer::from(state_vals), None)),
            &state_lens,
            DataType::Float32,
        )),
        Arc::new(multi_row_list(
            Arc::new(UInt32Array::new(ScalarBuffer::from(state_shapes), None)),
            &state_ranks,
            DataType::UInt32,
        )),
        Arc::new(multi_row_list(
            Arc::new(Float32Array::new(ScalarBuffer::from(image_vals), None)),
            &image_lens,
            DataType::Float32,
        )),
        Arc::new(multi_row_list(
            Arc::new(UInt32Array::new(ScalarBuffer::from(image_shapes), None)),
            &image_ranks,
            DataType::UInt32,
        )),
    ];
    Ok(RecordBatch::try_new(request_schema(names), columns)?)
}

fn list_column_by_name<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ListArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<ListArray>())
        .ok_or_else(|| Error::shape(format!("missing list column '{}'", name)))
}

fn string_column_by_name<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::Serialization(format!("missing string column '{}'", name)))
}

fn row_tensor(values: &ListArray, shapes: &ListArray, row: usize, what: &str) -> Result<HostTensor<f32>> {
    if values.is_null(row) || shapes.is_null(row) {
        return Err(Error::shape(format!("{} is missing", what)));
    }
    let data = values.value(row);
    let data = data
        .as_any()
        .downcast_ref::<Float32Array>()
        .ok_or_else(|| Error::shape(format!("{} must be float32", what)))?;
    let shape = shapes.value(row);
    let shape = shape
        .as_any()
        .downcast_ref::<UInt32Array>()
        .ok_or_else(|| Error::shape(format!("{} shape must be uint32", what)))?;

    let shape = shape.values().iter().map(|&d| d as usize).collect();
    HostTensor::new(shape, data.values().to_vec())
        .map_err(|e| Error::shape(format!("{}: {}", what, e)))
}

/// Decode a request batch. Column problems fail the whole batch; a malformed
/// row only fails that row.
pub fn decode_requests(
    names: &TensorNames,
    batch: &RecordBatch,
) -> Result<Vec<Result<EncodedTensor>>> {
    let state = list_column_by_name(batch, &names.state)?;
    let state_shape = list_column_by_name(batch, &shape_column(&names.state))?;
    let image = list_column_by_name(batch, &names.image)?;
    let image_shape = list_column_by_name(batch, &shape_column(&names.image))?;

    Ok((0..batch.num_rows())
        .map(|row| {
            Ok(EncodedTensor {
                state: row_tensor(state, state_shape, row, &names.state)?,
                image: row_tensor(image, image_shape, row, &names.image)?,
            })
        })
        .collect())
}

/// Encode one successful response, handing `action` to Arrow without copying.
pub fn encode_action(names: &TensorNames, action: Vec<f32>) -> Result<RecordBatch> {
    let len = action.len();
    let values = Float32Array::new(ScalarBuffer::from(action), None);
    let shape = UInt32Array::new(ScalarBuffer::from(vec![1u32, len as u32]), None);

    let columns: Vec<ArrayRef> = vec![
        Arc::new(single_row_list(Arc::new(values), len, DataType::Float32)),
        Arc::new(single_row_list(Arc::new(shape), 2, DataType::UInt32)),
        Arc::new(StringArray::from(vec![RowStatus::Ok.as_str()])),
        Arc::new(StringArray::from(vec![None::<&str>])),
    ];
    Ok(RecordBatch::try_new(response_schema(names), columns)?)
}

/// Encode one failed response.
pub fn encode_failure(names: &TensorNames, status: RowStatus, message: &str) -> Result<RecordBatch> {
    let null_list = |data_type: DataType, values: ArrayRef| {
        ListArray::new(
            item(data_type),
            OffsetBuffer::new(ScalarBuffer::from(vec![0i32, 0])),
            values,
            Some(NullBuffer::new_null(1)),
        )
    };
    let columns: Vec<ArrayRef> = vec![
        Arc::new(null_list(
            DataType::Float32,
            Arc::new(Float32Array::new(ScalarBuffer::from(Vec::<f32>::new()), None)),
        )),
        Arc::new(null_list(
            DataType::UInt32,
            Arc::new(UInt32Array::new(ScalarBuffer::from(Vec::<u32>::new()), None)),
        )),
        Arc::new(StringArray::from(vec![status.as_str()])),
        Arc::new(StringArray::from(vec![Some(message)])),
    ];
    Ok(RecordBatch::try_new(response_schema(names), columns)?)
}

/// Decode a single-row response into the raw `[1, A]` action tensor.
pub fn decode_response(names: &TensorNames, batch: &RecordBatch) -> Result<HostTensor<f32>> {
    if batch.num_rows() != 1 {
        return Err(Error::Serialization(format!(
            "response batch has {} rows, expected 1",
            batch.num_rows()
        )));
    }
    let status: RowStatus = string_column_by_name(batch, STATUS_COLUMN)?.value(0).parse()?;
    let message = || {
        string_column_by_name(batch, ERROR_COLUMN)
            .ok()
            .filter(|c| !c.is_null(0))
            .map(|c| c.value(0).to_string())
            .unwrap_or_else(|| status.to_string())
    };

    match status {
        RowStatus::Ok => {
            let values = list_column_by_name(batch, &names.action)?;
            let shapes = list_column_by_name(batch, &shape_column(&names.action))?;
            row_tensor(values, shapes, 0, &names.action)
        }
        RowStatus::Rejected => Err(Error::Shape(message())),
        RowStatus::Failed => Err(Error::Inference(message())),
        RowStatus::Cancelled => Err(Error::Cancelled(message())),
    }
}
