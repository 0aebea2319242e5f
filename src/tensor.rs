//! Host-side tensors exchanged between callers, the normalization pipeline and backends.
//!
//! Tensors are dense, row-major and own their buffer. Keeping ownership explicit
//! lets the serving path hand an output buffer to the transport without copying it.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of elements described by `shape`, or a shape error if it overflows.
pub fn element_count(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| Error::Shape(format!("shape {:?} is too large", shape)))
}

/// A dense row-major tensor that owns its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor<T = f32> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T> HostTensor<T> {
    /// Create a tensor, checking that the buffer length matches the shape.
    pub fn new(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(Error::Shape(format!(
                "shape {:?} needs {} elements, buffer holds {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Rank-1 tensor over `data`.
    pub fn vector(data: Vec<T>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Give up the buffer without copying it.
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    pub fn into_parts(self) -> (Vec<usize>, Vec<T>) {
        (self.shape, self.data)
    }

    /// Reinterpret the buffer under a new shape with the same element count.
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self> {
        Self::new(shape, self.data)
    }

    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> HostTensor<U> {
        HostTensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(f).collect(),
        }
    }
}

impl<T: Copy + Default> HostTensor<T> {
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![T::default(); len],
        }
    }
}

/// Camera image in whichever element type the caller holds.
///
/// The element type alone does not decide pixel range: float frames may carry
/// either [0, 1] or [0, 255] values, so scaling is decided by inspecting the data.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageData {
    /// Integer pixels in 0..=255
    U8(HostTensor<u8>),
    /// Float pixels in [0, 1] or [0, 255]
    F32(HostTensor<f32>),
}

impl ImageData {
    pub fn shape(&self) -> &[usize] {
        match self {
            ImageData::U8(t) => t.shape(),
            ImageData::F32(t) => t.shape(),
        }
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            ImageData::U8(_) => "uint8",
            ImageData::F32(_) => "float32",
        }
    }
}

impl<T: Copy + Into<Value>> HostTensor<T> {
    /// Nested JSON arrays following the tensor's shape.
    pub fn to_nested_json(&self) -> Value {
        nest(&self.shape, &self.data)
    }
}

fn nest<T: Copy + Into<Value>>(shape: &[usize], data: &[T]) -> Value {
    match shape.split_first() {
        None => data.first().map(|v| (*v).into()).unwrap_or(Value::Null),
        Some((_, [])) => Value::Array(data.iter().map(|v| (*v).into()).collect()),
        Some((&n, rest)) => {
            let stride: usize = rest.iter().product();
            Value::Array(
                (0..n)
                    .map(|i| nest(rest, &data[i * stride..(i + 1) * stride]))
                    .collect(),
            )
        }
    }
}

/// Shape of a nested JSON array, read along its first elements.
fn json_shape(value: &Value) -> Vec<usize> {
    let mut shape = Vec::new();
    let mut cur = value;
    while let Value::Array(items) = cur {
        shape.push(items.len());
        match items.first() {
            Some(first) => cur = first,
            None => break,
        }
    }
    shape
}

fn flatten_json(value: &Value, shape: &[usize], out: &mut Vec<f64>, ints: &mut bool) -> Result<()> {
    match (value, shape.split_first()) {
        (Value::Array(items), Some((&n, rest))) if items.len() == n => items
            .iter()
            .try_for_each(|item| flatten_json(item, rest, out, ints)),
        (Value::Number(num), None) => {
            *ints &= num.as_u64().map_or(false, |v| v <= u8::MAX as u64);
            out.push(num.as_f64().unwrap_or(f64::NAN));
            Ok(())
        }
        _ => Err(Error::shape("expected a rectangular array of numbers")),
    }
}

impl HostTensor<f32> {
    /// Parse nested JSON arrays of numbers into a float tensor.
    pub fn from_nested_json(value: &Value) -> Result<Self> {
        let shape = json_shape(value);
        let mut values = Vec::new();
        let mut ints = true;
        flatten_json(value, &shape, &mut values, &mut ints)?;
        HostTensor::new(shape, values.into_iter().map(|v| v as f32).collect())
    }
}

impl ImageData {
    /// Serialize the pixels as nested arrays in the layout they are held in.
    pub fn to_nested_json(&self) -> Value {
        match self {
            ImageData::U8(t) => t.to_nested_json(),
            ImageData::F32(t) => t.to_nested_json(),
        }
    }

    /// Parse nested JSON arrays. An array made only of integers in 0..=255 is
    /// read as `U8`, anything else as `F32`.
    pub fn from_nested_json(value: &Value) -> Result<Self> {
        let shape = json_shape(value);
        let mut values = Vec::new();
        let mut ints = true;
        flatten_json(value, &shape, &mut values, &mut ints)?;
        if values.is_empty() {
            return Err(Error::shape("image array is empty"));
        }

        if ints {
            let data = values.into_iter().map(|v| v as u8).collect();
            Ok(ImageData::U8(HostTensor::new(shape, data)?))
        } else {
            let data = values.into_iter().map(|v| v as f32).collect();
            Ok(ImageData::F32(HostTensor::new(shape, data)?))
        }
    }
}

impl From<HostTensor<u8>> for ImageData {
    fn from(t: HostTensor<u8>) -> Self {
        ImageData::U8(t)
    }
}

impl From<HostTensor<f32>> for ImageData {
    fn from(t: HostTensor<f32>) -> Self {
        ImageData::F32(t)
    }
}
