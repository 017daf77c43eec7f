use half::f16;
use ndarray::{Array1, ArrayD, IxDyn};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A single numeric element as produced by a model, in whatever precision it was computed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    F16(f16),
    F32(f32),
    F64(f64),
    I64(i64),
}

impl Number {
    pub fn to_f64(self) -> f64 {
        match self {
            Number::F16(v) => v.to_f64(),
            Number::F32(v) => v as f64,
            Number::F64(v) => v,
            Number::I64(v) => v as f64,
        }
    }
}

/// Loosely typed model output.
///
/// Models are free to answer with a native numeric array, a nested sequence, or a bare
/// scalar. Resolving the shape against the number of inputs is the caller's job.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    Array(ArrayD<f32>),
    Sequence(Vec<RawOutput>),
    Scalar(Number),
}

impl RawOutput {
    /// Build an array output from a row-major buffer
    pub fn array(shape: &[usize], data: Vec<f32>) -> Result<Self, BackendError> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(RawOutput::Array)
            .map_err(|err| BackendError::Inference(format!("invalid array shape: {err}")))
    }

    /// Convert a JSON document into a raw output. Only numbers and arrays are accepted.
    pub fn from_json(value: Value) -> Result<Self, BackendError> {
        match value {
            Value::Number(n) => {
                let number = if let Some(i) = n.as_i64() {
                    Number::I64(i)
                } else if let Some(f) = n.as_f64() {
                    Number::F64(f)
                } else {
                    return Err(BackendError::Inference(format!(
                        "unsupported number `{n}` in model output"
                    )));
                };
                Ok(RawOutput::Scalar(number))
            }
            Value::Array(values) => values
                .into_iter()
                .map(RawOutput::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(RawOutput::Sequence),
            other => Err(BackendError::Inference(format!(
                "expected a number or an array in model output, got `{other}`"
            ))),
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, RawOutput::Scalar(_))
    }
}

impl From<Vec<f32>> for RawOutput {
    fn from(value: Vec<f32>) -> Self {
        RawOutput::Array(Array1::from_vec(value).into_dyn())
    }
}

impl From<Vec<Vec<f32>>> for RawOutput {
    fn from(value: Vec<Vec<f32>>) -> Self {
        RawOutput::Sequence(value.into_iter().map(RawOutput::from).collect())
    }
}

impl From<f32> for RawOutput {
    fn from(value: f32) -> Self {
        RawOutput::Scalar(Number::F32(value))
    }
}

impl From<f64> for RawOutput {
    fn from(value: f64) -> Self {
        RawOutput::Scalar(Number::F64(value))
    }
}

/// Maps an ordered batch of texts to one vector per text
pub trait Embedder {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn embed(&self, texts: Vec<String>) -> Result<RawOutput, BackendError>;
}

/// Maps an ordered batch of (query, document) pairs to one relevance score per pair
pub trait Reranker {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn score(&self, pairs: Vec<(String, String)>) -> Result<RawOutput, BackendError>;
}

impl<T: Embedder + ?Sized> Embedder for Arc<T> {
    fn health(&self) -> Result<(), BackendError> {
        Embedder::health(&**self)
    }

    fn embed(&self, texts: Vec<String>) -> Result<RawOutput, BackendError> {
        (**self).embed(texts)
    }
}

impl<T: Reranker + ?Sized> Reranker for Arc<T> {
    fn health(&self) -> Result<(), BackendError> {
        Reranker::health(&**self)
    }

    fn score(&self, pairs: Vec<(String, String)>) -> Result<RawOutput, BackendError> {
        (**self).score(pairs)
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BackendKind {
    Remote,
    Custom,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackendKind::Remote => write!(f, "remote"),
            BackendKind::Custom => write!(f, "custom"),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("Could not start backend: {0}")]
    Start(String),
    #[error("{0}")]
    Inference(String),
    #[error("Backend is unhealthy")]
    Unhealthy,
}
