//! Shape resolution of loosely typed model output.
//!
//! Both functions are pure: they take whatever the collaborator returned plus the number
//! of inputs that were submitted, and either produce the strict per-input sequence the
//! wire format needs or explain why the output cannot be mapped back onto the inputs.

use inference_adapter_backend::RawOutput;
use ndarray::{ArrayD, Axis};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("embedder must return a list/list-of-lists")]
    NotASequence,
    #[error("Embedding count does not match input texts.")]
    CountMismatch,
    #[error("Embedding shape could not be resolved.")]
    Unresolved,
    #[error("embedding contains a non-finite value")]
    NonFinite,
    #[error("reranker must return one score per pair")]
    ScoreShape,
    #[error("Score count does not match input documents.")]
    ScoreCount,
    #[error("score is NaN or infinite")]
    NonFiniteScore,
}

/// Count mismatches are reported as such for batches; a single input whose output did
/// not resolve to exactly one vector is an unresolvable shape.
fn mismatch(expected: usize) -> ShapeError {
    if expected == 1 {
        ShapeError::Unresolved
    } else {
        ShapeError::CountMismatch
    }
}

/// Resolve embedder output into exactly `expected` vectors, in input order.
///
/// Checks, in order:
/// 1. a bare scalar is rejected
/// 2. a flat vector (1-D array or sequence of scalars) is one unwrapped vector, accepted
///    only for a single input
/// 3. anything else must already be one vector per input
pub fn normalize_vectors(raw: RawOutput, expected: usize) -> Result<Vec<Vec<f64>>, ShapeError> {
    let vectors = match raw {
        RawOutput::Scalar(_) => return Err(ShapeError::NotASequence),
        RawOutput::Array(array) => match array.ndim() {
            0 => return Err(ShapeError::NotASequence),
            1 => unwrapped(array_to_vec(&array), expected)?,
            2 => array
                .axis_iter(Axis(0))
                .map(|row| row.iter().map(|v| *v as f64).collect())
                .collect(),
            _ => return Err(ShapeError::Unresolved),
        },
        RawOutput::Sequence(items) => {
            if items.first().is_some_and(RawOutput::is_scalar) {
                unwrapped(scalars(items)?, expected)?
            } else {
                items
                    .into_iter()
                    .map(vector)
                    .collect::<Result<Vec<_>, _>>()?
            }
        }
    };

    if vectors.len() != expected {
        return Err(mismatch(expected));
    }
    if vectors.iter().flatten().any(|v| !v.is_finite()) {
        return Err(ShapeError::NonFinite);
    }
    Ok(vectors)
}

/// Resolve reranker output into exactly `expected` scores, in pair order
pub fn normalize_scores(raw: RawOutput, expected: usize) -> Result<Vec<f64>, ShapeError> {
    let scores = match raw {
        // A single pair is commonly answered with a bare score
        RawOutput::Scalar(n) => vec![n.to_f64()],
        RawOutput::Array(array) => match array.shape() {
            [] | [_] => array_to_vec(&array),
            // One logit per pair
            [_, 1] => array_to_vec(&array),
            _ => return Err(ShapeError::ScoreShape),
        },
        RawOutput::Sequence(items) => items
            .into_iter()
            .map(score)
            .collect::<Result<Vec<_>, _>>()?,
    };

    if scores.len() != expected {
        return Err(ShapeError::ScoreCount);
    }
    if scores.iter().any(|s| !s.is_finite()) {
        return Err(ShapeError::NonFiniteScore);
    }
    Ok(scores)
}

fn unwrapped(vector: Vec<f64>, expected: usize) -> Result<Vec<Vec<f64>>, ShapeError> {
    if expected == 1 {
        Ok(vec![vector])
    } else {
        Err(mismatch(expected))
    }
}

fn array_to_vec(array: &ArrayD<f32>) -> Vec<f64> {
    array.iter().map(|v| *v as f64).collect()
}

fn scalars(items: Vec<RawOutput>) -> Result<Vec<f64>, ShapeError> {
    items
        .into_iter()
        .map(|item| match item {
            RawOutput::Scalar(n) => Ok(n.to_f64()),
            _ => Err(ShapeError::Unresolved),
        })
        .collect()
}

fn vector(item: RawOutput) -> Result<Vec<f64>, ShapeError> {
    match item {
        RawOutput::Array(array) if array.ndim() == 1 => Ok(array_to_vec(&array)),
        RawOutput::Sequence(items) => scalars(items),
        _ => Err(ShapeError::Unresolved),
    }
}

fn score(item: RawOutput) -> Result<f64, ShapeError> {
    match item {
        RawOutput::Scalar(n) => Ok(n.to_f64()),
        RawOutput::Array(array) if array.len() == 1 && array.ndim() <= 1 => {
            Ok(array_to_vec(&array)[0])
        }
        RawOutput::Sequence(mut items) if items.len() == 1 => match items.remove(0) {
            RawOutput::Scalar(n) => Ok(n.to_f64()),
            _ => Err(ShapeError::ScoreShape),
        },
        _ => Err(ShapeError::ScoreShape),
    }
}
