pub mod infer;
pub mod normalize;

use inference_adapter_backend::BackendError;
use thiserror::Error;
use tokio::sync::TryAcquireError;

pub use normalize::ShapeError;

#[derive(Error, Debug)]
pub enum InferError {
    #[error("Model is overloaded")]
    Overloaded(#[from] TryAcquireError),
    /// Collaborator failures keep their own message
    #[error("{0}")]
    Backend(#[from] BackendError),
    #[error("{0}")]
    Shape(#[from] ShapeError),
}
