use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("Missing weights file: {}", .0.display())]
    WeightsNotFound(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid weights file: {0}")]
    InvalidWeights(String),
    #[error("Tensor not found in weights file: {0}")]
    MissingTensor(String),
    #[error("Shape mismatch for {name}: expected {expected:?}, actual {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Invalid network arguments: {0}")]
    InvalidArgs(String),
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, NetError>;
