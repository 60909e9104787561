use gridtrack_net::NetError;
use thiserror::Error;

use crate::graph::GraphError;
use crate::package::PackageError;
use crate::toolkit::ToolkitError;

/// Fatal export failures. Soft naming failures are reported through
/// [`crate::resolver::Resolution`] instead.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("layout wrapper: {0}")]
    Graph(#[from] GraphError),
    #[error("conversion failed: {0}")]
    Conversion(#[from] ToolkitError),
    #[error("expected {expected} outputs, converted package has {}: {actual:?}", .actual.len())]
    OutputCount { expected: usize, actual: Vec<String> },
    #[error("cannot rebuild package: weight storage location unknown")]
    MissingWeightStorage,
    #[error("output names {actual:?} do not match {expected:?}")]
    UnresolvedOutputNames {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("package error: {0}")]
    Package(#[from] PackageError),
}

pub type Result<T> = std::result::Result<T, ConvertError>;
