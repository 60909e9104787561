//! Export the multi-frame grid tracking network as a deployment package.
//!
//! The pipeline wraps the core network so it takes one RGB image per frame
//! and yields named `conf`, `x_off` and `y_off` grids, lowers the wrapper
//! through a [`toolkit::ConversionToolkit`], repairs output names the
//! toolkit did not keep, and writes the described package to disk.

pub mod config;
pub mod error;
pub mod graph;
pub mod metadata;
pub mod package;
pub mod pipeline;
pub mod resolver;
pub mod toolkit;

pub use config::{ConvertConfig, NamingPolicy, DEFAULT_OUTPUT_PATH, DEFAULT_WEIGHTS_PATH};
pub use error::{ConvertError, Result};
pub use graph::{input_name, wrap_core, Graph, GraphError, OUTPUT_NAMES};
pub use package::{Package, PackageError, PackageSpec, WeightStore};
pub use pipeline::{export_core, run, ExportReport};
pub use resolver::{resolve_output_names, DirectRenamer, FeatureRenamer, Resolution};
pub use toolkit::{frame_inputs, ConversionOptions, ConversionToolkit, ImageInputSpec, NativeToolkit, ToolkitError};
