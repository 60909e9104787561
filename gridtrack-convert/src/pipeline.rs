//! End-to-end export: load, wrap, convert, resolve names, describe, write.

use std::path::PathBuf;
use std::sync::Arc;

use gridtrack_net::{CoreNetwork, GridTrackNet};
use tracing::{info, warn};

use crate::config::{ConvertConfig, NamingPolicy};
use crate::error::{ConvertError, Result};
use crate::graph::{wrap_core, OUTPUT_NAMES};
use crate::metadata;
use crate::resolver::{resolve_output_names, FeatureRenamer, Resolution};
use crate::toolkit::{frame_inputs, ConversionToolkit};

/// Outcome of a successful export.
#[derive(Clone, Debug)]
pub struct ExportReport {
    pub output_names: Vec<String>,
    pub path: PathBuf,
    pub resolution: Resolution,
}

/// Load the pretrained network named by `config` and export it.
///
/// Nothing is written when the weights file is missing.
pub fn run(config: &ConvertConfig, toolkit: &dyn ConversionToolkit, renamer: &dyn FeatureRenamer) -> Result<ExportReport> {
    let core = GridTrackNet::load(config.net.clone(), &config.weights_path)?;
    export_core(config, Arc::new(core), toolkit, renamer)
}

/// Export an already constructed core network.
pub fn export_core(
    config: &ConvertConfig,
    core: Arc<dyn CoreNetwork>,
    toolkit: &dyn ConversionToolkit,
    renamer: &dyn FeatureRenamer,
) -> Result<ExportReport> {
    let geometry = config.geometry();
    let graph = wrap_core(core, geometry)?;
    info!(graph = graph.name(), inputs = ?graph.input_names(), outputs = ?graph.output_names(), "wrapped core network");

    let inputs = frame_inputs(&geometry);
    let options = config.conversion;
    info!(
        toolkit = toolkit.name(),
        precision = ?options.precision,
        target = %options.minimum_deployment_target,
        "converting"
    );
    let mut package = toolkit.convert(&graph, &inputs, &options)?;

    let resolution = resolve_output_names(&mut package, &OUTPUT_NAMES, renamer)?;
    match (&resolution, config.naming_policy) {
        (Resolution::Unresolved { names, .. }, NamingPolicy::Strict) => {
            return Err(ConvertError::UnresolvedOutputNames {
                expected: OUTPUT_NAMES.iter().map(|s| s.to_string()).collect(),
                actual: names.clone(),
            });
        }
        (Resolution::Unresolved { names, .. }, NamingPolicy::Lenient) => {
            warn!(outputs = ?names, "writing package with unresolved output names");
        }
        (resolved, _) => info!(outcome = ?resolved, "output names resolved"),
    }

    metadata::describe(&mut package, &geometry)?;
    metadata::write(&package, &config.output_path)?;
    info!(path = %config.output_path.display(), "saved package");

    Ok(ExportReport {
        output_names: package.output_names(),
        path: config.output_path.clone(),
        resolution,
    })
}
