use std::path::PathBuf;

use gridtrack_net::{Geometry, NetArgs};

use crate::toolkit::ConversionOptions;

pub const DEFAULT_WEIGHTS_PATH: &str = "GridTrackNet/model_weights.gtnw";
pub const DEFAULT_OUTPUT_PATH: &str = "Models/GridTrackNet5.gtpackage";

/// What to do when output names cannot be repaired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NamingPolicy {
    /// Abort the export.
    #[default]
    Strict,
    /// Log a warning and write the package with whatever names it has.
    Lenient,
}

/// Everything an export run needs.
#[derive(Clone, Debug)]
pub struct ConvertConfig {
    pub net: NetArgs,
    pub weights_path: PathBuf,
    pub output_path: PathBuf,
    pub conversion: ConversionOptions,
    pub naming_policy: NamingPolicy,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            net: NetArgs::default(),
            weights_path: PathBuf::from(DEFAULT_WEIGHTS_PATH),
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            conversion: ConversionOptions::default(),
            naming_policy: NamingPolicy::default(),
        }
    }
}

impl ConvertConfig {
    pub fn geometry(&self) -> Geometry {
        self.net.geometry
    }
}
