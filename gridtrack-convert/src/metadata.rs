//! Human-readable descriptions and the final write of the package.

use std::fs;
use std::path::Path;

use gridtrack_net::{Geometry, HEADS};

use crate::graph::input_name;
use crate::package::{Package, PackageError};

pub fn short_description(geometry: &Geometry) -> String {
    format!(
        "GridTrackNet ({} frames). Outputs conf/x_off/y_off grids per frame.",
        geometry.frames
    )
}

pub fn input_description(frame: usize, geometry: &Geometry) -> String {
    format!(
        "RGB frame {frame} of {} (size must be {}x{} (WxH); pre-resize on iOS).",
        geometry.frames, geometry.width, geometry.height
    )
}

/// Descriptions for the outputs in head order.
pub fn output_descriptions(geometry: &Geometry) -> [String; HEADS] {
    let shape = format!(
        "shape ({}, {}, {}).",
        geometry.frames,
        geometry.grid_cols(),
        geometry.grid_rows()
    );
    [
        format!("Confidence grids; {shape}"),
        format!("X offsets in grid cell units; {shape}"),
        format!("Y offsets in grid cell units; {shape}"),
    ]
}

/// Attach descriptions. Outputs are matched by position, so this also works
/// on a package whose names could not be resolved.
pub fn describe(package: &mut Package, geometry: &Geometry) -> Result<(), PackageError> {
    package.set_short_description(short_description(geometry));
    for frame in 1..=geometry.frames {
        package.set_input_description(&input_name(frame), input_description(frame, geometry))?;
    }
    let outputs = package.output_names();
    for (name, text) in outputs.iter().zip(output_descriptions(geometry)) {
        package.set_output_description(name, text)?;
    }
    Ok(())
}

/// Create the parent directories of `path` and write the package there.
pub fn write(package: &Package, path: &Path) -> Result<(), PackageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    package.save(path)
}
