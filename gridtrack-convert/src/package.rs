//! Self-describing deployment package.
//!
//! On disk a package is a directory:
//!
//! ```text
//! <name>/Manifest.json
//! <name>/Data/model.json          serialized `PackageSpec`
//! <name>/Data/weights/weight.bin  parameters referenced by offset
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;

pub const MANIFEST_FILE: &str = "Manifest.json";
pub const MODEL_FILE: &str = "Data/model.json";
pub const WEIGHTS_DIR: &str = "Data/weights";
pub const WEIGHT_FILE: &str = "weight.bin";
pub const SPEC_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown feature: {0}")]
    UnknownFeature(String),
    #[error("feature name already in use: {0}")]
    NameTaken(String),
    #[error("package has no weight storage")]
    MissingWeights,
    #[error("weight file not found: {}", .0.display())]
    MissingWeightFile(PathBuf),
    #[error("weight file {} holds {actual} bytes, program needs {required}", .path.display())]
    TruncatedWeights {
        path: PathBuf,
        required: u64,
        actual: u64,
    },
}

/// Numeric format of stored weights and declared outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Float16,
    Float32,
}

impl Precision {
    pub fn byte_width(self) -> usize {
        match self {
            Precision::Float16 => 2,
            Precision::Float32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentTarget {
    Ios15,
    Ios16,
    Ios17,
}

impl fmt::Display for DeploymentTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DeploymentTarget::Ios15 => "iOS15",
            DeploymentTarget::Ios16 => "iOS16",
            DeploymentTarget::Ios17 => "iOS17",
        };
        f.write_str(s)
    }
}

/// Accelerators the runtime may schedule the model on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeUnits {
    All,
    CpuOnly,
    CpuAndGpu,
    CpuAndNeuralEngine,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorLayout {
    Rgb,
    Bgr,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureType {
    /// Channel-last image; the runtime applies `pixel * scale + bias`.
    Image {
        height: usize,
        width: usize,
        color_layout: ColorLayout,
        scale: f32,
        bias: [f32; 3],
    },
    MultiArray {
        shape: Vec<usize>,
        dtype: Precision,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureDescription {
    pub name: String,
    #[serde(default)]
    pub short_description: String,
    #[serde(rename = "type")]
    pub ty: FeatureType,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub name: String,
    #[serde(default)]
    pub short_description: String,
    pub inputs: Vec<FeatureDescription>,
    pub outputs: Vec<FeatureDescription>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Parameter stored in `weight.bin` at `offset`, in the package precision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamRef {
    pub name: String,
    pub shape: Vec<usize>,
    pub offset: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgramOp {
    pub name: String,
    pub op: String,
    pub inputs: Vec<String>,
    pub output: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub ops: Vec<ProgramOp>,
}

/// Structural descriptor of a package: everything except the weight bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub spec_version: u32,
    pub description: ModelDescription,
    pub precision: Precision,
    pub minimum_deployment_target: DeploymentTarget,
    pub compute_units: ComputeUnits,
    pub program: Program,
}

impl PackageSpec {
    pub fn input_names(&self) -> Vec<String> {
        self.description.inputs.iter().map(|f| f.name.clone()).collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.description.outputs.iter().map(|f| f.name.clone()).collect()
    }

    /// Rename an input or output feature and every program reference to it.
    pub fn rename_feature(&mut self, old: &str, new: &str) -> Result<(), PackageError> {
        if old == new {
            return Ok(());
        }
        let desc = &mut self.description;
        let taken = desc.inputs.iter().chain(&desc.outputs).any(|f| f.name == new)
            || self.program.ops.iter().any(|op| op.output == new);
        if taken {
            return Err(PackageError::NameTaken(new.to_string()));
        }
        let feature = desc
            .inputs
            .iter_mut()
            .chain(desc.outputs.iter_mut())
            .find(|f| f.name == old)
            .ok_or_else(|| PackageError::UnknownFeature(old.to_string()))?;
        feature.name = new.to_string();

        for op in &mut self.program.ops {
            if op.output == old {
                op.output = new.to_string();
            }
            for input in op.inputs.iter_mut().filter(|i| i.as_str() == old) {
                *input = new.to_string();
            }
        }
        Ok(())
    }

    /// Bytes of `weight.bin` the program refers to.
    pub fn required_weight_bytes(&self) -> u64 {
        let width = self.precision.byte_width() as u64;
        self.program
            .ops
            .iter()
            .flat_map(|op| &op.params)
            .map(|p| p.offset + p.shape.iter().product::<usize>() as u64 * width)
            .max()
            .unwrap_or(0)
    }
}

/// Directory holding `weight.bin`, kept alive while any package uses it.
#[derive(Clone, Debug)]
pub struct WeightStore {
    dir: PathBuf,
    _staging: Option<Arc<TempDir>>,
}

impl WeightStore {
    /// Take ownership of a staging directory; it is removed once unused.
    pub fn staged(dir: TempDir) -> Self {
        Self {
            dir: dir.path().to_path_buf(),
            _staging: Some(Arc::new(dir)),
        }
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            _staging: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn weight_file(&self) -> PathBuf {
        self.dir.join(WEIGHT_FILE)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    file_format_version: String,
    root_model: String,
    weights: String,
    author: String,
}

/// A converted model: descriptor plus weight storage.
#[derive(Clone, Debug)]
pub struct Package {
    spec: PackageSpec,
    weights: Option<WeightStore>,
}

impl Package {
    pub fn new(spec: PackageSpec, weights: Option<WeightStore>) -> Self {
        Self { spec, weights }
    }

    /// Rebuild a package from a descriptor and existing weight storage.
    pub fn with_weights(spec: PackageSpec, store: WeightStore) -> Result<Self, PackageError> {
        let file = store.weight_file();
        if !file.exists() {
            return Err(PackageError::MissingWeightFile(file));
        }
        let actual = fs::metadata(&file)?.len();
        let required = spec.required_weight_bytes();
        if actual < required {
            return Err(PackageError::TruncatedWeights {
                path: file,
                required,
                actual,
            });
        }
        Ok(Self {
            spec,
            weights: Some(store),
        })
    }

    /// Read a package previously written by [`Package::save`].
    pub fn open(path: &Path) -> Result<Self, PackageError> {
        let manifest: Manifest = serde_json::from_slice(&fs::read(path.join(MANIFEST_FILE))?)?;
        let spec: PackageSpec = serde_json::from_slice(&fs::read(path.join(&manifest.root_model))?)?;
        Self::with_weights(spec, WeightStore::at(path.join(&manifest.weights)))
    }

    pub fn spec(&self) -> &PackageSpec {
        &self.spec
    }

    pub fn description(&self) -> &ModelDescription {
        &self.spec.description
    }

    pub fn weight_store(&self) -> Option<&WeightStore> {
        self.weights.as_ref()
    }

    pub fn input_names(&self) -> Vec<String> {
        self.spec.input_names()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.spec.output_names()
    }

    pub fn rename_feature(&mut self, old: &str, new: &str) -> Result<(), PackageError> {
        self.spec.rename_feature(old, new)
    }

    pub fn set_short_description(&mut self, text: impl Into<String>) {
        self.spec.description.short_description = text.into();
    }

    pub fn set_input_description(&mut self, name: &str, text: impl Into<String>) -> Result<(), PackageError> {
        let feature = self
            .spec
            .description
            .inputs
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| PackageError::UnknownFeature(name.to_string()))?;
        feature.short_description = text.into();
        Ok(())
    }

    pub fn set_output_description(&mut self, name: &str, text: impl Into<String>) -> Result<(), PackageError> {
        let feature = self
            .spec
            .description
            .outputs
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| PackageError::UnknownFeature(name.to_string()))?;
        feature.short_description = text.into();
        Ok(())
    }

    /// Write the package to `path`, replacing whatever is there.
    ///
    /// The package is assembled in a sibling directory and moved into place
    /// once complete, so a failed write leaves any previous package intact.
    pub fn save(&self, path: &Path) -> Result<(), PackageError> {
        let store = self.weights.as_ref().ok_or(PackageError::MissingWeights)?;
        let source = store.weight_file();
        if !source.exists() {
            return Err(PackageError::MissingWeightFile(source));
        }
        // read first: the store may live inside the directory being replaced
        let weight_bytes = fs::read(&source)?;

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let staging = tempfile::Builder::new().prefix(".gtpackage-").tempdir_in(parent)?;
        let weights_dir = staging.path().join(WEIGHTS_DIR);
        fs::create_dir_all(&weights_dir)?;

        let manifest = Manifest {
            file_format_version: "1.0.0".into(),
            root_model: MODEL_FILE.into(),
            weights: WEIGHTS_DIR.into(),
            author: concat!("gridtrack-convert ", env!("CARGO_PKG_VERSION")).into(),
        };
        fs::write(staging.path().join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)?;
        fs::write(staging.path().join(MODEL_FILE), serde_json::to_vec_pretty(&self.spec)?)?;
        fs::write(weights_dir.join(WEIGHT_FILE), weight_bytes)?;

        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
            Ok(_) => fs::remove_file(path)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::rename(staging.path(), path)?;
        Ok(())
    }
}
