mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{small_args, small_geometry, CountingRenamer, PoolingCore, StubToolkit};
use gridtrack_convert::package::{FeatureType, MANIFEST_FILE, MODEL_FILE, WEIGHTS_DIR, WEIGHT_FILE};
use gridtrack_convert::{
    export_core, run, ConvertConfig, ConvertError, DirectRenamer, NamingPolicy, NativeToolkit, Package,
    Resolution, OUTPUT_NAMES,
};
use gridtrack_net::{GridTrackNet, NetArgs, NetError};
use tempfile::tempdir;

fn config_in(dir: &Path) -> ConvertConfig {
    ConvertConfig {
        net: small_args(),
        weights_path: dir.join("GridTrackNet").join("model_weights.gtnw"),
        output_path: dir.join("Models").join("GridTrackNet5.gtpackage"),
        ..ConvertConfig::default()
    }
}

fn write_weights(config: &ConvertConfig) {
    fs::create_dir_all(config.weights_path.parent().unwrap()).unwrap();
    GridTrackNet::new(config.net.clone())
        .unwrap()
        .save_weights(&config.weights_path)
        .unwrap();
}

#[test]
fn test_export_writes_described_package() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    write_weights(&config);

    let report = run(&config, &NativeToolkit::new(), &DirectRenamer).unwrap();
    assert_eq!(report.output_names, OUTPUT_NAMES.to_vec());
    assert_eq!(report.resolution, Resolution::AlreadyResolved);
    assert_eq!(report.path, config.output_path);

    let out = &config.output_path;
    assert!(out.join(MANIFEST_FILE).is_file());
    assert!(out.join(MODEL_FILE).is_file());
    assert!(out.join(WEIGHTS_DIR).join(WEIGHT_FILE).is_file());

    let package = Package::open(out).unwrap();
    let desc = package.description();
    assert_eq!(
        desc.short_description,
        "GridTrackNet (5 frames). Outputs conf/x_off/y_off grids per frame."
    );
    assert_eq!(package.input_names(), vec!["f1", "f2", "f3", "f4", "f5"]);
    assert_eq!(
        desc.inputs[0].short_description,
        "RGB frame 1 of 5 (size must be 48x32 (WxH); pre-resize on iOS)."
    );
    assert_eq!(desc.outputs[0].short_description, "Confidence grids; shape (5, 3, 2).");
    for output in &desc.outputs {
        assert!(matches!(&output.ty, FeatureType::MultiArray { shape, .. } if shape == &vec![5, 3, 2]));
    }
    assert!(package.spec().program.ops.iter().any(|op| op.name == "core/head"));
}

#[test]
fn test_missing_weights_leaves_no_output() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());

    let err = run(&config, &NativeToolkit::new(), &DirectRenamer).unwrap_err();
    assert!(matches!(err, ConvertError::Net(NetError::WeightsNotFound(ref p)) if p == &config.weights_path));
    assert!(err.to_string().contains("model_weights.gtnw"));
    assert!(!dir.path().join("Models").exists());
}

#[test]
fn test_repeated_exports_are_identical() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    write_weights(&config);
    let second = ConvertConfig {
        output_path: dir.path().join("again.gtpackage"),
        ..config.clone()
    };

    run(&config, &NativeToolkit::new(), &DirectRenamer).unwrap();
    run(&second, &NativeToolkit::new(), &DirectRenamer).unwrap();
    // writing over an existing package replaces it
    run(&config, &NativeToolkit::new(), &DirectRenamer).unwrap();

    for file in [MODEL_FILE.to_string(), format!("{WEIGHTS_DIR}/{WEIGHT_FILE}")] {
        let a = fs::read(config.output_path.join(&file)).unwrap();
        let b = fs::read(second.output_path.join(&file)).unwrap();
        assert_eq!(a, b, "{file} differs");
    }
}

#[test]
fn test_strict_policy_rejects_unresolved_names() {
    let dir = tempdir().unwrap();
    let config = ConvertConfig {
        net: NetArgs::with_geometry(small_geometry()),
        ..config_in(dir.path())
    };
    let core = Arc::new(PoolingCore::new(small_geometry()));
    let toolkit = StubToolkit::new(&["Identity", "Identity_1", "Identity_2"], true);

    let err = export_core(&config, core, &toolkit, &CountingRenamer::failing(true, true)).unwrap_err();
    assert!(matches!(err, ConvertError::UnresolvedOutputNames { .. }));
    assert!(!config.output_path.exists());
}

#[test]
fn test_lenient_policy_writes_with_warning() {
    let dir = tempdir().unwrap();
    let config = ConvertConfig {
        net: NetArgs::with_geometry(small_geometry()),
        naming_policy: NamingPolicy::Lenient,
        ..config_in(dir.path())
    };
    let core = Arc::new(PoolingCore::new(small_geometry()));
    let toolkit = StubToolkit::new(&["Identity", "Identity_1", "Identity_2"], true);

    let report = export_core(&config, core, &toolkit, &CountingRenamer::failing(true, true)).unwrap();
    assert!(!report.resolution.is_resolved());
    assert_eq!(report.output_names, vec!["Identity", "Identity_1", "Identity_2"]);

    let package = Package::open(&config.output_path).unwrap();
    assert_eq!(
        package.description().outputs[1].short_description,
        "X offsets in grid cell units; shape (5, 3, 2)."
    );
}

#[test]
fn test_toolkit_names_repaired_before_write() {
    let dir = tempdir().unwrap();
    let config = ConvertConfig {
        net: NetArgs::with_geometry(small_geometry()),
        ..config_in(dir.path())
    };
    let core = Arc::new(PoolingCore::new(small_geometry()));
    let toolkit = StubToolkit::new(&["Identity", "Identity_1", "Identity_2"], true);

    let report = export_core(&config, core, &toolkit, &DirectRenamer).unwrap();
    assert_eq!(report.resolution, Resolution::RenamedInPlace);
    let package = Package::open(&config.output_path).unwrap();
    assert_eq!(package.output_names(), OUTPUT_NAMES.to_vec());
}
