//! Repairs output names a toolkit did not preserve.
//!
//! Three strategies are tried in order: accept the names as they are, rename
//! on the live package, and rename on a copy of the descriptor before
//! rebuilding the package around the existing weight storage.

use tracing::{info, warn};

use crate::error::{ConvertError, Result};
use crate::package::{Package, PackageError, PackageSpec};

/// Rename operations used by the resolver.
pub trait FeatureRenamer {
    fn rename_in_package(&self, package: &mut Package, old: &str, new: &str) -> std::result::Result<(), PackageError>;
    fn rename_in_spec(&self, spec: &mut PackageSpec, old: &str, new: &str) -> std::result::Result<(), PackageError>;
}

/// Renames through the package's own API.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectRenamer;

impl FeatureRenamer for DirectRenamer {
    fn rename_in_package(&self, package: &mut Package, old: &str, new: &str) -> std::result::Result<(), PackageError> {
        package.rename_feature(old, new)
    }

    fn rename_in_spec(&self, spec: &mut PackageSpec, old: &str, new: &str) -> std::result::Result<(), PackageError> {
        spec.rename_feature(old, new)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    AlreadyResolved,
    RenamedInPlace,
    RebuiltFromSpec,
    /// Every strategy failed; `names` are the outputs the package still has.
    Unresolved { names: Vec<String>, warnings: Vec<String> },
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Resolution::Unresolved { .. })
    }
}

/// Make the package's outputs equal `expected`, in order.
///
/// A wrong output count or a missing weight store (needed to rebuild) is
/// fatal. Failing rename steps are logged and leave the package usable.
pub fn resolve_output_names(
    package: &mut Package,
    expected: &[&str],
    renamer: &dyn FeatureRenamer,
) -> Result<Resolution> {
    let names = package.output_names();
    if names.len() != expected.len() {
        return Err(ConvertError::OutputCount {
            expected: expected.len(),
            actual: names,
        });
    }
    if matches_expected(&names, expected) {
        return Ok(Resolution::AlreadyResolved);
    }
    info!(from = ?names, to = ?expected, "output names differ, renaming");

    let mut warnings = Vec::new();
    let in_place = apply_renames(&names, expected, |old, new| renamer.rename_in_package(package, old, new));
    match in_place {
        Ok(()) if matches_expected(&package.output_names(), expected) => return Ok(Resolution::RenamedInPlace),
        Ok(()) => warnings.push(note(format!(
            "in-place rename left outputs as {:?}",
            package.output_names()
        ))),
        Err(err) => warnings.push(note(format!("in-place rename failed: {err}"))),
    }

    let store = package.weight_store().cloned().ok_or(ConvertError::MissingWeightStorage)?;
    let mut spec = package.spec().clone();
    let names = spec.output_names();
    let on_spec = apply_renames(&names, expected, |old, new| renamer.rename_in_spec(&mut spec, old, new));
    match on_spec {
        Ok(()) => {
            *package = Package::with_weights(spec, store)?;
            if matches_expected(&package.output_names(), expected) {
                return Ok(Resolution::RebuiltFromSpec);
            }
            warnings.push(note(format!(
                "rebuilt package still has outputs {:?}",
                package.output_names()
            )));
        }
        Err(err) => warnings.push(note(format!("descriptor rename failed: {err}"))),
    }

    Ok(Resolution::Unresolved {
        names: package.output_names(),
        warnings,
    })
}

fn note(message: String) -> String {
    warn!("{message}");
    message
}

fn matches_expected(names: &[String], expected: &[&str]) -> bool {
    names.len() == expected.len() && names.iter().zip(expected).all(|(a, b)| a == b)
}

/// Renames needed to turn `current` into `expected`. When a target name is
/// still held by another output every mismatched output first moves to a
/// temporary name.
fn rename_plan(current: &[String], expected: &[&str]) -> Vec<(String, String)> {
    let pending: Vec<usize> = (0..current.len()).filter(|&i| current[i] != expected[i]).collect();
    let blocked = pending
        .iter()
        .any(|&i| current.iter().enumerate().any(|(j, name)| j != i && name == expected[i]));
    if !blocked {
        return pending
            .into_iter()
            .map(|i| (current[i].clone(), expected[i].to_string()))
            .collect();
    }
    let staged = |i: usize| format!("__resolve_{i}");
    let mut plan: Vec<(String, String)> = pending.iter().map(|&i| (current[i].clone(), staged(i))).collect();
    plan.extend(pending.iter().map(|&i| (staged(i), expected[i].to_string())));
    plan
}

fn apply_renames<F>(current: &[String], expected: &[&str], mut rename: F) -> std::result::Result<(), PackageError>
where
    F: FnMut(&str, &str) -> std::result::Result<(), PackageError>,
{
    for (old, new) in rename_plan(current, expected) {
        rename(&old, &new)?;
    }
    Ok(())
}
