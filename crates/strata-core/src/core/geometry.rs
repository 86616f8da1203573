use crate::core::models::ids::AtomIndex;
use crate::core::models::system::Molecule;
use crate::core::units::{ANGSTROM_TO_BOHR, BOHR_TO_ANGSTROM};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Convergence thresholds in atomic units (Hartree, Bohr).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConvergenceThresholds {
    pub rms_force: f64,
    pub max_force: f64,
    pub rms_displacement: f64,
    pub max_displacement: f64,
    pub energy_change: f64,
}

impl Default for ConvergenceThresholds {
    fn default() -> Self {
        Self {
            rms_force: 3.0e-4,
            max_force: 4.5e-4,
            rms_displacement: 1.2e-3,
            max_displacement: 1.8e-3,
            energy_change: 5.0e-6,
        }
    }
}

/// Convergence measures of one optimisation step over a subset of atoms.
///
/// Criteria that cannot be evaluated (no gradient or no energy on either snapshot) are `None`
/// and do not take part in [`GeomConv::converged`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GeomConv {
    pub rms_force: Option<f64>,
    pub max_force: Option<f64>,
    pub rms_displacement: Option<f64>,
    pub max_displacement: Option<f64>,
    pub energy_change: Option<f64>,
}

impl GeomConv {
    /// Compares two snapshots of the complete system over `atoms`.
    ///
    /// Displacements come from the root-layer positions, forces from the collected root
    /// gradient of `after` and the energy change from the collected root energies. Atoms
    /// missing from either snapshot are skipped.
    pub fn between(atoms: &BTreeSet<AtomIndex>, before: &Molecule, after: &Molecule) -> Self {
        let old = &before.root().atoms;
        let new = &after.root().atoms;

        let displacements: Vec<f64> = atoms
            .iter()
            .filter_map(|i| Some((old.get(i)?, new.get(i)?)))
            .flat_map(|(a, b)| {
                let d = (b.position - a.position) * ANGSTROM_TO_BOHR;
                [d.x, d.y, d.z]
            })
            .collect();

        let forces: Vec<f64> = match &after.root().derivatives.gradient {
            Some(gradient) => atoms
                .iter()
                .filter_map(|&i| after.root().atom_slot(i))
                .filter(|&slot| 3 * slot + 2 < gradient.len())
                .flat_map(|slot| {
                    (0..3).map(move |k| -gradient[3 * slot + k] * BOHR_TO_ANGSTROM)
                })
                .collect(),
            None => Vec::new(),
        };

        let energy_change = match (
            before.root().derivatives.energy,
            after.root().derivatives.energy,
        ) {
            (Some(e0), Some(e1)) => Some((e1 - e0).abs()),
            _ => None,
        };

        Self {
            rms_force: rms(&forces),
            max_force: max_abs(&forces),
            rms_displacement: rms(&displacements),
            max_displacement: max_abs(&displacements),
            energy_change,
        }
    }

    /// Returns `true` if at least one criterion was evaluated and every evaluated criterion
    /// is below its threshold.
    pub fn converged(&self, thresholds: &ConvergenceThresholds) -> bool {
        let checks = [
            (self.rms_force, thresholds.rms_force),
            (self.max_force, thresholds.max_force),
            (self.rms_displacement, thresholds.rms_displacement),
            (self.max_displacement, thresholds.max_displacement),
            (self.energy_change, thresholds.energy_change),
        ];
        let mut evaluated = checks.iter().filter_map(|(v, t)| v.map(|v| (v, *t))).peekable();
        evaluated.peek().is_some() && evaluated.all(|(value, threshold)| value < threshold)
    }
}

impl fmt::Display for GeomConv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{:.3e}", v));
        write!(
            f,
            "rms F {} | max F {} | rms dx {} | max dx {} | dE {}",
            show(self.rms_force),
            show(self.max_force),
            show(self.rms_displacement),
            show(self.max_displacement),
            show(self.energy_change)
        )
    }
}

fn rms(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some((values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt())
}

fn max_abs(values: &[f64]) -> Option<f64> {
    values.iter().map(|v| v.abs()).reduce(f64::max)
}
