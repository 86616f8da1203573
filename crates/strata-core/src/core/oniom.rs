use crate::core::models::calculation::CalcOutput;
use crate::core::models::ids::{AtomIndex, CalcId, CalcKey, LayerId};
use crate::core::models::layer::{EnergyDerivatives, Layer};
use crate::core::models::system::{ModelError, Molecule};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollectError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Calculation {calc} has no {quantity}")]
    MissingResult {
        calc: CalcId,
        quantity: &'static str,
    },

    #[error("Calculation {calc} returned a {quantity} of dimension {found}, expected {expected}")]
    DimensionMismatch {
        calc: CalcId,
        quantity: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Atom {atom} of layer {layer} refers to atom {partner}, which the parent layer lacks")]
    BrokenLink {
        layer: LayerId,
        atom: AtomIndex,
        partner: AtomIndex,
    },
}

/// Combines raw per-calculation outputs into ONIOM energies and derivatives.
pub trait ResultCollector: Send + Sync {
    /// Returns `molecule` with [`Layer::derivatives`] filled for every layer down to
    /// `max_depth` (all layers when `None`). Layers deeper than `max_depth` are ignored and
    /// keep their previous derivatives. Collecting an unchanged molecule twice yields the same
    /// result.
    fn collect(&self, molecule: &Molecule, max_depth: Option<usize>)
    -> Result<Molecule, CollectError>;
}

/// The additive, subtractive-scheme ONIOM combination.
///
/// For a layer `L` with included children `C`:
///
/// ```text
/// E(L) = E_original(L) + Σ_C [ E(C) − E_inherited(C) ]
/// ```
///
/// Gradients and Hessians of a child are projected onto the parent's coordinates through the
/// link-atom Jacobian `J`: real atoms map one-to-one, a link atom contributes `(1 − g)` to
/// the atom it is bonded to and `g` to the atom it caps, and dummy atoms do not contribute.
/// A combined gradient (Hessian) is only produced when every contributing calculation
/// provides one.
#[derive(Debug, Clone, Copy, Default)]
pub struct OniomCollector;

impl ResultCollector for OniomCollector {
    fn collect(
        &self,
        molecule: &Molecule,
        max_depth: Option<usize>,
    ) -> Result<Molecule, CollectError> {
        let mut collected = molecule.clone();
        collect_layer(collected.root_mut(), &LayerId::root(), max_depth)?;
        Ok(collected)
    }
}

fn collect_layer(
    layer: &mut Layer,
    id: &LayerId,
    max_depth: Option<usize>,
) -> Result<(), CollectError> {
    let include_children = max_depth.is_none_or(|max| id.depth() < max);
    if include_children {
        for (idx, child) in layer.children.iter_mut().enumerate() {
            collect_layer(child, &id.child(idx), max_depth)?;
        }
    }

    let dim = 3 * layer.atoms.len();
    let original_id = CalcId::original(id.clone());
    let original = output(layer, &original_id)?;

    let mut energy = original
        .energy
        .ok_or_else(|| missing(&original_id, "energy"))?;
    let mut gradient = checked_gradient(original, &original_id, dim)?;
    let mut hessian = checked_hessian(original, &original_id, dim)?;

    if include_children {
        for (idx, child) in layer.children.iter().enumerate() {
            let child_id = id.child(idx);
            let inherited_id = CalcId::inherited(child_id.clone());
            let inherited = output(child, &inherited_id)?;
            let child_dim = 3 * child.atoms.len();

            let child_energy = child
                .derivatives
                .energy
                .ok_or_else(|| missing(&CalcId::original(child_id.clone()), "energy"))?;
            let inherited_energy = inherited
                .energy
                .ok_or_else(|| missing(&inherited_id, "energy"))?;
            energy += child_energy - inherited_energy;

            let jacobian = LinkJacobian::between(layer, child, &child_id)?;

            gradient = match (
                gradient,
                &child.derivatives.gradient,
                checked_gradient(inherited, &inherited_id, child_dim)?,
            ) {
                (Some(mut g), Some(child_g), Some(inherited_g)) => {
                    jacobian.add_gradient(&mut g, &(child_g - inherited_g));
                    Some(g)
                }
                _ => None,
            };

            hessian = match (
                hessian,
                &child.derivatives.hessian,
                checked_hessian(inherited, &inherited_id, child_dim)?,
            ) {
                (Some(mut h), Some(child_h), Some(inherited_h)) => {
                    jacobian.add_hessian(&mut h, &(child_h - inherited_h));
                    Some(h)
                }
                _ => None,
            };
        }
    }

    trace!(layer = %id, energy, "Collected layer");
    layer.derivatives = EnergyDerivatives {
        energy: Some(energy),
        gradient,
        hessian,
    };
    Ok(())
}

fn output<'a>(layer: &'a Layer, id: &CalcId) -> Result<&'a CalcOutput, CollectError> {
    layer
        .calculations
        .get(&id.key)
        .map(|context| &context.output)
        .ok_or_else(|| ModelError::CalculationNotFound { calc: id.clone() }.into())
}

fn missing(calc: &CalcId, quantity: &'static str) -> CollectError {
    CollectError::MissingResult {
        calc: calc.clone(),
        quantity,
    }
}

fn checked_gradient(
    output: &CalcOutput,
    calc: &CalcId,
    dim: usize,
) -> Result<Option<DVector<f64>>, CollectError> {
    match &output.gradient {
        Some(g) if g.len() != dim => Err(CollectError::DimensionMismatch {
            calc: calc.clone(),
            quantity: "gradient",
            expected: dim,
            found: g.len(),
        }),
        other => Ok(other.clone()),
    }
}

fn checked_hessian(
    output: &CalcOutput,
    calc: &CalcId,
    dim: usize,
) -> Result<Option<DMatrix<f64>>, CollectError> {
    match &output.hessian {
        Some(h) if h.nrows() != dim || h.ncols() != dim => Err(CollectError::DimensionMismatch {
            calc: calc.clone(),
            quantity: "hessian",
            expected: dim,
            found: h.nrows().max(h.ncols()),
        }),
        other => Ok(other.clone()),
    }
}

/// Sparse Jacobian of child coordinates with respect to parent coordinates.
///
/// Each entry `(child_slot, parent_slot, weight)` stands for the 3×3 block `weight · I`.
#[derive(Debug, Clone, PartialEq, Default)]
struct LinkJacobian {
    entries: Vec<(usize, usize, f64)>,
}

impl LinkJacobian {
    fn between(parent: &Layer, child: &Layer, child_id: &LayerId) -> Result<Self, CollectError> {
        let parent_slot = |atom: AtomIndex, partner: AtomIndex| {
            parent
                .atom_slot(partner)
                .ok_or_else(|| CollectError::BrokenLink {
                    layer: child_id.clone(),
                    atom,
                    partner,
                })
        };

        let mut entries = Vec::with_capacity(child.atoms.len() + child.link_atoms().len());
        for (child_slot, (&index, atom)) in child.atoms.iter().enumerate() {
            if atom.is_dummy {
                continue;
            }
            match atom.link {
                None => entries.push((child_slot, parent_slot(index, index)?, 1.0)),
                Some(link) => {
                    let g = link.g_factor;
                    entries.push((child_slot, parent_slot(index, link.bonded_to)?, 1.0 - g));
                    entries.push((child_slot, parent_slot(index, link.capped)?, g));
                }
            }
        }
        Ok(Self { entries })
    }

    /// `parent += Jᵀ · child`
    fn add_gradient(&self, parent: &mut DVector<f64>, child: &DVector<f64>) {
        for &(c, p, w) in &self.entries {
            for k in 0..3 {
                parent[3 * p + k] += w * child[3 * c + k];
            }
        }
    }

    /// `parent += Jᵀ · child · J`
    fn add_hessian(&self, parent: &mut DMatrix<f64>, child: &DMatrix<f64>) {
        for &(ci, pi, wi) in &self.entries {
            for &(cj, pj, wj) in &self.entries {
                let w = wi * wj;
                for k in 0..3 {
                    for l in 0..3 {
                        parent[(3 * pi + k, 3 * pj + l)] += w * child[(3 * ci + k, 3 * cj + l)];
                    }
                }
            }
        }
    }
}
