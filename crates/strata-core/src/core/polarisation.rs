use crate::core::models::atom::Multipoles;
use crate::core::models::ids::{AtomIndex, CalcId, LayerId};
use crate::core::models::layer::Layer;
use crate::core::models::system::{ModelError, Molecule};
use nalgebra::Point3;
use std::collections::BTreeMap;

/// An embedding site: a position carrying (scaled) multipoles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointCharge {
    pub position: Point3<f64>,
    pub multipoles: Multipoles,
}

/// Embedding sites keyed by the index of the atom they stand for.
pub type PolarisationCloud = BTreeMap<AtomIndex, PointCharge>;

/// Builds the point-charge cloud seen by the layer `id`.
///
/// Every real atom of an ancestor layer that is not part of `id` contributes one site. When
/// an atom appears in several ancestors the deepest one wins, since its multipoles come from
/// the highest level of theory that saw it. Sites are scaled by `factors[s - 1]`, where `s`
/// is the bond separation from the nearest atom of the layer; sites further away than the
/// factor list, or not bonded to the layer at all, keep their full multipoles.
///
/// # Errors
///
/// Returns [`ModelError::LayerNotFound`] if `id` or one of its ancestors does not exist.
pub fn polarisation_cloud(
    molecule: &Molecule,
    id: &LayerId,
    factors: &[f64],
) -> Result<PolarisationCloud, ModelError> {
    let layer = molecule.layer(id)?;
    let mut cloud = PolarisationCloud::new();

    for ancestor_id in id.ancestors() {
        let ancestor = molecule.layer(&ancestor_id)?;
        for index in ancestor.real_atoms() {
            if layer.atoms.contains_key(&index) {
                continue;
            }
            let atom = &ancestor.atoms[&index];
            cloud.insert(
                index,
                PointCharge {
                    position: atom.position,
                    multipoles: atom.multipoles,
                },
            );
        }
    }

    let separations = molecule.root().bonds.separations_from(&layer.real_atoms());
    for (index, site) in cloud.iter_mut() {
        let factor = separations
            .get(index)
            .and_then(|&s| s.checked_sub(1))
            .and_then(|slot| factors.get(slot))
            .copied()
            .unwrap_or(1.0);
        site.multipoles = site.multipoles.scaled(factor);
    }

    Ok(cloud)
}

/// Returns the cloud that calculation `calc` must see, or `None` when its layer is computed
/// without electrostatic embedding. The root layer is never polarised.
///
/// # Errors
///
/// Returns a [`ModelError`] if the layer or the calculation does not exist.
pub fn polarisation_for(
    molecule: &Molecule,
    calc: &CalcId,
) -> Result<Option<PolarisationCloud>, ModelError> {
    let context = molecule.calculation(calc)?;
    if calc.layer.is_root() {
        return Ok(None);
    }
    match context.input.embedding.scaling_factors() {
        None => Ok(None),
        Some(factors) => polarisation_cloud(molecule, &calc.layer, factors).map(Some),
    }
}

/// Returns a copy of the layer of `calc` with its embedding applied.
///
/// # Errors
///
/// Returns a [`ModelError`] if the layer or the calculation does not exist.
pub fn polarise_layer(molecule: &Molecule, calc: &CalcId) -> Result<Layer, ModelError> {
    let mut layer = molecule.layer(&calc.layer)?.clone();
    if let Some(cloud) = polarisation_for(molecule, calc)? {
        layer.polarisation = cloud;
    }
    Ok(layer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::atom::Atom;
    use crate::core::models::builder::{LayerSpec, MoleculeBuilder};
    use crate::core::models::calculation::{CalcInput, Embedding};
    use crate::core::models::ids::CalcKey;
    use crate::core::models::system::ModelKind;

    fn charged(x: f64, q: f64) -> Atom {
        let mut atom = Atom::new("C", Point3::new(x, 0.0, 0.0));
        atom.multipoles = Multipoles::charge(q);
        atom
    }

    fn chain_molecule(embedding: Embedding) -> Molecule {
        let input = CalcInput {
            embedding,
            ..Default::default()
        };
        let mut builder = MoleculeBuilder::new(ModelKind::Oniom);
        builder
            .add_atom(0, charged(0.0, 0.3))
            .add_atom(1, charged(1.5, 0.5))
            .add_atom(2, charged(3.0, -1.0))
            .add_bond(0, 1)
            .add_bond(1, 2)
            .root_calculation(CalcKey::Original, input.clone());
        builder.add_layer(
            LayerSpec::new([0])
                .with_calculation(CalcKey::Original, input.clone())
                .with_calculation(CalcKey::Inherited, input),
        );
        builder.build().unwrap()
    }

    #[test]
    fn default_factors_scale_by_bond_separation() {
        let molecule = chain_molecule(Embedding::Electronic {
            scaling_factors: None,
        });
        let layer = polarise_layer(&molecule, &CalcId::original(LayerId::from(vec![0]))).unwrap();

        assert_eq!(layer.polarisation.len(), 2);
        assert!((layer.polarisation[&1].multipoles.monopole - 0.1).abs() < 1e-12);
        assert!((layer.polarisation[&2].multipoles.monopole + 0.4).abs() < 1e-12);
        assert_eq!(layer.polarisation[&2].position, Point3::new(3.0, 0.0, 0.0));
    }

    #[test]
    fn mechanical_embedding_leaves_layer_unchanged() {
        let molecule = chain_molecule(Embedding::Mechanical);
        let id = CalcId::inherited(LayerId::from(vec![0]));
        let layer = polarise_layer(&molecule, &id).unwrap();
        assert!(layer.polarisation.is_empty());
        assert_eq!(layer.atoms, molecule.layer(&id.layer).unwrap().atoms);
    }

    #[test]
    fn root_is_never_polarised() {
        let molecule = chain_molecule(Embedding::Electronic {
            scaling_factors: None,
        });
        let root = CalcId::original(LayerId::root());
        assert!(polarisation_for(&molecule, &root).unwrap().is_none());
        assert!(polarise_layer(&molecule, &root).unwrap().polarisation.is_empty());
    }

    #[test]
    fn sites_beyond_the_factor_list_keep_full_charge() {
        let molecule = chain_molecule(Embedding::Electronic {
            scaling_factors: Some(vec![0.0]),
        });
        let cloud = polarisation_for(&molecule, &CalcId::original(LayerId::from(vec![0])))
            .unwrap()
            .unwrap();
        assert_eq!(cloud[&1].multipoles.monopole, 0.0);
        assert_eq!(cloud[&2].multipoles.monopole, -1.0);
    }

    #[test]
    fn missing_calculation_is_reported() {
        let molecule = chain_molecule(Embedding::Mechanical);
        let id = CalcId::inherited(LayerId::root());
        assert!(matches!(
            polarisation_for(&molecule, &id),
            Err(ModelError::CalculationNotFound { .. })
        ));
    }
}
