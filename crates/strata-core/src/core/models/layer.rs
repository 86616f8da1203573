use super::atom::{Atom, link_position};
use super::calculation::CalculationContext;
use super::ids::{AtomIndex, CalcKey};
use super::neighbours::{NeighbourCache, NeighbourList, neighbour_list};
use super::topology::BondGraph;
use crate::core::polarisation::PolarisationCloud;
use nalgebra::{DMatrix, DVector, Point3};
use std::collections::{BTreeMap, BTreeSet};

/// Combined ONIOM energy and derivatives of a layer, in the layer's own atom ordering.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnergyDerivatives {
    pub energy: Option<f64>,
    pub gradient: Option<DVector<f64>>,
    pub hessian: Option<DMatrix<f64>>,
}

/// One node of the layer tree.
///
/// A layer owns a flat table of atoms keyed by [`AtomIndex`], the bonds between them, its
/// calculation contexts, the combined ONIOM result collected for it, and the point-charge
/// cloud applied to it from the layers above. Children are nested, higher-level regions.
#[derive(Debug, Clone, Default)]
pub struct Layer {
    /// Atoms of this layer, including link atoms capping cut bonds.
    pub atoms: BTreeMap<AtomIndex, Atom>,
    /// Bonds between atoms of this layer.
    pub bonds: BondGraph,
    /// Calculation contexts, at most one per key.
    pub calculations: BTreeMap<CalcKey, CalculationContext>,
    /// ONIOM result collected for the subtree rooted at this layer.
    pub derivatives: EnergyDerivatives,
    /// Embedding multipoles applied to this layer's calculations.
    pub polarisation: PolarisationCloud,
    /// Nested regions computed at higher levels of theory.
    pub children: Vec<Layer>,
    neighbours: NeighbourCache,
}

impl Layer {
    /// Creates a layer without calculations or children.
    pub fn new(atoms: BTreeMap<AtomIndex, Atom>, bonds: BondGraph) -> Self {
        Self {
            atoms,
            bonds,
            ..Default::default()
        }
    }

    /// Returns the position of `index` in this layer's atom ordering.
    pub fn atom_slot(&self, index: AtomIndex) -> Option<usize> {
        self.atoms.keys().position(|&i| i == index)
    }

    /// Indices of atoms that are neither dummies nor link atoms.
    pub fn real_atoms(&self) -> BTreeSet<AtomIndex> {
        self.atoms
            .iter()
            .filter(|(_, a)| a.is_real())
            .map(|(&i, _)| i)
            .collect()
    }

    /// Indices of all non-dummy atoms, link atoms included.
    pub fn non_dummy_atoms(&self) -> BTreeSet<AtomIndex> {
        self.atoms
            .iter()
            .filter(|(_, a)| !a.is_dummy)
            .map(|(&i, _)| i)
            .collect()
    }

    /// Indices of link atoms.
    pub fn link_atoms(&self) -> BTreeSet<AtomIndex> {
        self.atoms
            .iter()
            .filter(|(_, a)| a.is_link())
            .map(|(&i, _)| i)
            .collect()
    }

    /// Indices of the parent-layer atoms capped by this layer's link atoms.
    pub fn capped_atoms(&self) -> BTreeSet<AtomIndex> {
        self.atoms.values().filter_map(|a| a.link).map(|l| l.capped).collect()
    }

    /// Returns the neighbour list for `cutoff`, computing and caching it on first use.
    pub fn neighbours(&mut self, cutoff: f64) -> &NeighbourList {
        let atoms = &self.atoms;
        self.neighbours
            .get_or_insert_with(cutoff, || neighbour_list(atoms, cutoff))
    }

    #[cfg(test)]
    pub(crate) fn cached_neighbour_lists(&self) -> usize {
        self.neighbours.len()
    }

    /// Moves atoms of this layer and its descendants to new positions.
    ///
    /// Indices unknown to a layer are ignored there. Link atoms are re-placed from their
    /// partners afterwards, top-down, so a link atom always follows the positions of the
    /// layer above it. Neighbour caches of touched layers are cleared.
    pub fn set_positions(&mut self, positions: &BTreeMap<AtomIndex, Point3<f64>>) {
        self.apply_positions(positions, None);
    }

    fn apply_positions(
        &mut self,
        positions: &BTreeMap<AtomIndex, Point3<f64>>,
        parent_atoms: Option<&BTreeMap<AtomIndex, Atom>>,
    ) {
        for (index, atom) in self.atoms.iter_mut() {
            if atom.is_link() {
                continue;
            }
            if let Some(position) = positions.get(index) {
                atom.position = *position;
            }
        }

        let own_positions: BTreeMap<AtomIndex, Point3<f64>> = self
            .atoms
            .iter()
            .map(|(&i, a)| (i, a.position))
            .collect();
        for atom in self.atoms.values_mut() {
            let Some(link) = atom.link else { continue };
            let capped = parent_atoms
                .and_then(|p| p.get(&link.capped))
                .map(|a| a.position);
            let bonded_to = own_positions.get(&link.bonded_to);
            if let (Some(capped), Some(bonded_to)) = (capped, bonded_to) {
                atom.position = link_position(bonded_to, &capped, link.g_factor);
            }
        }

        self.neighbours.clear();

        let atoms = &self.atoms;
        for child in self.children.iter_mut() {
            child.apply_positions(positions, Some(atoms));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::atom::LinkInfo;

    fn parent_with_child() -> Layer {
        let mut atoms = BTreeMap::new();
        atoms.insert(0, Atom::new("C", Point3::new(0.0, 0.0, 0.0)));
        atoms.insert(1, Atom::new("C", Point3::new(1.5, 0.0, 0.0)));
        let mut bonds = BondGraph::new();
        bonds.add_bond(0, 1);
        let mut parent = Layer::new(atoms, bonds);

        let mut child_atoms = BTreeMap::new();
        child_atoms.insert(0, Atom::new("C", Point3::new(0.0, 0.0, 0.0)));
        child_atoms.insert(
            2,
            Atom::link(
                "H",
                Point3::new(1.0, 0.0, 0.0),
                LinkInfo {
                    capped: 1,
                    bonded_to: 0,
                    g_factor: 0.5,
                },
            ),
        );
        parent.children.push(Layer::new(child_atoms, BondGraph::new()));
        parent
    }

    #[test]
    fn atom_sets_distinguish_real_and_link_atoms() {
        let layer = parent_with_child();
        let child = &layer.children[0];
        assert_eq!(child.real_atoms(), BTreeSet::from([0]));
        assert_eq!(child.link_atoms(), BTreeSet::from([2]));
        assert_eq!(child.capped_atoms(), BTreeSet::from([1]));
        assert_eq!(child.non_dummy_atoms(), BTreeSet::from([0, 2]));
    }

    #[test]
    fn set_positions_propagates_and_replaces_link_atoms() {
        let mut layer = parent_with_child();
        let positions = BTreeMap::from([
            (0, Point3::new(1.0, 1.0, 0.0)),
            (1, Point3::new(3.0, 1.0, 0.0)),
        ]);
        layer.set_positions(&positions);

        assert_eq!(layer.atoms[&1].position, Point3::new(3.0, 1.0, 0.0));
        let child = &layer.children[0];
        assert_eq!(child.atoms[&0].position, Point3::new(1.0, 1.0, 0.0));
        assert!((child.atoms[&2].position - Point3::new(2.0, 1.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn neighbour_lists_are_cached_and_invalidated_by_moves() {
        let mut layer = parent_with_child();
        assert_eq!(layer.neighbours(2.0)[&0], BTreeSet::from([1]));
        assert_eq!(layer.cached_neighbour_lists(), 1);

        layer.set_positions(&BTreeMap::from([(1, Point3::new(5.0, 0.0, 0.0))]));
        assert_eq!(layer.cached_neighbour_lists(), 0);
        assert!(layer.neighbours(2.0)[&0].is_empty());
    }

    #[test]
    fn atom_slot_follows_index_order() {
        let layer = parent_with_child();
        let child = &layer.children[0];
        assert_eq!(child.atom_slot(0), Some(0));
        assert_eq!(child.atom_slot(2), Some(1));
        assert_eq!(child.atom_slot(1), None);
    }
}
