use crate::core::models::atom::Atom;
use crate::core::models::layer::Layer;
use crate::core::models::topology::BondGraph;
use phf::{Map, phf_map};

/// Default tolerance applied to the sum of covalent radii.
pub const DEFAULT_BOND_TOLERANCE: f64 = 1.2;

/// Radius assumed for elements missing from [`COVALENT_RADII`].
const FALLBACK_RADIUS: f64 = 1.5;

// Single-bond covalent radii in Å (Cordero et al., 2008).
#[rustfmt::skip]
pub static COVALENT_RADII: Map<&'static str, f64> = phf_map! {
    "H" => 0.31, "He" => 0.28,
    "Li" => 1.28, "Be" => 0.96, "B" => 0.84, "C" => 0.76, "N" => 0.71, "O" => 0.66,
    "F" => 0.57, "Ne" => 0.58,
    "Na" => 1.66, "Mg" => 1.41, "Al" => 1.21, "Si" => 1.11, "P" => 1.07, "S" => 1.05,
    "Cl" => 1.02, "Ar" => 1.06,
    "K" => 2.03, "Ca" => 1.76, "Sc" => 1.70, "Ti" => 1.60, "V" => 1.53, "Cr" => 1.39,
    "Mn" => 1.39, "Fe" => 1.32, "Co" => 1.26, "Ni" => 1.24, "Cu" => 1.32, "Zn" => 1.22,
    "Ga" => 1.22, "Ge" => 1.20, "As" => 1.19, "Se" => 1.20, "Br" => 1.20, "Kr" => 1.16,
    "Rb" => 2.20, "Sr" => 1.95, "Y" => 1.90, "Zr" => 1.75, "Nb" => 1.64, "Mo" => 1.54,
    "Tc" => 1.47, "Ru" => 1.46, "Rh" => 1.42, "Pd" => 1.39, "Ag" => 1.45, "Cd" => 1.44,
    "In" => 1.42, "Sn" => 1.39, "Sb" => 1.39, "Te" => 1.38, "I" => 1.39, "Xe" => 1.40,
    "Pt" => 1.36, "Au" => 1.36, "Hg" => 1.32,
};

/// Returns the covalent radius of `element`, matched case-insensitively.
pub fn covalent_radius(element: &str) -> Option<f64> {
    let mut chars = element.trim().chars();
    let first = chars.next()?.to_ascii_uppercase();
    let symbol: String = std::iter::once(first)
        .chain(chars.map(|c| c.to_ascii_lowercase()))
        .collect();
    COVALENT_RADII.get(symbol.as_str()).copied()
}

/// Guesses bonds between the atoms of `layer` from interatomic distances.
///
/// Two atoms are bonded when their distance does not exceed `(r_a + r_b) · tolerance`.
/// Dummy atoms never bond. Candidate pairs come from the layer's cached neighbour list.
pub fn guess_bonds(layer: &mut Layer, tolerance: f64) -> BondGraph {
    let radius = |atom: &Atom| covalent_radius(&atom.element).unwrap_or(FALLBACK_RADIUS);
    let largest = layer
        .atoms
        .values()
        .map(radius)
        .fold(0.0_f64, f64::max);
    let cutoff = 2.0 * largest * tolerance;
    let candidates = layer.neighbours(cutoff).clone();

    let atoms = &layer.atoms;
    let mut graph = BondGraph::new();
    for (&a, neighbours) in &candidates {
        let atom_a = &atoms[&a];
        if atom_a.is_dummy {
            continue;
        }
        for &b in neighbours.iter().filter(|&&b| b > a) {
            let atom_b = &atoms[&b];
            if atom_b.is_dummy {
                continue;
            }
            let limit = (radius(atom_a) + radius(atom_b)) * tolerance;
            if (atom_a.position - atom_b.position).norm() <= limit {
                graph.add_bond(a, b);
            }
        }
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;
    use std::collections::BTreeMap;

    fn water() -> Layer {
        let atoms = BTreeMap::from([
            (0, Atom::new("O", Point3::new(0.0, 0.0, 0.0))),
            (1, Atom::new("H", Point3::new(0.957, 0.0, 0.0))),
            (2, Atom::new("H", Point3::new(-0.240, 0.927, 0.0))),
        ]);
        Layer::new(atoms, BondGraph::new())
    }

    #[test]
    fn radii_lookup_ignores_case() {
        assert_eq!(covalent_radius("c"), Some(0.76));
        assert_eq!(covalent_radius("CL"), Some(1.02));
        assert_eq!(covalent_radius("Xx"), None);
        assert_eq!(covalent_radius(""), None);
    }

    #[test]
    fn water_has_two_bonds() {
        let mut layer = water();
        let graph = guess_bonds(&mut layer, DEFAULT_BOND_TOLERANCE);
        assert_eq!(graph.bonds().collect::<Vec<_>>(), vec![(0, 1), (0, 2)]);
        assert_eq!(layer.cached_neighbour_lists(), 1);
    }

    #[test]
    fn dummy_atoms_do_not_bond() {
        let mut layer = water();
        layer.atoms.get_mut(&1).unwrap().is_dummy = true;
        let graph = guess_bonds(&mut layer, DEFAULT_BOND_TOLERANCE);
        assert_eq!(graph.bond_count(), 1);
    }
}
