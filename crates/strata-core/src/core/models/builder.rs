use super::atom::{Atom, LinkInfo, link_position};
use super::calculation::{CalcInput, CalculationContext};
use super::ids::{AtomIndex, CalcKey};
use super::layer::Layer;
use super::system::{ModelError, ModelKind, Molecule};
use super::topology::BondGraph;
use crate::core::topology::guess::guess_bonds;
use std::collections::{BTreeMap, BTreeSet};

/// Default scale factor placing a link atom along the cut bond.
pub const DEFAULT_G_FACTOR: f64 = 0.709;

/// Description of one nested layer: which atoms of the parent it keeps, how it is computed
/// and how cut bonds are capped.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub atoms: BTreeSet<AtomIndex>,
    pub calculations: BTreeMap<CalcKey, CalcInput>,
    pub children: Vec<LayerSpec>,
    pub link_element: String,
    pub g_factor: f64,
}

impl LayerSpec {
    pub fn new(atoms: impl IntoIterator<Item = AtomIndex>) -> Self {
        Self {
            atoms: atoms.into_iter().collect(),
            calculations: BTreeMap::new(),
            children: Vec::new(),
            link_element: "H".to_string(),
            g_factor: DEFAULT_G_FACTOR,
        }
    }

    pub fn with_calculation(mut self, key: CalcKey, input: CalcInput) -> Self {
        self.calculations.insert(key, input);
        self
    }

    pub fn with_child(mut self, child: LayerSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_link(mut self, element: &str, g_factor: f64) -> Self {
        self.link_element = element.to_string();
        self.g_factor = g_factor;
        self
    }
}

/// Assembles a [`Molecule`] from a flat atom table, its bonds and nested layer selections.
///
/// Every bond between a selected atom and an atom left outside the selection is cut and
/// capped by a link atom. Link atoms receive fresh indices above every real index so that
/// indices stay unique across the whole tree.
pub struct MoleculeBuilder {
    kind: ModelKind,
    atoms: BTreeMap<AtomIndex, Atom>,
    bonds: BondGraph,
    bond_tolerance: Option<f64>,
    calculations: BTreeMap<CalcKey, CalcInput>,
    layers: Vec<LayerSpec>,
}

impl Default for MoleculeBuilder {
    fn default() -> Self {
        Self::new(ModelKind::Oniom)
    }
}

impl MoleculeBuilder {
    pub fn new(kind: ModelKind) -> Self {
        Self {
            kind,
            atoms: BTreeMap::new(),
            bonds: BondGraph::new(),
            bond_tolerance: None,
            calculations: BTreeMap::new(),
            layers: Vec::new(),
        }
    }

    pub fn add_atom(&mut self, index: AtomIndex, atom: Atom) -> &mut Self {
        self.atoms.insert(index, atom);
        self
    }

    pub fn add_bond(&mut self, a: AtomIndex, b: AtomIndex) -> &mut Self {
        self.bonds.add_bond(a, b);
        self
    }

    /// Adds bonds guessed from covalent radii scaled by `tolerance` when building.
    pub fn guess_bonds(&mut self, tolerance: f64) -> &mut Self {
        self.bond_tolerance = Some(tolerance);
        self
    }

    pub fn root_calculation(&mut self, key: CalcKey, input: CalcInput) -> &mut Self {
        self.calculations.insert(key, input);
        self
    }

    pub fn add_layer(&mut self, spec: LayerSpec) -> &mut Self {
        self.layers.push(spec);
        self
    }

    pub fn build(self) -> Result<Molecule, ModelError> {
        for (a, b) in self.bonds.bonds() {
            if !self.atoms.contains_key(&a) || !self.atoms.contains_key(&b) {
                return Err(ModelError::InvalidLayout(format!(
                    "bond {}-{} refers to an unknown atom",
                    a, b
                )));
            }
        }

        let mut next_index = self.atoms.keys().next_back().map_or(0, |&i| i + 1);
        let mut root = Layer::new(self.atoms, self.bonds);
        if let Some(tolerance) = self.bond_tolerance {
            for (a, b) in guess_bonds(&mut root, tolerance).bonds() {
                root.bonds.add_bond(a, b);
            }
        }
        root.calculations = contexts(self.calculations);

        for spec in &self.layers {
            let child = build_layer(spec, &root, &mut next_index)?;
            root.children.push(child);
        }

        Ok(Molecule::new(self.kind, root))
    }
}

fn contexts(inputs: BTreeMap<CalcKey, CalcInput>) -> BTreeMap<CalcKey, CalculationContext> {
    inputs
        .into_iter()
        .map(|(key, input)| (key, CalculationContext::new(input)))
        .collect()
}

fn build_layer(
    spec: &LayerSpec,
    parent: &Layer,
    next_index: &mut AtomIndex,
) -> Result<Layer, ModelError> {
    if spec.atoms.is_empty() {
        return Err(ModelError::InvalidLayout(
            "a layer must select at least one atom".to_string(),
        ));
    }

    let mut atoms = BTreeMap::new();
    for &index in &spec.atoms {
        match parent.atoms.get(&index) {
            Some(atom) if !atom.is_link() => {
                atoms.insert(index, atom.clone());
            }
            _ => {
                return Err(ModelError::InvalidLayout(format!(
                    "atom {} is not a real atom of the enclosing layer",
                    index
                )));
            }
        }
    }

    let mut bonds = parent.bonds.restricted_to(&spec.atoms);

    for &inside in &spec.atoms {
        for outside in parent.bonds.neighbours(inside) {
            if spec.atoms.contains(&outside) {
                continue;
            }
            let capped = parent.atoms.get(&outside).ok_or_else(|| {
                ModelError::InvalidLayout(format!("bond partner {} does not exist", outside))
            })?;
            if capped.is_link() {
                return Err(ModelError::InvalidLayout(format!(
                    "bond {}-{} to a link atom cannot be cut again",
                    inside, outside
                )));
            }

            let position =
                link_position(&atoms[&inside].position, &capped.position, spec.g_factor);
            let link = LinkInfo {
                capped: outside,
                bonded_to: inside,
                g_factor: spec.g_factor,
            };
            let index = *next_index;
            *next_index += 1;
            atoms.insert(index, Atom::link(&spec.link_element, position, link));
            bonds.add_bond(inside, index);
        }
    }

    let mut layer = Layer::new(atoms, bonds);
    layer.calculations = contexts(spec.calculations.clone());

    for child_spec in &spec.children {
        let child = build_layer(child_spec, &layer, next_index)?;
        layer.children.push(child);
    }

    Ok(layer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ids::LayerId;
    use nalgebra::Point3;

    fn chain_builder() -> MoleculeBuilder {
        let mut builder = MoleculeBuilder::new(ModelKind::Oniom);
        for i in 0..4 {
            builder.add_atom(i, Atom::new("C", Point3::new(1.5 * i as f64, 0.0, 0.0)));
        }
        builder.add_bond(0, 1).add_bond(1, 2).add_bond(2, 3);
        builder.root_calculation(CalcKey::Original, CalcInput::default());
        builder
    }

    #[test]
    fn guessed_bonds_are_cut_like_explicit_ones() {
        let mut builder = MoleculeBuilder::new(ModelKind::Oniom);
        for i in 0..4 {
            builder.add_atom(i, Atom::new("C", Point3::new(1.5 * i as f64, 0.0, 0.0)));
        }
        builder.guess_bonds(1.2).add_layer(LayerSpec::new([0, 1]));
        let molecule = builder.build().unwrap();

        let root = molecule.root();
        assert_eq!(root.bonds.bond_count(), 3);
        assert!(!root.bonds.are_bonded(0, 2));
        assert_eq!(root.cached_neighbour_lists(), 1);
        let model = molecule.layer(&LayerId::from(vec![0])).unwrap();
        assert_eq!(model.link_atoms().len(), 1);
    }

    #[test]
    fn cut_bonds_are_capped_with_link_atoms() {
        let mut builder = chain_builder();
        builder.add_layer(
            LayerSpec::new([0, 1])
                .with_calculation(CalcKey::Original, CalcInput::default())
                .with_calculation(CalcKey::Inherited, CalcInput::default()),
        );
        let molecule = builder.build().unwrap();
        let model = molecule.layer(&LayerId::from(vec![0])).unwrap();

        assert_eq!(model.atoms.len(), 3);
        let link_atom = &model.atoms[&4];
        let link = link_atom.link.unwrap();
        assert_eq!(link.capped, 2);
        assert_eq!(link.bonded_to, 1);
        assert_eq!(link_atom.element, "H");
        let expected = 1.5 + DEFAULT_G_FACTOR * 1.5;
        assert!((link_atom.position.x - expected).abs() < 1e-12);
        assert!(model.bonds.are_bonded(1, 4));
        assert!(model.bonds.are_bonded(0, 1));
        assert_eq!(model.calculations.len(), 2);
    }

    #[test]
    fn nested_layers_get_unique_link_indices() {
        let mut builder = chain_builder();
        builder.add_layer(LayerSpec::new([0, 1]).with_child(LayerSpec::new([0])));
        let molecule = builder.build().unwrap();
        let inner = molecule.layer(&LayerId::from(vec![0, 0])).unwrap();

        assert_eq!(inner.link_atoms(), BTreeSet::from([5]));
        assert_eq!(inner.capped_atoms(), BTreeSet::from([1]));
    }

    #[test]
    fn selection_outside_parent_is_rejected() {
        let mut builder = chain_builder();
        builder.add_layer(LayerSpec::new([0, 1]).with_child(LayerSpec::new([2])));
        assert!(matches!(builder.build(), Err(ModelError::InvalidLayout(_))));
    }

    #[test]
    fn empty_selection_is_rejected() {
        let mut builder = chain_builder();
        builder.add_layer(LayerSpec::new(Vec::<AtomIndex>::new()));
        assert!(builder.build().is_err());
    }

    #[test]
    fn custom_link_element_and_g_factor_are_used() {
        let mut builder = chain_builder();
        builder.add_layer(LayerSpec::new([3]).with_link("F", 0.5));
        let molecule = builder.build().unwrap();
        let model = molecule.layer(&LayerId::from(vec![0])).unwrap();
        let link_atom = &model.atoms[&4];
        assert_eq!(link_atom.element, "F");
        assert!((link_atom.position.x - 3.75).abs() < 1e-12);
    }
}
