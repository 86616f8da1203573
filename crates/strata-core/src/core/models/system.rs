use super::calculation::CalculationContext;
use super::ids::{AtomIndex, CalcId, LayerId};
use super::layer::Layer;
use nalgebra::Point3;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Layer {layer} does not exist")]
    LayerNotFound { layer: LayerId },

    #[error("Calculation {calc} does not exist")]
    CalculationNotFound { calc: CalcId },

    #[error("Atom {index} does not exist in layer {layer}")]
    AtomNotFound { index: AtomIndex, layer: LayerId },

    #[error("Slice depth {depth} is out of range; the layer tree has {slices} slice(s)")]
    DepthOutOfRange { depth: usize, slices: usize },

    #[error("Invalid layer layout: {0}")]
    InvalidLayout(String),
}

/// The kind of model a molecule describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelKind {
    /// Multi-centre hierarchical ONIOM model with any number of nested layers.
    #[default]
    Oniom,
    /// A single layer computed at one level of theory.
    Single,
}

/// A layered molecular system.
///
/// The molecule is a tree of [`Layer`]s addressed by [`LayerId`] paths. All operations here
/// are pure with respect to shared state: they read or modify this value only, and callers
/// publish the result through the engine's shared molecule handle.
#[derive(Debug, Clone, Default)]
pub struct Molecule {
    /// Kind of model; drivers validate it before running.
    pub kind: ModelKind,
    root: Layer,
}

impl Molecule {
    /// Creates a molecule from its root layer.
    pub fn new(kind: ModelKind, root: Layer) -> Self {
        Self { kind, root }
    }

    /// Returns the root layer, i.e. the complete system.
    pub fn root(&self) -> &Layer {
        &self.root
    }

    /// Returns the root layer mutably.
    pub fn root_mut(&mut self) -> &mut Layer {
        &mut self.root
    }

    /// Looks up a layer by its path.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::LayerNotFound`] if the path addresses a non-existent branch.
    pub fn layer(&self, id: &LayerId) -> Result<&Layer, ModelError> {
        id.path()
            .iter()
            .try_fold(&self.root, |layer, &idx| layer.children.get(idx))
            .ok_or_else(|| ModelError::LayerNotFound { layer: id.clone() })
    }

    /// Looks up a layer mutably by its path.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::LayerNotFound`] if the path addresses a non-existent branch.
    pub fn layer_mut(&mut self, id: &LayerId) -> Result<&mut Layer, ModelError> {
        let mut layer = &mut self.root;
        for &idx in id.path() {
            layer = layer
                .children
                .get_mut(idx)
                .ok_or_else(|| ModelError::LayerNotFound { layer: id.clone() })?;
        }
        Ok(layer)
    }

    /// Applies `f` to the layer at `id` and returns its result. Other layers are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::LayerNotFound`] if the path addresses a non-existent branch.
    pub fn update_layer<F, R>(&mut self, id: &LayerId, f: F) -> Result<R, ModelError>
    where
        F: FnOnce(&mut Layer) -> R,
    {
        self.layer_mut(id).map(f)
    }

    /// Returns a copy of this molecule with `f` applied to the layer at `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::LayerNotFound`] if the path addresses a non-existent branch.
    pub fn with_layer<F>(&self, id: &LayerId, f: F) -> Result<Self, ModelError>
    where
        F: FnOnce(&mut Layer),
    {
        let mut updated = self.clone();
        updated.update_layer(id, f)?;
        Ok(updated)
    }

    /// Looks up a calculation context.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::LayerNotFound`] or [`ModelError::CalculationNotFound`].
    pub fn calculation(&self, id: &CalcId) -> Result<&CalculationContext, ModelError> {
        self.layer(&id.layer)?
            .calculations
            .get(&id.key)
            .ok_or_else(|| ModelError::CalculationNotFound { calc: id.clone() })
    }

    /// Looks up a calculation context mutably.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::LayerNotFound`] or [`ModelError::CalculationNotFound`].
    pub fn calculation_mut(&mut self, id: &CalcId) -> Result<&mut CalculationContext, ModelError> {
        self.layer_mut(&id.layer)?
            .calculations
            .get_mut(&id.key)
            .ok_or_else(|| ModelError::CalculationNotFound { calc: id.clone() })
    }

    /// Folds over every layer in pre-order (root first, children in index order).
    pub fn fold<B, F>(&self, init: B, mut f: F) -> B
    where
        F: FnMut(B, &LayerId, &Layer) -> B,
    {
        fn walk<B, F>(layer: &Layer, id: LayerId, acc: B, f: &mut F) -> B
        where
            F: FnMut(B, &LayerId, &Layer) -> B,
        {
            let mut acc = f(acc, &id, layer);
            for (idx, child) in layer.children.iter().enumerate() {
                acc = walk(child, id.child(idx), acc, f);
            }
            acc
        }
        walk(&self.root, LayerId::root(), init, &mut f)
    }

    /// Applies `f` to every layer in pre-order.
    pub fn map_layers<F>(&mut self, mut f: F)
    where
        F: FnMut(&LayerId, &mut Layer),
    {
        fn walk<F>(layer: &mut Layer, id: LayerId, f: &mut F)
        where
            F: FnMut(&LayerId, &mut Layer),
        {
            f(&id, layer);
            for (idx, child) in layer.children.iter_mut().enumerate() {
                walk(child, id.child(idx), f);
            }
        }
        walk(&mut self.root, LayerId::root(), &mut f)
    }

    /// Identifiers of all layers in canonical hierarchical (pre-)order.
    pub fn layer_ids(&self) -> Vec<LayerId> {
        self.fold(Vec::new(), |mut ids, id, _| {
            ids.push(id.clone());
            ids
        })
    }

    /// Identifiers of all calculations, layers in pre-order and keys in key order.
    pub fn calc_ids(&self) -> Vec<CalcId> {
        self.fold(Vec::new(), |mut ids, id, layer| {
            ids.extend(
                layer
                    .calculations
                    .keys()
                    .map(|&key| CalcId::new(id.clone(), key)),
            );
            ids
        })
    }

    /// Number of horizontal slices, i.e. the depth of the deepest layer plus one.
    pub fn slice_count(&self) -> usize {
        self.fold(0, |max, id, _| max.max(id.depth() + 1))
    }

    /// Groups all layers by depth. Entry `d` lists the layers of slice `d` in pre-order.
    pub fn slices(&self) -> Vec<Vec<(LayerId, &Layer)>> {
        let mut slices: Vec<Vec<(LayerId, &Layer)>> = Vec::new();
        self.collect_slices(&self.root, LayerId::root(), &mut slices);
        slices
    }

    fn collect_slices<'a>(
        &'a self,
        layer: &'a Layer,
        id: LayerId,
        slices: &mut Vec<Vec<(LayerId, &'a Layer)>>,
    ) {
        let depth = id.depth();
        if slices.len() <= depth {
            slices.resize_with(depth + 1, Vec::new);
        }
        for (idx, child) in layer.children.iter().enumerate() {
            self.collect_slices(child, id.child(idx), slices);
        }
        slices[depth].push((id, layer));
    }

    /// Identifiers of the layers in slice `depth`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DepthOutOfRange`] if the tree has no such slice.
    pub fn slice_ids(&self, depth: usize) -> Result<Vec<LayerId>, ModelError> {
        let slices = self.slices();
        let count = slices.len();
        slices
            .into_iter()
            .nth(depth)
            .map(|s| s.into_iter().map(|(id, _)| id).collect())
            .ok_or(ModelError::DepthOutOfRange {
                depth,
                slices: count,
            })
    }

    /// Indices of all real atoms of the complete system.
    pub fn real_atoms(&self) -> BTreeSet<AtomIndex> {
        self.root.real_atoms()
    }

    /// Atoms optimised by the optimiser of slice `depth`.
    ///
    /// ```text
    /// free(d) = real(d) − link(d) − all(d+1)
    /// ```
    ///
    /// `real(d)` are the non-dummy atoms of the slice, `link(d)` its link atoms and `all(d+1)`
    /// every atom of the next deeper slice. A real atom capped by a link atom of slice `d + 1`
    /// is not part of that slice, so it stays free here: boundary atoms are moved by the
    /// coarser slice. Each real atom of the complete system is free in exactly one slice.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DepthOutOfRange`] if the tree has no slice `depth`.
    pub fn free_atoms_at_depth(&self, depth: usize) -> Result<BTreeSet<AtomIndex>, ModelError> {
        let slices = self.slices();
        let this: &[(LayerId, &Layer)] = slices.get(depth).ok_or(ModelError::DepthOutOfRange {
            depth,
            slices: slices.len(),
        })?;
        let deeper: &[(LayerId, &Layer)] = slices
            .get(depth + 1)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let present = union_of(this, Layer::non_dummy_atoms);
        let links = union_of(this, Layer::link_atoms);
        let deeper_atoms = union_of(deeper, |l| l.atoms.keys().copied().collect());

        Ok(present
            .difference(&links)
            .filter(|i| !deeper_atoms.contains(i))
            .copied()
            .collect())
    }

    /// Moves atoms of every layer; link atoms follow their partners.
    pub fn set_positions(&mut self, positions: &BTreeMap<AtomIndex, Point3<f64>>) {
        self.root.set_positions(positions);
    }

    /// Positions of the given atoms in the complete system, in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::AtomNotFound`] for an index absent from the root layer.
    pub fn positions(&self, indices: &[AtomIndex]) -> Result<Vec<Point3<f64>>, ModelError> {
        indices
            .iter()
            .map(|&index| {
                self.root
                    .atoms
                    .get(&index)
                    .map(|a| a.position)
                    .ok_or(ModelError::AtomNotFound {
                        index,
                        layer: LayerId::root(),
                    })
            })
            .collect()
    }
}

fn union_of<F>(layers: &[(LayerId, &Layer)], f: F) -> BTreeSet<AtomIndex>
where
    F: Fn(&Layer) -> BTreeSet<AtomIndex>,
{
    layers.iter().flat_map(|(_, layer)| f(layer)).collect()
}
