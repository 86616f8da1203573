use super::atom::Atom;
use super::ids::AtomIndex;
use kiddo::{KdTree, SquaredEuclidean};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// For every atom, the set of other atoms within a cutoff radius.
pub type NeighbourList = BTreeMap<AtomIndex, BTreeSet<AtomIndex>>;

/// Neighbour lists of one layer, memoised per cutoff radius.
///
/// Entries are only valid for the coordinates they were computed from; the owner clears the
/// cache whenever positions change.
#[derive(Debug, Clone, Default)]
pub struct NeighbourCache {
    lists: HashMap<u64, NeighbourList>,
}

impl NeighbourCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cutoff: f64) -> Option<&NeighbourList> {
        self.lists.get(&cutoff.to_bits())
    }

    pub fn insert(&mut self, cutoff: f64, list: NeighbourList) {
        self.lists.insert(cutoff.to_bits(), list);
    }

    pub fn get_or_insert_with(
        &mut self,
        cutoff: f64,
        compute: impl FnOnce() -> NeighbourList,
    ) -> &NeighbourList {
        self.lists.entry(cutoff.to_bits()).or_insert_with(compute)
    }

    pub fn clear(&mut self) {
        self.lists.clear();
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

/// Builds the neighbour list of `atoms` for the given cutoff (Å) using a KD-tree.
pub fn neighbour_list(atoms: &BTreeMap<AtomIndex, Atom>, cutoff: f64) -> NeighbourList {
    let indices: Vec<AtomIndex> = atoms.keys().copied().collect();
    let points: Vec<[f64; 3]> = atoms
        .values()
        .map(|a| [a.position.x, a.position.y, a.position.z])
        .collect();

    if points.is_empty() {
        return NeighbourList::new();
    }

    let tree: KdTree<f64, 3> = (&points).into();
    let cutoff_sq = cutoff * cutoff;

    #[cfg(not(feature = "parallel"))]
    let iter = points.iter().enumerate();

    #[cfg(feature = "parallel")]
    let iter = points.par_iter().enumerate();

    iter.map(|(slot, point)| {
        let neighbours: BTreeSet<AtomIndex> = tree
            .within_unsorted::<SquaredEuclidean>(point, cutoff_sq)
            .into_iter()
            .map(|n| n.item as usize)
            .filter(|&other| other != slot)
            .map(|other| indices[other])
            .collect();
        (indices[slot], neighbours)
    })
    .collect()
}
