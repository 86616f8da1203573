use super::ids::AtomIndex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Undirected bond graph over atom indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BondGraph {
    adjacency: BTreeMap<AtomIndex, BTreeSet<AtomIndex>>,
}

impl BondGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bond between `a` and `b`. Self-bonds are ignored.
    pub fn add_bond(&mut self, a: AtomIndex, b: AtomIndex) {
        if a == b {
            return;
        }
        self.adjacency.entry(a).or_default().insert(b);
        self.adjacency.entry(b).or_default().insert(a);
    }

    pub fn are_bonded(&self, a: AtomIndex, b: AtomIndex) -> bool {
        self.adjacency.get(&a).is_some_and(|n| n.contains(&b))
    }

    /// Returns the bonded neighbours of `atom`.
    pub fn neighbours(&self, atom: AtomIndex) -> impl Iterator<Item = AtomIndex> + '_ {
        self.adjacency
            .get(&atom)
            .into_iter()
            .flat_map(|n| n.iter().copied())
    }

    /// Iterates over every bond once, as `(a, b)` with `a < b`.
    pub fn bonds(&self) -> impl Iterator<Item = (AtomIndex, AtomIndex)> + '_ {
        self.adjacency
            .iter()
            .flat_map(|(&a, n)| n.iter().filter(move |&&b| a < b).map(move |&b| (a, b)))
    }

    pub fn bond_count(&self) -> usize {
        self.bonds().count()
    }

    /// Returns the subgraph containing only bonds between atoms of `atoms`.
    pub fn restricted_to(&self, atoms: &BTreeSet<AtomIndex>) -> Self {
        let mut graph = Self::new();
        for (a, b) in self.bonds() {
            if atoms.contains(&a) && atoms.contains(&b) {
                graph.add_bond(a, b);
            }
        }
        graph
    }

    /// Computes the bond separation of every reachable atom from the set `sources`.
    ///
    /// Sources have separation 0, their direct neighbours 1 and so on. Atoms not connected to
    /// any source are absent from the result.
    pub fn separations_from(
        &self,
        sources: &BTreeSet<AtomIndex>,
    ) -> BTreeMap<AtomIndex, usize> {
        let mut separations: BTreeMap<AtomIndex, usize> =
            sources.iter().map(|&s| (s, 0)).collect();
        let mut queue: VecDeque<AtomIndex> = sources.iter().copied().collect();

        while let Some(current) = queue.pop_front() {
            let next = separations[&current] + 1;
            for neighbour in self.neighbours(current) {
                if !separations.contains_key(&neighbour) {
                    separations.insert(neighbour, next);
                    queue.push_back(neighbour);
                }
            }
        }
        separations
    }
}
