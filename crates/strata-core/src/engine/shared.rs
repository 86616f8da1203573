use crate::core::models::system::Molecule;
use parking_lot::RwLock;
use std::sync::Arc;

struct Versioned {
    version: u64,
    molecule: Arc<Molecule>,
}

/// The single mutable molecule shared by drivers, the calculation slot worker and reporters.
///
/// Readers take cheap immutable snapshots. Writers run read-modify-write transactions while
/// holding the write lock, so every mutation is applied atomically against the latest value
/// and concurrent transactions never lose each other's updates. A failed transaction leaves
/// the molecule untouched.
#[derive(Clone)]
pub struct SharedMolecule {
    inner: Arc<RwLock<Versioned>>,
}

impl SharedMolecule {
    pub fn new(molecule: Molecule) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Versioned {
                version: 0,
                molecule: Arc::new(molecule),
            })),
        }
    }

    /// Returns the current value. Later transactions do not affect the returned snapshot.
    pub fn snapshot(&self) -> Arc<Molecule> {
        Arc::clone(&self.inner.read().molecule)
    }

    /// Number of committed transactions.
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Applies `f` to a working copy and publishes it if `f` succeeds.
    pub fn transaction<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Molecule) -> Result<R, E>,
    {
        let mut guard = self.inner.write();
        let mut working = Molecule::clone(&guard.molecule);
        let result = f(&mut working)?;
        guard.molecule = Arc::new(working);
        guard.version += 1;
        Ok(result)
    }

    /// Infallible form of [`SharedMolecule::transaction`].
    pub fn modify<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Molecule) -> R,
    {
        let mut guard = self.inner.write();
        let mut working = Molecule::clone(&guard.molecule);
        let result = f(&mut working);
        guard.molecule = Arc::new(working);
        guard.version += 1;
        result
    }

    /// Replaces the whole value.
    pub fn replace(&self, molecule: Molecule) {
        let mut guard = self.inner.write();
        guard.molecule = Arc::new(molecule);
        guard.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::atom::Atom;
    use crate::core::models::layer::Layer;
    use crate::core::models::system::ModelKind;
    use crate::core::models::topology::BondGraph;
    use nalgebra::Point3;
    use std::collections::BTreeMap;
    use std::thread;

    fn single_atom() -> Molecule {
        let atoms = BTreeMap::from([(0, Atom::new("He", Point3::origin()))]);
        Molecule::new(ModelKind::Oniom, Layer::new(atoms, BondGraph::new()))
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let shared = SharedMolecule::new(single_atom());
        let before = shared.snapshot();
        shared.modify(|m| m.root_mut().atoms.get_mut(&0).unwrap().position.x = 1.0);
        assert_eq!(before.root().atoms[&0].position.x, 0.0);
        assert_eq!(shared.snapshot().root().atoms[&0].position.x, 1.0);
        assert_eq!(shared.version(), 1);
    }

    #[test]
    fn failed_transaction_changes_nothing() {
        let shared = SharedMolecule::new(single_atom());
        let result: Result<(), &str> = shared.transaction(|m| {
            m.root_mut().atoms.clear();
            Err("abort")
        });
        assert!(result.is_err());
        assert_eq!(shared.snapshot().root().atoms.len(), 1);
        assert_eq!(shared.version(), 0);
    }

    #[test]
    fn concurrent_transactions_do_not_lose_updates() {
        let shared = SharedMolecule::new(single_atom());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        shared.modify(|m| {
                            m.root_mut().atoms.get_mut(&0).unwrap().position.x += 1.0
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(shared.snapshot().root().atoms[&0].position.x, 200.0);
        assert_eq!(shared.version(), 200);
    }
}
