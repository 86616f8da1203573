//! External geometry optimisers and the channel that connects them to the drivers.
//!
//! Every running optimiser is represented by an [`OptimizerEndpoint`]: three single-slot
//! handoff cells through which the optimiser asks for work (`status`), hands over the
//! geometry it wants evaluated (`outbound`) and receives the results (`inbound`). A
//! companion thread translates between these cells and the optimiser's own wire protocol,
//! and the [`OptimizerHandle`] owns everything needed to tear the pair down again.

pub mod ipi;
pub mod process;

use super::error::EngineError;
use super::handoff::HandoffCell;
use crate::core::models::ids::{AtomIndex, CalcId, LayerId};
use crate::core::models::optimisation::OptimisationSettings;
use crate::core::models::system::Molecule;
use crate::core::oniom::CollectError;
use crate::core::units::{ANGSTROM_TO_BOHR, BOHR_TO_ANGSTROM};
use nalgebra::{DMatrix, DVector, Matrix3, Point3};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Name of the file whose presence in an optimiser's working directory requests it to stop.
pub const SENTINEL_FILE: &str = "CONVERGED";

/// What an optimiser asks for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerStatus {
    /// Evaluate energy and forces at the geometry in the outbound cell.
    WantForces,
    /// Evaluate energy, forces and Hessian at the geometry in the outbound cell.
    WantHessian,
    /// Send the current coordinates; not an optimisation step.
    WantPositionPush,
    /// The optimiser has finished.
    Done,
}

/// Coordinates in Bohr, flattened over [`AtomPartition::order`].
#[derive(Debug, Clone, PartialEq)]
pub struct PositionData {
    pub coordinates: DVector<f64>,
}

/// Energy (Hartree), forces (Hartree/Bohr) and virial, flattened over the partition order.
#[derive(Debug, Clone, PartialEq)]
pub struct ForceData {
    pub energy: f64,
    pub forces: DVector<f64>,
    pub virial: Matrix3<f64>,
}

impl ForceData {
    /// A zero payload used to release an optimiser that is waiting during teardown.
    pub fn dummy(atoms: usize) -> Self {
        Self {
            energy: 0.0,
            forces: DVector::zeros(3 * atoms),
            virial: Matrix3::zeros(),
        }
    }
}

/// Energy, forces and Hessian (Hartree/Bohr²) over the partition order.
#[derive(Debug, Clone, PartialEq)]
pub struct HessianData {
    pub forces: ForceData,
    pub hessian: DMatrix<f64>,
}

/// Data sent from the drivers to an optimiser.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    Forces(ForceData),
    Hessian(HessianData),
    Positions(PositionData),
}

/// Which atoms an optimiser sees and which of them it may move.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AtomPartition {
    /// Atoms exchanged with the optimiser, in wire order.
    pub order: Vec<AtomIndex>,
    pub free: BTreeSet<AtomIndex>,
    pub frozen: BTreeSet<AtomIndex>,
}

impl AtomPartition {
    /// Partitions all real atoms of `molecule` into `free` and its complement.
    pub fn new(molecule: &Molecule, free: BTreeSet<AtomIndex>) -> Self {
        let all = molecule.real_atoms();
        let frozen = all.difference(&free).copied().collect();
        Self {
            order: all.into_iter().collect(),
            free,
            frozen,
        }
    }
}

/// The native side of one running optimiser.
pub struct OptimizerEndpoint {
    pub depth: usize,
    pub status: HandoffCell<OptimizerStatus>,
    pub outbound: HandoffCell<PositionData>,
    pub inbound: HandoffCell<InboundPayload>,
    pub work_dir: PathBuf,
    pub partition: AtomPartition,
    sentinel_writes: AtomicUsize,
}

impl OptimizerEndpoint {
    pub fn new(depth: usize, work_dir: PathBuf, partition: AtomPartition) -> Self {
        Self {
            depth,
            status: HandoffCell::new(),
            outbound: HandoffCell::new(),
            inbound: HandoffCell::new(),
            work_dir,
            partition,
            sentinel_writes: AtomicUsize::new(0),
        }
    }

    pub fn sentinel_path(&self) -> PathBuf {
        self.work_dir.join(SENTINEL_FILE)
    }

    pub fn sentinel_present(&self) -> bool {
        self.sentinel_path().exists()
    }

    /// Writes the sentinel file unless it is already present.
    pub fn request_convergence(&self) -> Result<(), EngineError> {
        if self.sentinel_present() {
            return Ok(());
        }
        let path = self.sentinel_path();
        fs::write(&path, b"")
            .map_err(|e| EngineError::io(format!("writing {}", path.display()), e))?;
        self.sentinel_writes.fetch_add(1, Ordering::SeqCst);
        debug!(depth = self.depth, "Convergence sentinel written.");
        Ok(())
    }

    /// Number of times [`OptimizerEndpoint::request_convergence`] created the sentinel.
    pub fn sentinel_writes(&self) -> usize {
        self.sentinel_writes.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.status.close();
        self.outbound.close();
        self.inbound.close();
    }

    pub fn drain(&self) {
        self.status.drain();
        self.outbound.drain();
        self.inbound.drain();
    }
}

type CompanionHandle = JoinHandle<Result<(), EngineError>>;
type CancelFn = Box<dyn FnOnce() + Send>;

/// Owns a running optimiser: its endpoint, companion thread and child process.
pub struct OptimizerHandle {
    pub endpoint: Arc<OptimizerEndpoint>,
    companion: Option<CompanionHandle>,
    process: Option<Child>,
    cancel: Option<CancelFn>,
    grace: Duration,
    torn_down: bool,
}

impl OptimizerHandle {
    pub fn new(endpoint: Arc<OptimizerEndpoint>) -> Self {
        Self {
            endpoint,
            companion: None,
            process: None,
            cancel: None,
            grace: Duration::from_secs(5),
            torn_down: false,
        }
    }

    pub fn with_companion(mut self, companion: CompanionHandle) -> Self {
        self.companion = Some(companion);
        self
    }

    pub fn with_process(mut self, process: Child) -> Self {
        self.process = Some(process);
        self
    }

    /// Registers an action that unblocks the companion (e.g. shutting down its socket).
    pub fn with_cancel(mut self, cancel: impl FnOnce() + Send + 'static) -> Self {
        self.cancel = Some(Box::new(cancel));
        self
    }

    /// How long the optimiser process may take to exit on its own before it is killed.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Exit status of the optimiser process, if it has already terminated.
    pub fn process_status(&mut self) -> Result<Option<ExitStatus>, EngineError> {
        match self.process.as_mut() {
            Some(child) => child
                .try_wait()
                .map_err(|e| EngineError::io("polling optimiser process", e)),
            None => Ok(None),
        }
    }

    /// Stops the optimiser.
    ///
    /// Writes the sentinel, offers one dummy force payload to a waiting optimiser, closes the
    /// cells, cancels the companion, stops the process and drains whatever is left. Never
    /// blocks on a cell. Calling it again is a no-op.
    pub fn teardown(&mut self) -> Result<(), EngineError> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let endpoint = &self.endpoint;

        if let Err(e) = endpoint.request_convergence() {
            warn!(depth = endpoint.depth, "Could not write sentinel: {}", e);
        }
        let atoms = endpoint.partition.order.len();
        let _ = endpoint
            .inbound
            .try_put(InboundPayload::Forces(ForceData::dummy(atoms)));
        endpoint.close();

        if let Some(cancel) = self.cancel.take() {
            cancel();
        }

        let mut result = Ok(());
        if let Some(mut child) = self.process.take() {
            if let Err(e) = stop_process(&mut child, self.grace) {
                result = Err(EngineError::io("stopping optimiser process", e));
            }
        }

        if let Some(companion) = self.companion.take() {
            match companion.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(depth = endpoint.depth, "Companion ended with: {}", e),
                Err(_) => {
                    result = Err(EngineError::Internal(format!(
                        "companion thread of slice {} panicked",
                        endpoint.depth
                    )));
                }
            }
        }

        endpoint.drain();
        debug!(depth = endpoint.depth, "Optimiser torn down.");
        result
    }
}

impl Drop for OptimizerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("Optimiser teardown failed: {}", e);
        }
    }
}

fn stop_process(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }
    if child.try_wait()?.is_none() {
        child.kill()?;
        child.wait()?;
    }
    Ok(())
}

/// What a launcher needs to start the optimiser of one slice.
pub struct LaunchRequest<'a> {
    pub depth: usize,
    pub settings: &'a OptimisationSettings,
    pub molecule: &'a Molecule,
    pub partition: AtomPartition,
}

/// Starts external optimisers.
pub trait OptimizerLauncher: Send + Sync {
    fn launch(&self, request: LaunchRequest<'_>) -> Result<OptimizerHandle, EngineError>;
}

/// Current coordinates of `order` in Bohr.
pub fn positions_payload(
    molecule: &Molecule,
    order: &[AtomIndex],
) -> Result<PositionData, EngineError> {
    let positions = molecule.positions(order)?;
    let coordinates = DVector::from_iterator(
        3 * positions.len(),
        positions
            .iter()
            .flat_map(|p| [p.x, p.y, p.z])
            .map(|x| x * ANGSTROM_TO_BOHR),
    );
    Ok(PositionData { coordinates })
}

/// Decodes an optimiser geometry into Ångström positions for the atoms in `movable`.
///
/// Atoms outside `movable` are left out, so frozen atoms keep their positions even if the
/// optimiser moved them.
pub fn decode_positions(
    data: &PositionData,
    partition: &AtomPartition,
    movable: &BTreeSet<AtomIndex>,
    depth: usize,
) -> Result<BTreeMap<AtomIndex, Point3<f64>>, EngineError> {
    let expected = 3 * partition.order.len();
    if data.coordinates.len() != expected {
        return Err(EngineError::ProtocolViolation {
            depth,
            reason: format!(
                "optimiser sent {} coordinates, expected {}",
                data.coordinates.len(),
                expected
            ),
        });
    }
    Ok(partition
        .order
        .iter()
        .enumerate()
        .filter(|(_, index)| movable.contains(index))
        .map(|(slot, &index)| {
            let c = &data.coordinates;
            let p = Point3::new(c[3 * slot], c[3 * slot + 1], c[3 * slot + 2]);
            (index, p * BOHR_TO_ANGSTROM)
        })
        .collect())
}

/// Forces from the collected root gradient, zeroed for atoms outside `free`.
pub fn force_payload(
    molecule: &Molecule,
    partition: &AtomPartition,
    free: &BTreeSet<AtomIndex>,
) -> Result<ForceData, EngineError> {
    let root = molecule.root();
    let missing = |quantity| CollectError::MissingResult {
        calc: CalcId::original(LayerId::root()),
        quantity,
    };
    let energy = root.derivatives.energy.ok_or_else(|| missing("energy"))?;
    let gradient = root
        .derivatives
        .gradient
        .as_ref()
        .ok_or_else(|| missing("gradient"))?;

    let mut forces = DVector::zeros(3 * partition.order.len());
    for (slot, &index) in partition.order.iter().enumerate() {
        if !free.contains(&index) {
            continue;
        }
        let root_slot = root_slot(molecule, index)?;
        for k in 0..3 {
            forces[3 * slot + k] = -gradient[3 * root_slot + k] * BOHR_TO_ANGSTROM;
        }
    }

    Ok(ForceData {
        energy,
        forces,
        virial: Matrix3::zeros(),
    })
}

/// Forces plus the collected root Hessian restricted to the partition order.
pub fn hessian_payload(
    molecule: &Molecule,
    partition: &AtomPartition,
    free: &BTreeSet<AtomIndex>,
) -> Result<HessianData, EngineError> {
    let forces = force_payload(molecule, partition, free)?;
    let full = molecule.root().derivatives.hessian.as_ref().ok_or_else(|| {
        CollectError::MissingResult {
            calc: CalcId::original(LayerId::root()),
            quantity: "hessian",
        }
    })?;

    let slots = partition
        .order
        .iter()
        .map(|&i| root_slot(molecule, i))
        .collect::<Result<Vec<_>, _>>()?;
    let n = 3 * slots.len();
    let scale = BOHR_TO_ANGSTROM * BOHR_TO_ANGSTROM;
    let hessian = DMatrix::from_fn(n, n, |row, col| {
        let (a, k) = (slots[row / 3], row % 3);
        let (b, l) = (slots[col / 3], col % 3);
        full[(3 * a + k, 3 * b + l)] * scale
    });

    Ok(HessianData { forces, hessian })
}

fn root_slot(molecule: &Molecule, index: AtomIndex) -> Result<usize, EngineError> {
    molecule.root().atom_slot(index).ok_or_else(|| {
        crate::core::models::system::ModelError::AtomNotFound {
            index,
            layer: LayerId::root(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::atom::Atom;
    use crate::core::models::layer::Layer;
    use crate::core::models::system::ModelKind;
    use crate::core::models::topology::BondGraph;
    use std::time::Instant;

    fn molecule() -> Molecule {
        let atoms = BTreeMap::from([
            (0, Atom::new("O", Point3::new(0.0, 0.0, 0.0))),
            (1, Atom::new("H", Point3::new(1.0, 0.0, 0.0))),
        ]);
        let mut root = Layer::new(atoms, BondGraph::new());
        root.derivatives.energy = Some(-76.0);
        root.derivatives.gradient = Some(DVector::from_vec(vec![
            0.0, 0.0, 0.0, ANGSTROM_TO_BOHR, 0.0, 0.0,
        ]));
        Molecule::new(ModelKind::Oniom, root)
    }

    #[test]
    fn partition_frozen_is_complement_of_free() {
        let m = molecule();
        let partition = AtomPartition::new(&m, BTreeSet::from([1]));
        assert_eq!(partition.order, vec![0, 1]);
        assert_eq!(partition.frozen, BTreeSet::from([0]));
    }

    #[test]
    fn positions_are_sent_in_bohr() {
        let data = positions_payload(&molecule(), &[0, 1]).unwrap();
        assert!((data.coordinates[3] - ANGSTROM_TO_BOHR).abs() < 1e-12);
    }

    #[test]
    fn decoding_ignores_frozen_atoms() {
        let m = molecule();
        let partition = AtomPartition::new(&m, BTreeSet::from([1]));
        let data = PositionData {
            coordinates: DVector::from_vec(vec![9.0, 9.0, 9.0, 2.0 * ANGSTROM_TO_BOHR, 0.0, 0.0]),
        };
        let positions = decode_positions(&data, &partition, &partition.free, 0).unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[&1].x - 2.0).abs() < 1e-12);

        let short = PositionData {
            coordinates: DVector::zeros(3),
        };
        assert!(matches!(
            decode_positions(&short, &partition, &partition.free, 2),
            Err(EngineError::ProtocolViolation { depth: 2, .. })
        ));
    }

    #[test]
    fn forces_are_negated_gradients_in_atomic_units() {
        let m = molecule();
        let partition = AtomPartition::new(&m, BTreeSet::from([0, 1]));
        let data = force_payload(&m, &partition, &partition.free).unwrap();
        assert_eq!(data.energy, -76.0);
        assert!((data.forces[3] + 1.0).abs() < 1e-12);

        let frozen_h = force_payload(&m, &partition, &BTreeSet::from([0])).unwrap();
        assert_eq!(frozen_h.forces[3], 0.0);
    }

    #[test]
    fn missing_gradient_is_a_collection_error() {
        let mut m = molecule();
        m.root_mut().derivatives.gradient = None;
        let partition = AtomPartition::new(&m, BTreeSet::from([0, 1]));
        assert!(matches!(
            force_payload(&m, &partition, &partition.free),
            Err(EngineError::Collect { .. })
        ));
    }

    #[test]
    fn sentinel_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint =
            OptimizerEndpoint::new(0, dir.path().to_path_buf(), AtomPartition::default());
        assert!(!endpoint.sentinel_present());
        endpoint.request_convergence().unwrap();
        endpoint.request_convergence().unwrap();
        assert!(dir.path().join(SENTINEL_FILE).exists());
        assert_eq!(endpoint.sentinel_writes(), 1);
    }

    #[test]
    fn teardown_releases_a_companion_blocked_on_empty_cells() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Arc::new(OptimizerEndpoint::new(
            0,
            dir.path().to_path_buf(),
            AtomPartition::default(),
        ));
        let companion = {
            let endpoint = Arc::clone(&endpoint);
            thread::spawn(move || {
                endpoint.outbound.take()?;
                Ok(())
            })
        };
        let mut handle = OptimizerHandle::new(endpoint).with_companion(companion);

        let start = Instant::now();
        handle.teardown().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(handle.endpoint.status.is_closed());
    }

    #[test]
    fn teardown_releases_a_companion_blocked_on_full_cells() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Arc::new(OptimizerEndpoint::new(
            1,
            dir.path().to_path_buf(),
            AtomPartition::default(),
        ));
        endpoint.status.put(OptimizerStatus::WantForces).unwrap();
        endpoint
            .outbound
            .put(PositionData {
                coordinates: DVector::zeros(0),
            })
            .unwrap();
        let companion = {
            let endpoint = Arc::clone(&endpoint);
            thread::spawn(move || {
                endpoint.status.put(OptimizerStatus::WantForces)?;
                Ok(())
            })
        };
        let mut handle = OptimizerHandle::new(Arc::clone(&endpoint)).with_companion(companion);

        let start = Instant::now();
        handle.teardown().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!endpoint.status.is_full());
        assert!(!endpoint.outbound.is_full());
        assert!(endpoint.sentinel_present());
    }
}
