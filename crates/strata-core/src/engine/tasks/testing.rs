//! Stub collaborators shared by the driver tests.

use crate::core::geometry::ConvergenceThresholds;
use crate::core::models::atom::{Atom, Multipoles};
use crate::core::models::builder::{LayerSpec, MoleculeBuilder};
use crate::core::models::calculation::{CalcInput, CalcOutput, Embedding, Task};
use crate::core::models::ids::{CalcId, CalcKey};
use crate::core::models::optimisation::{
    OptimisationSettings, OptimisationStrategy, OptimiserKind, SocketAddress,
};
use crate::core::models::system::{ModelKind, Molecule};
use crate::core::oniom::{CollectError, OniomCollector, ResultCollector};
use crate::engine::context::DriverContext;
use crate::engine::error::EngineError;
use crate::engine::executor::{ProcessExecutor, ProgramError};
use crate::engine::optimizer::{
    LaunchRequest, OptimizerEndpoint, OptimizerHandle, OptimizerLauncher, OptimizerStatus,
    positions_payload,
};
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::shared::SharedMolecule;
use crate::engine::slot::CalculationSlot;
use nalgebra::{DMatrix, DVector, Point3};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;

pub(crate) fn settings(strategy: OptimisationStrategy) -> OptimisationSettings {
    OptimisationSettings {
        strategy,
        optimiser: OptimiserKind::Bfgs,
        max_cycles: 10,
        thresholds: ConvergenceThresholds::default(),
        socket: SocketAddress::Unix {
            name: "strata_test".into(),
        },
        executable: PathBuf::from("i-pi"),
        work_dir: PathBuf::from("unused"),
        connect_timeout: Duration::from_secs(1),
    }
}

/// A four-carbon chain with a model layer `[0]` over atoms 0 and 1. The cut bond 1–2 is
/// capped by link atom 4. Both layers carry optimisation settings; the model layer uses
/// electronic embedding.
pub(crate) fn chain_molecule() -> Molecule {
    chain_molecule_with(OptimisationStrategy::Micro)
}

pub(crate) fn chain_molecule_with(strategy: OptimisationStrategy) -> Molecule {
    let electronic = Embedding::Electronic {
        scaling_factors: None,
    };
    let mut builder = MoleculeBuilder::new(ModelKind::Oniom);
    for i in 0..4 {
        builder.add_atom(i, Atom::new("C", Point3::new(1.5 * i as f64, 0.0, 0.0)));
    }
    builder
        .add_bond(0, 1)
        .add_bond(1, 2)
        .add_bond(2, 3)
        .root_calculation(
            CalcKey::Original,
            CalcInput {
                optimisation: Some(settings(strategy)),
                ..Default::default()
            },
        )
        .add_layer(
            LayerSpec::new([0, 1])
                .with_calculation(
                    CalcKey::Original,
                    CalcInput {
                        embedding: electronic.clone(),
                        optimisation: Some(settings(strategy)),
                        ..Default::default()
                    },
                )
                .with_calculation(
                    CalcKey::Inherited,
                    CalcInput {
                        embedding: electronic,
                        ..Default::default()
                    },
                ),
        );
    match builder.build() {
        Ok(molecule) => molecule,
        Err(e) => panic!("invalid test molecule: {e}"),
    }
}

/// Answers every calculation with a constant energy, zero derivatives and, optionally, one
/// partial charge per real atom.
struct StubExecutor {
    log: Log,
    charge: f64,
    fail_on: Option<String>,
}

impl ProcessExecutor for StubExecutor {
    fn execute(&self, calc: &CalcId, molecule: &Molecule) -> Result<CalcOutput, ProgramError> {
        self.log.lock().push(format!("calc:{}", calc));
        if self.fail_on.as_deref() == Some(calc.to_string().as_str()) {
            return Err(ProgramError::Failed {
                program: "stub".into(),
                code: Some(1),
                stderr: "scripted failure".into(),
            });
        }

        let layer = molecule.layer(&calc.layer)?;
        let task = molecule.calculation(calc)?.input.task;
        let dim = 3 * layer.atoms.len();
        let multipoles = if self.charge != 0.0 {
            layer
                .real_atoms()
                .into_iter()
                .map(|i| (i, Multipoles::charge(self.charge)))
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(CalcOutput {
            energy: Some(-(layer.atoms.len() as f64)),
            gradient: (task != Task::Energy).then(|| DVector::zeros(dim)),
            hessian: (task == Task::Hessian).then(|| DMatrix::zeros(dim, dim)),
            multipoles,
        })
    }
}

struct RecordingCollector {
    log: Log,
}

impl ResultCollector for RecordingCollector {
    fn collect(
        &self,
        molecule: &Molecule,
        max_depth: Option<usize>,
    ) -> Result<Molecule, CollectError> {
        let label = max_depth.map_or_else(|| "all".to_string(), |d| d.to_string());
        self.log.lock().push(format!("collect:{}", label));
        OniomCollector.collect(molecule, max_depth)
    }
}

/// Shared molecule plus stub collaborators that record every call in one log.
pub(crate) struct Fixture {
    pub shared: SharedMolecule,
    log: Log,
    charge: f64,
    fail_on: Option<String>,
}

impl Fixture {
    pub fn new(molecule: Molecule) -> Self {
        Self {
            shared: SharedMolecule::new(molecule),
            log: Arc::new(Mutex::new(Vec::new())),
            charge: 0.0,
            fail_on: None,
        }
    }

    pub fn with_charges(mut self, charge: f64) -> Self {
        self.charge = charge;
        self
    }

    pub fn failing_on(mut self, calc: &str) -> Self {
        self.fail_on = Some(calc.to_string());
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn with_context<R>(&self, f: impl FnOnce(&DriverContext<'_>) -> R) -> R {
        self.run(None, f)
    }

    pub fn with_launcher<R>(
        &self,
        launcher: &dyn OptimizerLauncher,
        f: impl FnOnce(&DriverContext<'_>) -> R,
    ) -> R {
        self.run(Some(launcher), f)
    }

    fn run<R>(
        &self,
        launcher: Option<&dyn OptimizerLauncher>,
        f: impl FnOnce(&DriverContext<'_>) -> R,
    ) -> R {
        let executor = Arc::new(StubExecutor {
            log: Arc::clone(&self.log),
            charge: self.charge,
            fail_on: self.fail_on.clone(),
        });
        let slot = CalculationSlot::spawn(self.shared.clone(), executor);
        let collector = RecordingCollector {
            log: Arc::clone(&self.log),
        };
        let log = Arc::clone(&self.log);
        let reporter = ProgressReporter::with_callback(Box::new(move |event| {
            match event {
                Progress::ForcesSent { depth } => log.lock().push(format!("push:{}", depth)),
                Progress::ConvergenceRequested { depth } => {
                    log.lock().push(format!("converged:{}", depth))
                }
                _ => {}
            }
        }));

        let mut ctx = DriverContext::new(&self.shared, &slot, &collector, &reporter);
        if let Some(launcher) = launcher {
            ctx = ctx.with_launcher(launcher);
        }
        f(&ctx)
    }
}

/// One request a scripted optimiser makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    /// Forces at the previously proposed geometry.
    Forces,
    /// Forces at the previous geometry shifted along x.
    Displaced,
    Hessian,
    PositionPush,
}

/// Shift applied by [`Request::Displaced`], in Bohr.
pub(crate) const DISPLACEMENT: f64 = 0.2;

/// Launches companions that replay a fixed list of requests per slice, starting from the
/// initial geometry, and then report `Done` once the sentinel appears.
pub(crate) struct ScriptedLauncher {
    dir: tempfile::TempDir,
    scripts: BTreeMap<usize, Vec<Request>>,
    pub endpoints: Mutex<BTreeMap<usize, Arc<OptimizerEndpoint>>>,
}

impl ScriptedLauncher {
    pub fn new(scripts: impl IntoIterator<Item = (usize, Vec<Request>)>) -> Self {
        Self {
            dir: match tempfile::tempdir() {
                Ok(dir) => dir,
                Err(e) => panic!("cannot create temporary directory: {e}"),
            },
            scripts: scripts.into_iter().collect(),
            endpoints: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn endpoint(&self, depth: usize) -> Arc<OptimizerEndpoint> {
        Arc::clone(&self.endpoints.lock()[&depth])
    }
}

impl OptimizerLauncher for ScriptedLauncher {
    fn launch(&self, request: LaunchRequest<'_>) -> Result<OptimizerHandle, EngineError> {
        let work_dir = self.dir.path().join(format!("slice_{}", request.depth));
        fs::create_dir_all(&work_dir).map_err(|e| EngineError::io("test dir", e))?;
        let mut proposal = positions_payload(request.molecule, &request.partition.order)?;
        let endpoint = Arc::new(OptimizerEndpoint::new(
            request.depth,
            work_dir,
            request.partition,
        ));
        self.endpoints
            .lock()
            .insert(request.depth, Arc::clone(&endpoint));

        let script = self.scripts.get(&request.depth).cloned().unwrap_or_default();
        let companion = {
            let endpoint = Arc::clone(&endpoint);
            thread::spawn(move || -> Result<(), EngineError> {
                for step in script {
                    match step {
                        Request::Forces | Request::Displaced | Request::Hessian => {
                            if step == Request::Displaced {
                                for x in proposal.coordinates.iter_mut().step_by(3) {
                                    *x += DISPLACEMENT;
                                }
                            }
                            let status = if step == Request::Hessian {
                                OptimizerStatus::WantHessian
                            } else {
                                OptimizerStatus::WantForces
                            };
                            endpoint.status.put(status)?;
                            endpoint.outbound.put(proposal.clone())?;
                        }
                        Request::PositionPush => {
                            endpoint.status.put(OptimizerStatus::WantPositionPush)?;
                        }
                    }
                    endpoint.inbound.take()?;
                }
                while !endpoint.status.is_closed() {
                    if endpoint.sentinel_present() {
                        endpoint.status.put(OptimizerStatus::Done)?;
                        return Ok(());
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            })
        };

        Ok(OptimizerHandle::new(endpoint).with_companion(companion))
    }
}
