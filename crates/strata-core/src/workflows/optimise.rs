use crate::core::models::ids::{CalcId, LayerId};
use crate::core::models::optimisation::OptimisationStrategy;
use crate::core::models::system::Molecule;
use crate::core::oniom::OniomCollector;
use crate::engine::config::OptimiseConfig;
use crate::engine::context::DriverContext;
use crate::engine::error::EngineError;
use crate::engine::executor::ProcessExecutor;
use crate::engine::motion::MotionLog;
use crate::engine::optimizer::OptimizerLauncher;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::shared::SharedMolecule;
use crate::engine::slot::CalculationSlot;
use crate::engine::tasks::{atomic, macro_cycle, micro_cycle};
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct OptimisationResult {
    /// The optimised molecule with the derivatives of the last evaluation.
    pub molecule: Molecule,
    pub motions: MotionLog,
    pub strategy: OptimisationStrategy,
}

/// Picks the strategy: an explicit override wins over the root layer's settings.
pub fn resolve_strategy(
    molecule: &Molecule,
    config: &OptimiseConfig,
) -> Result<OptimisationStrategy, EngineError> {
    if let Some(strategy) = config.strategy {
        return Ok(strategy);
    }
    molecule
        .calculation(&CalcId::original(LayerId::root()))?
        .input
        .optimisation
        .as_ref()
        .map(|settings| settings.strategy)
        .ok_or_else(|| {
            EngineError::Configuration("the root layer has no optimisation settings".into())
        })
}

#[instrument(skip_all, name = "optimise_workflow")]
pub fn run(
    molecule: &Molecule,
    config: &OptimiseConfig,
    executor: Arc<dyn ProcessExecutor>,
    launcher: &dyn OptimizerLauncher,
    reporter: &ProgressReporter,
) -> Result<OptimisationResult, EngineError> {
    reporter.report(Progress::PhaseStart {
        name: "Preparation",
    });
    atomic::validate(molecule)?;
    let strategy = resolve_strategy(molecule, config)?;
    let shared = SharedMolecule::new(molecule.clone());
    let slot = CalculationSlot::spawn(shared.clone(), executor);
    let collector = OniomCollector;
    let ctx = DriverContext::new(&shared, &slot, &collector, reporter).with_launcher(launcher);
    info!(
        ?strategy,
        slices = molecule.slice_count(),
        "Optimisation prepared."
    );
    reporter.report(Progress::PhaseFinish);

    reporter.report(Progress::PhaseStart {
        name: "Optimisation",
    });
    let motions = match strategy {
        OptimisationStrategy::Macro => macro_cycle::run(&ctx)?,
        OptimisationStrategy::Micro => micro_cycle::run(&ctx)?,
    };
    reporter.report(Progress::PhaseFinish);

    slot.shutdown();
    let molecule = Molecule::clone(&shared.snapshot());
    info!(
        steps = motions.len(),
        energy = ?molecule.root().derivatives.energy,
        "Optimisation finished."
    );
    Ok(OptimisationResult {
        molecule,
        motions,
        strategy,
    })
}
