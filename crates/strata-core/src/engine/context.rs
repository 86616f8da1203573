use super::error::EngineError;
use super::optimizer::OptimizerLauncher;
use super::progress::ProgressReporter;
use super::shared::SharedMolecule;
use super::slot::CalculationSlot;
use crate::core::oniom::ResultCollector;

/// Everything a driver needs to run: the shared molecule, the calculation slot that runs
/// external programs, the result collector and, for optimisations, the optimiser launcher.
#[derive(Clone, Copy)]
pub struct DriverContext<'a> {
    pub molecule: &'a SharedMolecule,
    pub slot: &'a CalculationSlot,
    pub collector: &'a dyn ResultCollector,
    pub launcher: Option<&'a dyn OptimizerLauncher>,
    pub reporter: &'a ProgressReporter<'a>,
}

impl<'a> DriverContext<'a> {
    pub fn new(
        molecule: &'a SharedMolecule,
        slot: &'a CalculationSlot,
        collector: &'a dyn ResultCollector,
        reporter: &'a ProgressReporter<'a>,
    ) -> Self {
        Self {
            molecule,
            slot,
            collector,
            launcher: None,
            reporter,
        }
    }

    pub fn with_launcher(mut self, launcher: &'a dyn OptimizerLauncher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub(crate) fn require_launcher(&self) -> Result<&'a dyn OptimizerLauncher, EngineError> {
        self.launcher.ok_or_else(|| {
            EngineError::Configuration("geometry optimisation needs an optimiser launcher".into())
        })
    }
}
