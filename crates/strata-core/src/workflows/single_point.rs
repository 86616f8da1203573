use crate::core::models::system::Molecule;
use crate::core::oniom::OniomCollector;
use crate::engine::config::SinglePointConfig;
use crate::engine::context::DriverContext;
use crate::engine::error::EngineError;
use crate::engine::executor::ProcessExecutor;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::shared::SharedMolecule;
use crate::engine::slot::CalculationSlot;
use crate::engine::tasks::atomic;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct SinglePointResult {
    /// The molecule with every calculation output and the collected ONIOM derivatives.
    pub molecule: Molecule,
    pub energy: Option<f64>,
}

#[instrument(skip_all, name = "single_point_workflow", fields(task = %config.task))]
pub fn run(
    molecule: &Molecule,
    config: &SinglePointConfig,
    executor: Arc<dyn ProcessExecutor>,
    reporter: &ProgressReporter,
) -> Result<SinglePointResult, EngineError> {
    reporter.report(Progress::PhaseStart {
        name: "Preparation",
    });
    atomic::validate(molecule)?;
    let shared = SharedMolecule::new(molecule.clone());
    let slot = CalculationSlot::spawn(shared.clone(), executor);
    let collector = OniomCollector;
    let ctx = DriverContext::new(&shared, &slot, &collector, reporter);
    info!(
        layers = molecule.layer_ids().len(),
        calculations = molecule.calc_ids().len(),
        "Single point prepared."
    );
    reporter.report(Progress::PhaseFinish);

    reporter.report(Progress::PhaseStart { name: "Evaluation" });
    atomic::full_traversal(&ctx, config.task)?;
    reporter.report(Progress::PhaseFinish);

    slot.shutdown();
    let molecule = Molecule::clone(&shared.snapshot());
    let energy = molecule.root().derivatives.energy;
    if let Some(energy) = energy {
        info!(energy, "Single point finished.");
    }
    Ok(SinglePointResult { molecule, energy })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::atom::Atom;
    use crate::core::models::builder::{LayerSpec, MoleculeBuilder};
    use crate::core::models::calculation::{CalcInput, CalcOutput, Task};
    use crate::core::models::ids::{CalcId, CalcKey};
    use crate::core::models::system::ModelKind;
    use crate::engine::executor::ProgramError;
    use nalgebra::{DVector, Point3};
    use std::sync::Mutex;

    /// Energy equals minus the number of atoms in the layer, scaled by 2 for inherited runs.
    struct CountingExecutor;

    impl ProcessExecutor for CountingExecutor {
        fn execute(&self, calc: &CalcId, molecule: &Molecule) -> Result<CalcOutput, ProgramError> {
            let layer = molecule.layer(&calc.layer)?;
            let n = layer.atoms.len() as f64;
            let energy = match calc.key {
                CalcKey::Original => -n,
                CalcKey::Inherited => -2.0 * n,
            };
            Ok(CalcOutput {
                energy: Some(energy),
                gradient: Some(DVector::zeros(3 * layer.atoms.len())),
                ..Default::default()
            })
        }
    }

    fn molecule() -> Molecule {
        let mut builder = MoleculeBuilder::new(ModelKind::Oniom);
        for i in 0..3 {
            builder.add_atom(i, Atom::new("C", Point3::new(1.5 * i as f64, 0.0, 0.0)));
        }
        builder
            .add_bond(0, 1)
            .add_bond(1, 2)
            .root_calculation(CalcKey::Original, CalcInput::default())
            .add_layer(
                LayerSpec::new([0])
                    .with_calculation(CalcKey::Original, CalcInput::default())
                    .with_calculation(CalcKey::Inherited, CalcInput::default()),
            );
        builder.build().unwrap()
    }

    #[test]
    fn single_point_collects_the_oniom_energy() {
        let input = molecule();
        let result = run(
            &input,
            &SinglePointConfig {
                task: Task::Gradient,
            },
            Arc::new(CountingExecutor),
            &ProgressReporter::new(),
        )
        .unwrap();

        // Root: 3 atoms. Model layer: atom 0 plus one link atom.
        let expected = -3.0 + (-2.0 - -4.0);
        assert!((result.energy.unwrap() - expected).abs() < 1e-12);
        assert!(result.molecule.root().derivatives.gradient.is_some());
        assert!(input.root().derivatives.energy.is_none());
    }

    #[test]
    fn phases_are_reported_in_order() {
        let phases = Mutex::new(Vec::new());
        let reporter = ProgressReporter::with_callback(Box::new(|event| {
            if let Progress::PhaseStart { name } = event {
                phases.lock().unwrap().push(name);
            }
        }));
        run(
            &molecule(),
            &SinglePointConfig::default(),
            Arc::new(CountingExecutor),
            &reporter,
        )
        .unwrap();
        assert_eq!(*phases.lock().unwrap(), vec!["Preparation", "Evaluation"]);
    }

    #[test]
    fn invalid_models_fail_before_any_calculation() {
        let mut input = molecule();
        input.kind = ModelKind::Single;
        let result = run(
            &input,
            &SinglePointConfig::default(),
            Arc::new(CountingExecutor),
            &ProgressReporter::new(),
        );
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }
}
