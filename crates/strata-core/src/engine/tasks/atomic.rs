use crate::core::models::calculation::{CalcOutput, Task};
use crate::core::models::ids::{CalcId, CalcKey, LayerId};
use crate::core::models::system::{ModelKind, Molecule};
use crate::core::polarisation::polarisation_for;
use crate::engine::context::DriverContext;
use crate::engine::error::EngineError;
use crate::engine::progress::Progress;
use tracing::{debug, instrument, trace};

/// Runs one calculation and commits its output to the shared molecule.
///
/// Three transactions are applied in order: the previous output is cleared and `task`
/// assigned, the layer's point-charge cloud is rebuilt from the layers above (left as is for
/// the root and for mechanical embedding), and the slot commits the program's output.
/// Readers may observe the intermediate states.
#[instrument(skip_all, fields(calc = %calc, task = %task))]
pub fn run_calculation(
    ctx: &DriverContext<'_>,
    calc: &CalcId,
    task: Task,
) -> Result<(), EngineError> {
    ctx.reporter.report(Progress::CalculationStart { calc: calc.clone() });

    ctx.molecule.transaction(|m| -> Result<(), EngineError> {
        let context = m.calculation_mut(calc)?;
        context.output = CalcOutput::default();
        context.input.task = task;
        Ok(())
    })?;

    ctx.molecule.transaction(|m| -> Result<(), EngineError> {
        if let Some(cloud) = polarisation_for(m, calc)? {
            trace!(sites = cloud.len(), "Polarisation applied.");
            m.layer_mut(&calc.layer)?.polarisation = cloud;
        }
        Ok(())
    })?;

    ctx.slot.submit(calc.clone())?;

    ctx.reporter.report(Progress::CalculationFinish { calc: calc.clone() });
    Ok(())
}

/// Copies the multipoles computed by `calc` onto the atoms of its layer.
fn transfer_multipoles(ctx: &DriverContext<'_>, calc: &CalcId) -> Result<(), EngineError> {
    ctx.molecule.transaction(|m| -> Result<(), EngineError> {
        let multipoles = m.calculation(calc)?.output.multipoles.clone();
        let layer = m.layer_mut(&calc.layer)?;
        for (index, value) in multipoles {
            if let Some(atom) = layer.atoms.get_mut(&index) {
                atom.multipoles = value;
            }
        }
        Ok(())
    })
}

/// Checks that `molecule` can be driven layer by layer.
pub fn validate(molecule: &Molecule) -> Result<(), EngineError> {
    if molecule.kind != ModelKind::Oniom {
        return Err(EngineError::Configuration(format!(
            "layer drivers need an ONIOM model, found {:?}",
            molecule.kind
        )));
    }
    molecule.fold(Ok(()), |acc, id, layer| {
        acc?;
        if !layer.calculations.contains_key(&CalcKey::Original) {
            return Err(EngineError::Configuration(format!(
                "layer {} has no original calculation",
                id
            )));
        }
        if !id.is_root() && !layer.calculations.contains_key(&CalcKey::Inherited) {
            return Err(EngineError::Configuration(format!(
                "layer {} has no inherited calculation",
                id
            )));
        }
        Ok(())
    })
}

/// Runs every calculation of the layers whose depth satisfies `include`, in pre-order.
///
/// Multipoles of each original calculation are copied onto its layer as soon as it finishes,
/// so deeper layers are polarised by up-to-date charges. Results are not collected.
pub fn recompute_layers<F>(ctx: &DriverContext<'_>, include: F, task: Task) -> Result<(), EngineError>
where
    F: Fn(usize) -> bool,
{
    let snapshot = ctx.molecule.snapshot();
    let layers: Vec<LayerId> = snapshot
        .layer_ids()
        .into_iter()
        .filter(|id| include(id.depth()))
        .collect();

    for id in layers {
        let keys: Vec<CalcKey> = snapshot.layer(&id)?.calculations.keys().copied().collect();
        for key in keys {
            let calc = CalcId::new(id.clone(), key);
            run_calculation(ctx, &calc, task)?;
            if key == CalcKey::Original {
                transfer_multipoles(ctx, &calc)?;
            }
        }
    }
    Ok(())
}

/// Combines the raw outputs of all layers down to `max_depth` into ONIOM results.
pub fn collect(ctx: &DriverContext<'_>, max_depth: Option<usize>) -> Result<(), EngineError> {
    ctx.molecule.transaction(|m| -> Result<(), EngineError> {
        *m = ctx.collector.collect(m, max_depth)?;
        Ok(())
    })?;
    debug!(?max_depth, "Results collected.");
    Ok(())
}

/// Evaluates the whole layer tree top-down and collects the ONIOM result.
#[instrument(skip_all, name = "full_traversal", fields(task = %task))]
pub fn full_traversal(ctx: &DriverContext<'_>, task: Task) -> Result<(), EngineError> {
    validate(&ctx.molecule.snapshot())?;
    recompute_layers(ctx, |_| true, task)?;
    collect(ctx, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::atom::Multipoles;
    use crate::core::models::calculation::Embedding;
    use crate::core::polarisation::PointCharge;
    use crate::engine::tasks::testing::{Fixture, chain_molecule};
    use nalgebra::Point3;

    #[test]
    fn full_traversal_visits_layers_in_pre_order() {
        let fixture = Fixture::new(chain_molecule());
        fixture.with_context(|ctx| full_traversal(ctx, Task::Energy)).unwrap();
        assert_eq!(
            fixture.log(),
            vec![
                "calc:/:original",
                "calc:/0:original",
                "calc:/0:inherited",
                "collect:all",
            ]
        );
    }

    #[test]
    fn full_traversal_is_idempotent() {
        let fixture = Fixture::new(chain_molecule());
        fixture.with_context(|ctx| full_traversal(ctx, Task::Energy)).unwrap();
        let first = fixture.shared.snapshot().root().derivatives.energy;
        fixture.with_context(|ctx| full_traversal(ctx, Task::Energy)).unwrap();
        let second = fixture.shared.snapshot().root().derivatives.energy;
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn gradient_traversal_fills_the_root_gradient() {
        let fixture = Fixture::new(chain_molecule());
        fixture.with_context(|ctx| full_traversal(ctx, Task::Gradient)).unwrap();
        let snapshot = fixture.shared.snapshot();
        let gradient = snapshot.root().derivatives.gradient.as_ref().unwrap();
        assert_eq!(gradient.len(), 3 * snapshot.root().atoms.len());
        let calc = CalcId::inherited(LayerId::from(vec![0]));
        assert_eq!(snapshot.calculation(&calc).unwrap().input.task, Task::Gradient);
    }

    #[test]
    fn original_multipoles_reach_the_layer_atoms() {
        let fixture = Fixture::new(chain_molecule()).with_charges(0.5);
        fixture.with_context(|ctx| full_traversal(ctx, Task::Energy)).unwrap();
        let snapshot = fixture.shared.snapshot();
        assert_eq!(snapshot.root().atoms[&3].multipoles, Multipoles::charge(0.5));
    }

    #[test]
    fn electronic_embedding_polarises_inner_layers_only() {
        let fixture = Fixture::new(chain_molecule()).with_charges(0.5);
        fixture.with_context(|ctx| full_traversal(ctx, Task::Energy)).unwrap();
        let snapshot = fixture.shared.snapshot();
        assert!(snapshot.root().polarisation.is_empty());
        let inner = snapshot.layer(&LayerId::from(vec![0])).unwrap();
        assert!(inner.polarisation.contains_key(&3));
        assert!(!inner.polarisation.contains_key(&0));
    }

    #[test]
    fn mechanical_embedding_keeps_the_existing_cloud() {
        let inner_id = LayerId::from(vec![0]);
        let mut molecule = chain_molecule();
        let inner = molecule.layer_mut(&inner_id).unwrap();
        for context in inner.calculations.values_mut() {
            context.input.embedding = Embedding::Mechanical;
        }
        let site = PointCharge {
            position: Point3::new(9.0, 0.0, 0.0),
            multipoles: Multipoles::charge(-0.25),
        };
        inner.polarisation.insert(3, site);
        let fixture = Fixture::new(molecule).with_charges(0.5);

        fixture.with_context(|ctx| full_traversal(ctx, Task::Energy)).unwrap();

        let snapshot = fixture.shared.snapshot();
        let inner = snapshot.layer(&inner_id).unwrap();
        assert_eq!(inner.polarisation.len(), 1);
        assert_eq!(inner.polarisation[&3], site);
    }

    #[test]
    fn single_models_are_rejected() {
        let mut molecule = chain_molecule();
        molecule.kind = ModelKind::Single;
        let fixture = Fixture::new(molecule);
        let err = fixture
            .with_context(|ctx| full_traversal(ctx, Task::Energy))
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(fixture.log().is_empty());
    }

    #[test]
    fn missing_inherited_calculation_is_a_configuration_error() {
        let mut molecule = chain_molecule();
        molecule
            .layer_mut(&LayerId::from(vec![0]))
            .unwrap()
            .calculations
            .remove(&CalcKey::Inherited);
        let fixture = Fixture::new(molecule);
        assert!(matches!(
            fixture.with_context(|ctx| full_traversal(ctx, Task::Energy)),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn program_failure_aborts_the_traversal() {
        let fixture = Fixture::new(chain_molecule()).failing_on("/0:original");
        let err = fixture
            .with_context(|ctx| full_traversal(ctx, Task::Energy))
            .unwrap_err();
        assert!(matches!(err, EngineError::ExternalProgram { .. }));
        assert_eq!(fixture.log(), vec!["calc:/:original", "calc:/0:original"]);
    }
}
