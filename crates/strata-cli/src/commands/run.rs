use crate::cli::{JobMode, RunArgs};
use crate::config::{self, JobKind, JobOverrides};
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use std::path::Path;
use std::sync::Arc;
use strata::{
    core::io::xyz::{XyzFile, XyzFrame},
    core::models::system::Molecule,
    engine::executor::{CommandExecutor, ProcessExecutor},
    engine::optimizer::process::IpiLauncher,
    engine::progress::ProgressReporter,
    workflows,
};
use tracing::{info, warn};

pub async fn run(args: RunArgs) -> Result<()> {
    let overrides = JobOverrides {
        geometry: args.xyz.clone(),
        optimise: args.mode.map(|mode| mode == JobMode::Optimise),
        task: args.task.map(Into::into),
        strategy: args.strategy.map(Into::into),
    };
    let job = config::load_job(&args.job, &args.set_values, &overrides)?;
    if overrides.task.is_some() && matches!(job.kind, JobKind::Optimise(_)) {
        return Err(CliError::Argument(
            "--task only applies to single points; the optimiser chooses the derivatives it needs."
                .to_string(),
        ));
    }

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());
    let executor: Arc<dyn ProcessExecutor> = Arc::new(CommandExecutor);

    let (molecule, energy) = match &job.kind {
        JobKind::SinglePoint(single_point) => {
            if overrides.strategy.is_some() {
                warn!("--strategy has no effect on a single point.");
            }
            println!("Starting {} single point...", single_point.task);
            let result = tokio::task::block_in_place(|| {
                workflows::single_point::run(&job.molecule, single_point, executor, &reporter)
            })?;
            (result.molecule, result.energy)
        }
        JobKind::Optimise(optimise) => {
            println!("Starting geometry optimisation...");
            let launcher = IpiLauncher::default();
            let result = tokio::task::block_in_place(|| {
                workflows::optimise::run(&job.molecule, optimise, executor, &launcher, &reporter)
            })?;
            info!(
                strategy = ?result.strategy,
                steps = result.motions.len(),
                "Optimisation workflow returned."
            );
            println!(
                "Optimisation finished after {} step(s) ({:?} strategy).",
                result.motions.len(),
                result.strategy
            );
            if let Some(last) = result.motions.iter().last() {
                println!("  Last step: slice {} {}", last.depth, last.geom_conv);
            }
            let energy = result.molecule.root().derivatives.energy;
            (result.molecule, energy)
        }
    };

    match energy {
        Some(energy) => println!("✓ ONIOM energy: {:.10} Eh", energy),
        None => println!("Warning: no ONIOM energy was collected."),
    }

    if let Some(output) = &args.output {
        write_geometry(&molecule, energy, output)?;
        println!("✓ Final geometry written to: {}", output.display());
    }

    Ok(())
}

fn write_geometry(molecule: &Molecule, energy: Option<f64>, path: &Path) -> Result<()> {
    let comment = match energy {
        Some(energy) => format!("ONIOM energy {:.10}", energy),
        None => "ONIOM geometry".to_string(),
    };
    let frame = XyzFrame::from_atoms(&comment, molecule.root().atoms.values());
    info!("Writing {} atoms to {:?}", frame.atoms.len(), path);
    XyzFile::write_to_path(&frame, path).map_err(|e| CliError::FileParsing {
        path: path.to_path_buf(),
        source: e.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;
    use strata::core::models::atom::Atom;
    use strata::core::models::builder::{LayerSpec, MoleculeBuilder};
    use strata::core::models::system::ModelKind;

    #[test]
    fn final_geometry_skips_link_atoms() {
        let mut builder = MoleculeBuilder::new(ModelKind::Oniom);
        builder
            .add_atom(0, Atom::new("C", Point3::new(0.0, 0.0, 0.0)))
            .add_atom(1, Atom::new("O", Point3::new(1.4, 0.0, 0.0)))
            .add_bond(0, 1)
            .add_layer(LayerSpec::new([0]));
        let molecule = builder.build().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("final.xyz");
        write_geometry(&molecule, Some(-1.5), &path).unwrap();

        let frame = XyzFile::read_from_path(&path).unwrap();
        assert_eq!(frame.atoms.len(), 2);
        assert_eq!(frame.atoms[1].0, "O");
        assert!(frame.comment.contains("-1.5"));
    }
}
