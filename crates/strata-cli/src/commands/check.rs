use crate::cli::CheckArgs;
use crate::config::{self, JobKind, JobOverrides};
use crate::error::Result;
use std::fmt::Write;
use strata::core::models::system::Molecule;
use strata::engine::error::EngineError;
use strata::engine::tasks::atomic;
use tracing::info;

pub fn run(args: CheckArgs) -> Result<()> {
    let overrides = JobOverrides {
        geometry: args.xyz.clone(),
        ..Default::default()
    };
    let job = config::load_job(&args.job, &args.set_values, &overrides)?;

    atomic::validate(&job.molecule)?;
    info!("Job file {:?} is valid.", &args.job);

    println!("Geometry: {}", job.geometry.display());
    match &job.kind {
        JobKind::SinglePoint(single_point) => println!("Job: {} single point", single_point.task),
        JobKind::Optimise(_) => println!("Job: geometry optimisation"),
    }
    print!("{}", layout_report(&job.molecule)?);
    Ok(())
}

/// Describes every layer and the free atoms of every horizontal slice.
fn layout_report(molecule: &Molecule) -> std::result::Result<String, EngineError> {
    let mut out = String::new();
    let _ = writeln!(out, "Layers:");
    for id in molecule.layer_ids() {
        let layer = molecule.layer(&id)?;
        let calcs: Vec<String> = layer.calculations.keys().map(ToString::to_string).collect();
        let _ = writeln!(
            out,
            "  {:<8} {:>5} atoms {:>3} link  [{}]",
            id.to_string(),
            layer.real_atoms().len(),
            layer.link_atoms().len(),
            calcs.join(", ")
        );
    }
    let _ = writeln!(out, "Slices:");
    for depth in 0..molecule.slice_count() {
        let free = molecule.free_atoms_at_depth(depth)?;
        let indices: Vec<String> = free.iter().map(ToString::to_string).collect();
        let _ = writeln!(out, "  {:<3} free: {}", depth, indices.join(" "));
    }
    Ok(out)
}
