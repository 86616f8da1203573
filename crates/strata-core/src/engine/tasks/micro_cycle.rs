use super::atomic::{collect, recompute_layers, validate};
use crate::core::geometry::{ConvergenceThresholds, GeomConv};
use crate::core::models::calculation::Task;
use crate::core::models::ids::{AtomIndex, CalcId};
use crate::core::models::system::Molecule;
use crate::engine::context::DriverContext;
use crate::engine::error::EngineError;
use crate::engine::motion::{Motion, MotionLog};
use crate::engine::optimizer::{
    AtomPartition, InboundPayload, LaunchRequest, OptimizerHandle, OptimizerLauncher,
    OptimizerStatus, decode_positions, force_payload, positions_payload,
};
use crate::engine::progress::Progress;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

struct SliceOptimizer {
    handle: OptimizerHandle,
    free: BTreeSet<AtomIndex>,
    thresholds: ConvergenceThresholds,
    steps: usize,
    done: bool,
}

struct MicroDriver<'c, 'a> {
    ctx: &'c DriverContext<'a>,
    slices: Vec<SliceOptimizer>,
    motions: MotionLog,
    outer_cycle: usize,
}

/// Optimises the system slice by slice, one external optimiser per slice.
///
/// The recursion starts at the deepest slice. Before every step of slice `d` the layers
/// above it are recomputed and slice `d − 1` is converged with the atoms of slice `d` held
/// at their new positions; only then are the forces of slice `d` evaluated and returned to
/// its optimiser. When the recursion returns, every slice has converged.
#[instrument(skip_all, name = "micro_cycle")]
pub fn run(ctx: &DriverContext<'_>) -> Result<MotionLog, EngineError> {
    let launcher = ctx.require_launcher()?;
    let snapshot = ctx.molecule.snapshot();
    validate(&snapshot)?;

    let slice_count = snapshot.slice_count();
    let mut driver = MicroDriver {
        ctx,
        slices: Vec::with_capacity(slice_count),
        motions: MotionLog::new(),
        outer_cycle: 0,
    };
    for depth in 0..slice_count {
        let slice = launch_slice(launcher, &snapshot, depth)?;
        driver.slices.push(slice);
    }
    info!(slices = slice_count, "Micro-cycle optimisation started.");

    let result = driver.optimize_slice(slice_count as isize - 1);
    driver.teardown();
    result?;

    info!(
        outer_cycles = driver.outer_cycle,
        steps = driver.motions.len(),
        "Micro-cycle optimisation finished."
    );
    Ok(driver.motions)
}

fn launch_slice(
    launcher: &dyn OptimizerLauncher,
    molecule: &Molecule,
    depth: usize,
) -> Result<SliceOptimizer, EngineError> {
    let first = molecule
        .slice_ids(depth)?
        .into_iter()
        .next()
        .ok_or(EngineError::SliceOutOfRange {
            depth,
            slices: molecule.slice_count(),
        })?;
    let settings = molecule
        .calculation(&CalcId::original(first.clone()))?
        .input
        .optimisation
        .clone()
        .ok_or_else(|| {
            EngineError::Configuration(format!(
                "layer {} has no optimisation settings for slice {}",
                first, depth
            ))
        })?;

    let free = molecule.free_atoms_at_depth(depth)?;
    debug!(depth, free = ?free, "Launching slice optimiser.");
    let handle = launcher.launch(LaunchRequest {
        depth,
        settings: &settings,
        molecule,
        partition: AtomPartition::new(molecule, free.clone()),
    })?;

    Ok(SliceOptimizer {
        handle,
        free,
        thresholds: settings.thresholds,
        steps: 0,
        done: false,
    })
}

impl MicroDriver<'_, '_> {
    fn optimize_slice(&mut self, depth: isize) -> Result<(), EngineError> {
        let Ok(d) = usize::try_from(depth) else {
            return Ok(());
        };
        if d >= self.slices.len() {
            return Err(EngineError::SliceOutOfRange {
                depth: d,
                slices: self.slices.len(),
            });
        }
        if self.slices[d].done {
            return Err(EngineError::ProtocolViolation {
                depth: d,
                reason: "slice re-entered after its optimiser reported Done".into(),
            });
        }

        let endpoint = self.slices[d].handle.endpoint.clone();
        loop {
            match endpoint.status.take()? {
                OptimizerStatus::Done => {
                    warn!(depth = d, "Optimiser finished before the slice converged.");
                    self.slices[d].done = true;
                    return Ok(());
                }
                OptimizerStatus::WantPositionPush => {
                    endpoint.outbound.drain();
                    let snapshot = self.ctx.molecule.snapshot();
                    let current = positions_payload(&snapshot, &endpoint.partition.order)?;
                    endpoint.inbound.put(InboundPayload::Positions(current))?;
                }
                OptimizerStatus::WantHessian => {
                    return Err(EngineError::ProtocolViolation {
                        depth: d,
                        reason: "Hessian updates are not supported in micro-iteration mode"
                            .into(),
                    });
                }
                OptimizerStatus::WantForces => {
                    if self.step(d, depth)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One force evaluation for slice `d`. Returns `true` once the slice has converged.
    fn step(&mut self, d: usize, depth: isize) -> Result<bool, EngineError> {
        let ctx = self.ctx;
        let endpoint = self.slices[d].handle.endpoint.clone();
        let before = ctx.molecule.snapshot();

        let geometry = endpoint.outbound.take()?;
        let positions =
            decode_positions(&geometry, &endpoint.partition, &self.slices[d].free, d)?;
        ctx.molecule.modify(|m| m.set_positions(&positions));

        if d > 0 {
            recompute_layers(ctx, |layer_depth| layer_depth < d, Task::Gradient)?;
            collect(ctx, Some(d - 1))?;
        }

        self.optimize_slice(depth - 1)?;

        recompute_layers(ctx, |layer_depth| layer_depth == d, Task::Gradient)?;
        collect(ctx, Some(d))?;

        let after = ctx.molecule.snapshot();
        let slice = &mut self.slices[d];
        let forces = force_payload(&after, &endpoint.partition, &slice.free)?;
        endpoint.inbound.put(InboundPayload::Forces(forces))?;
        ctx.reporter.report(Progress::ForcesSent { depth: d });

        slice.steps += 1;
        let steps = slice.steps;
        if d + 1 == self.slices.len() {
            self.outer_cycle += 1;
        }

        let slice = &self.slices[d];
        let geom_conv = GeomConv::between(&slice.free, &before, &after);
        let converged = geom_conv.converged(&slice.thresholds);
        info!(depth = d, step = steps, converged, "{}", geom_conv);
        self.motions.push(Motion {
            depth: d,
            geom_conv,
            outer_cycle: self.outer_cycle,
            micro_cycle: (d, steps),
        });
        ctx.reporter.report(Progress::OptimisationStep {
            depth: d,
            cycle: steps,
            converged,
        });
        Ok(converged)
    }

    fn teardown(&mut self) {
        for slice in self.slices.iter_mut() {
            let depth = slice.handle.endpoint.depth;
            if let Err(e) = slice.handle.teardown() {
                warn!(depth, "Optimiser teardown failed: {}", e);
            }
        }
    }
}
