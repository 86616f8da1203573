use super::atomic::{full_traversal, validate};
use crate::core::geometry::GeomConv;
use crate::core::models::calculation::Task;
use crate::core::models::ids::{CalcId, LayerId};
use crate::core::models::optimisation::OptimisationSettings;
use crate::engine::context::DriverContext;
use crate::engine::error::EngineError;
use crate::engine::motion::{Motion, MotionLog};
use crate::engine::optimizer::{
    AtomPartition, InboundPayload, LaunchRequest, OptimizerStatus, decode_positions,
    force_payload, hessian_payload, positions_payload,
};
use crate::engine::progress::Progress;
use tracing::{info, instrument, warn};

/// Optimisation settings stored on the root layer's original calculation.
pub(crate) fn root_settings(ctx: &DriverContext<'_>) -> Result<OptimisationSettings, EngineError> {
    let snapshot = ctx.molecule.snapshot();
    snapshot
        .calculation(&CalcId::original(LayerId::root()))?
        .input
        .optimisation
        .clone()
        .ok_or_else(|| {
            EngineError::Configuration("the root layer has no optimisation settings".into())
        })
}

/// Optimises every real atom of the system with a single external optimiser.
///
/// Each force request triggers a full traversal of the layer tree. When a step changes the
/// geometry by less than the root thresholds the sentinel is written and the driver keeps
/// serving the optimiser until it reports `Done`.
#[instrument(skip_all, name = "macro_cycle")]
pub fn run(ctx: &DriverContext<'_>) -> Result<MotionLog, EngineError> {
    let launcher = ctx.require_launcher()?;
    let snapshot = ctx.molecule.snapshot();
    validate(&snapshot)?;
    let settings = root_settings(ctx)?;

    let partition = AtomPartition::new(&snapshot, snapshot.real_atoms());
    let mut handle = launcher.launch(LaunchRequest {
        depth: 0,
        settings: &settings,
        molecule: &snapshot,
        partition,
    })?;
    let endpoint = handle.endpoint.clone();
    let partition = &endpoint.partition;

    let mut motions = MotionLog::new();
    let mut cycle = 0;
    info!(atoms = partition.free.len(), "Macro-cycle optimisation started.");

    loop {
        let status = endpoint.status.take()?;
        match status {
            OptimizerStatus::Done => break,
            OptimizerStatus::WantPositionPush => {
                endpoint.outbound.drain();
                let current = positions_payload(&ctx.molecule.snapshot(), &partition.order)?;
                endpoint.inbound.put(InboundPayload::Positions(current))?;
            }
            OptimizerStatus::WantForces | OptimizerStatus::WantHessian => {
                let before = ctx.molecule.snapshot();
                let geometry = endpoint.outbound.take()?;
                let positions = decode_positions(&geometry, partition, &partition.free, 0)?;
                ctx.molecule.modify(|m| m.set_positions(&positions));

                let hessian = status == OptimizerStatus::WantHessian;
                full_traversal(ctx, if hessian { Task::Hessian } else { Task::Gradient })?;

                let after = ctx.molecule.snapshot();
                let payload = if hessian {
                    InboundPayload::Hessian(hessian_payload(&after, partition, &partition.free)?)
                } else {
                    InboundPayload::Forces(force_payload(&after, partition, &partition.free)?)
                };
                endpoint.inbound.put(payload)?;
                ctx.reporter.report(Progress::ForcesSent { depth: 0 });

                cycle += 1;
                let geom_conv = GeomConv::between(&partition.free, &before, &after);
                let converged = geom_conv.converged(&settings.thresholds);
                info!(cycle, converged, "{}", geom_conv);
                if converged {
                    endpoint.request_convergence()?;
                    ctx.reporter
                        .report(Progress::ConvergenceRequested { depth: 0 });
                }
                motions.push(Motion {
                    depth: 0,
                    geom_conv,
                    outer_cycle: cycle,
                    micro_cycle: (0, 0),
                });
                ctx.reporter.report(Progress::OptimisationStep {
                    depth: 0,
                    cycle,
                    converged,
                });
            }
        }
    }

    if let Err(e) = handle.teardown() {
        warn!("Optimiser teardown failed: {}", e);
    }
    info!(steps = cycle, "Macro-cycle optimisation finished.");
    Ok(motions)
}
