use super::error::EngineError;
use super::executor::{ProcessExecutor, ProgramError};
use super::handoff::HandoffCell;
use super::shared::SharedMolecule;
use crate::core::models::ids::CalcId;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Response = Result<(), EngineError>;

/// Serialises external program runs.
///
/// A single background worker owns the process executor. [`CalculationSlot::submit`] hands it
/// one calculation through a single-slot cell and blocks until the worker has committed the
/// output to the shared molecule, so at most one external program runs at any time no matter
/// how many threads submit.
pub struct CalculationSlot {
    requests: Arc<HandoffCell<CalcId>>,
    responses: Arc<HandoffCell<Response>>,
    gate: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CalculationSlot {
    pub fn spawn(molecule: SharedMolecule, executor: Arc<dyn ProcessExecutor>) -> Self {
        let requests = Arc::new(HandoffCell::new());
        let responses = Arc::new(HandoffCell::new());

        let worker = {
            let requests = Arc::clone(&requests);
            let responses = Arc::clone(&responses);
            thread::Builder::new()
                .name("calculation-slot".into())
                .spawn(move || worker_loop(&requests, &responses, &molecule, executor.as_ref()))
        };

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to start calculation worker: {}", e);
                requests.close();
                responses.close();
                None
            }
        };

        Self {
            requests,
            responses,
            gate: Mutex::new(()),
            worker: Mutex::new(worker),
        }
    }

    /// Runs `calc` and blocks until its output is committed. Errors of the external program
    /// are returned unchanged; nothing is retried.
    pub fn submit(&self, calc: CalcId) -> Result<(), EngineError> {
        let _gate = self.gate.lock();
        self.requests.put(calc)?;
        self.responses.take()?
    }

    /// Stops the worker after its current calculation. Later submissions fail.
    pub fn shutdown(&self) {
        self.requests.close();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Calculation worker terminated abnormally.");
            }
        }
        self.responses.close();
    }
}

impl Drop for CalculationSlot {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    requests: &HandoffCell<CalcId>,
    responses: &HandoffCell<Response>,
    molecule: &SharedMolecule,
    executor: &dyn ProcessExecutor,
) {
    while let Ok(calc) = requests.take() {
        debug!(calc = %calc, "Dispatching calculation.");
        let snapshot = molecule.snapshot();

        let outcome = catch_unwind(AssertUnwindSafe(|| executor.execute(&calc, &snapshot)))
            .unwrap_or_else(|_| {
                Err(ProgramError::InvalidOutput(
                    "process executor panicked".to_string(),
                ))
            });

        let response = match outcome {
            Ok(output) => molecule.transaction(|m| -> Result<(), EngineError> {
                m.calculation_mut(&calc)?.output = output;
                Ok(())
            }),
            Err(source) => Err(EngineError::ExternalProgram {
                calc_id: calc.clone(),
                source,
            }),
        };

        if responses.put(response).is_err() {
            break;
        }
    }
    debug!("Calculation worker stopped.");
}
