use crate::core::models::ids::CalcId;

#[derive(Debug, Clone)]
pub enum Progress {
    PhaseStart { name: &'static str },
    PhaseFinish,

    CalculationStart { calc: CalcId },
    CalculationFinish { calc: CalcId },

    OptimisationStep {
        depth: usize,
        cycle: usize,
        converged: bool,
    },
    ForcesSent { depth: usize },
    ConvergenceRequested { depth: usize },

    Message(String),
}

pub type ProgressCallback<'a> = Box<dyn Fn(Progress) + Send + Sync + 'a>;

#[derive(Default)]
pub struct ProgressReporter<'a> {
    callback: Option<ProgressCallback<'a>>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: ProgressCallback<'a>) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    /// Forwards `event` to the callback. A panicking callback is contained so that
    /// reporting can never abort a run.
    #[inline]
    pub fn report(&self, event: Progress) {
        if let Some(cb) = &self.callback {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(event)));
            if outcome.is_err() {
                tracing::warn!("Progress callback panicked; event dropped.");
            }
        }
    }
}
