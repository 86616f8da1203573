use std::path::PathBuf;
use std::time::Duration;
use strata::core::models::builder::DEFAULT_G_FACTOR;
use strata::core::models::calculation::Task;
use strata::core::models::optimisation::{OptimisationStrategy, OptimiserKind};
use strata::core::topology::guess::DEFAULT_BOND_TOLERANCE;
use strata::engine::config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CYCLES};

pub struct DefaultsConfig {
    pub task: Task,
    pub multiplicity: u32,
    pub bond_tolerance: f64,
    pub link_element: String,
    pub g_factor: f64,
    pub strategy: OptimisationStrategy,
    pub optimiser: OptimiserKind,
    pub max_cycles: usize,
    pub socket_name: String,
    pub executable: PathBuf,
    pub work_dir: PathBuf,
    pub connect_timeout: Duration,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            task: Task::Energy,
            multiplicity: 1,
            bond_tolerance: DEFAULT_BOND_TOLERANCE,
            link_element: "H".to_string(),
            g_factor: DEFAULT_G_FACTOR,
            strategy: OptimisationStrategy::Macro,
            optimiser: OptimiserKind::Bfgs,
            max_cycles: DEFAULT_MAX_CYCLES,
            socket_name: "strata".to_string(),
            executable: PathBuf::from("i-pi"),
            work_dir: PathBuf::from("optimiser"),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}
