use crate::core::geometry::ConvergenceThresholds;
use crate::core::models::calculation::Task;
use crate::core::models::optimisation::{
    OptimisationSettings, OptimisationStrategy, OptimiserKind, SocketAddress,
};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_CYCLES: usize = 100;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// A single-point evaluation of the whole layer tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SinglePointConfig {
    pub task: Task,
}

/// A geometry optimisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptimiseConfig {
    /// Overrides the strategy stored in the root layer's optimisation settings.
    pub strategy: Option<OptimisationStrategy>,
}

#[derive(Default)]
pub struct OptimisationSettingsBuilder {
    strategy: Option<OptimisationStrategy>,
    optimiser: Option<OptimiserKind>,
    max_cycles: Option<usize>,
    thresholds: Option<ConvergenceThresholds>,
    socket: Option<SocketAddress>,
    executable: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    connect_timeout: Option<Duration>,
}

impl OptimisationSettingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(mut self, strategy: OptimisationStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
    pub fn optimiser(mut self, optimiser: OptimiserKind) -> Self {
        self.optimiser = Some(optimiser);
        self
    }
    pub fn max_cycles(mut self, cycles: usize) -> Self {
        self.max_cycles = Some(cycles);
        self
    }
    pub fn thresholds(mut self, thresholds: ConvergenceThresholds) -> Self {
        self.thresholds = Some(thresholds);
        self
    }
    pub fn socket(mut self, socket: SocketAddress) -> Self {
        self.socket = Some(socket);
        self
    }
    pub fn executable(mut self, path: PathBuf) -> Self {
        self.executable = Some(path);
        self
    }
    pub fn work_dir(mut self, path: PathBuf) -> Self {
        self.work_dir = Some(path);
        self
    }
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<OptimisationSettings, ConfigError> {
        let max_cycles = self.max_cycles.unwrap_or(DEFAULT_MAX_CYCLES);
        if max_cycles == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "max_cycles",
                reason: "must be at least 1".to_string(),
            });
        }

        let thresholds = self.thresholds.unwrap_or_default();
        let values = [
            thresholds.rms_force,
            thresholds.max_force,
            thresholds.rms_displacement,
            thresholds.max_displacement,
            thresholds.energy_change,
        ];
        if values.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "thresholds",
                reason: "every threshold must be a positive number".to_string(),
            });
        }

        let socket = self
            .socket
            .ok_or(ConfigError::MissingParameter("socket"))?;
        if let SocketAddress::Unix { name } = &socket {
            if name.is_empty() || name.contains('/') {
                return Err(ConfigError::InvalidParameter {
                    name: "socket",
                    reason: format!("'{}' is not a valid socket name", name),
                });
            }
        }

        Ok(OptimisationSettings {
            strategy: self.strategy.unwrap_or_default(),
            optimiser: self.optimiser.unwrap_or_default(),
            max_cycles,
            thresholds,
            socket,
            executable: self
                .executable
                .ok_or(ConfigError::MissingParameter("executable"))?,
            work_dir: self
                .work_dir
                .ok_or(ConfigError::MissingParameter("work_dir"))?,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> OptimisationSettingsBuilder {
        OptimisationSettingsBuilder::new()
            .socket(SocketAddress::Unix {
                name: "strata".into(),
            })
            .executable(PathBuf::from("i-pi"))
            .work_dir(PathBuf::from("opt"))
    }

    #[test]
    fn build_fills_defaults() {
        let settings = complete().build().unwrap();
        assert_eq!(settings.strategy, OptimisationStrategy::Macro);
        assert_eq!(settings.optimiser, OptimiserKind::Bfgs);
        assert_eq!(settings.max_cycles, DEFAULT_MAX_CYCLES);
        assert_eq!(settings.thresholds, ConvergenceThresholds::default());
        assert_eq!(settings.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn build_fails_on_missing_parameter() {
        let result = OptimisationSettingsBuilder::new()
            .socket(SocketAddress::Unix {
                name: "strata".into(),
            })
            .work_dir(PathBuf::from("opt"))
            .build();
        assert_eq!(result.unwrap_err(), ConfigError::MissingParameter("executable"));

        let result = OptimisationSettingsBuilder::new().build();
        assert_eq!(result.unwrap_err(), ConfigError::MissingParameter("socket"));
    }

    #[test]
    fn build_rejects_invalid_values() {
        assert!(matches!(
            complete().max_cycles(0).build(),
            Err(ConfigError::InvalidParameter {
                name: "max_cycles",
                ..
            })
        ));

        let thresholds = ConvergenceThresholds {
            max_force: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            complete().thresholds(thresholds).build(),
            Err(ConfigError::InvalidParameter {
                name: "thresholds",
                ..
            })
        ));

        assert!(matches!(
            complete()
                .socket(SocketAddress::Unix {
                    name: "a/b".into()
                })
                .build(),
            Err(ConfigError::InvalidParameter { name: "socket", .. })
        ));
    }
}
