use crate::core::geometry::ConvergenceThresholds;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// How a geometry optimisation is organised over the layer tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimisationStrategy {
    /// One optimiser moves every atom of the complete system at once.
    #[default]
    Macro,
    /// One optimiser per horizontal slice; inner slices are converged before each outer step.
    Micro,
}

/// Step algorithm requested from the external optimiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimiserKind {
    #[default]
    Bfgs,
    Lbfgs,
    ConjugateGradient,
    SteepestDescent,
}

impl OptimiserKind {
    /// Mode keyword understood by i-PI.
    pub fn ipi_mode(&self) -> &'static str {
        match self {
            Self::Bfgs => "bfgs",
            Self::Lbfgs => "lbfgs",
            Self::ConjugateGradient => "cg",
            Self::SteepestDescent => "sd",
        }
    }
}

/// Where the optimiser process and its companion meet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    /// Unix domain socket `/tmp/ipi_<name>`.
    Unix { name: String },
    /// TCP socket.
    Inet { host: String, port: u16 },
}

impl SocketAddress {
    /// Returns a copy of the address that is unique for the given slice depth.
    pub fn for_slice(&self, depth: usize) -> Self {
        match self {
            Self::Unix { name } => Self::Unix {
                name: format!("{}_{}", name, depth),
            },
            Self::Inet { host, port } => Self::Inet {
                host: host.clone(),
                port: port.saturating_add(depth as u16),
            },
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { name } => write!(f, "unix:/tmp/ipi_{}", name),
            Self::Inet { host, port } => write!(f, "inet:{}:{}", host, port),
        }
    }
}

/// Settings of one external geometry optimiser.
///
/// Attached to the `Original` calculation input of a layer. The root layer's settings select
/// the strategy; in micro-iteration mode the first layer of every horizontal slice provides
/// that slice's optimiser.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisationSettings {
    pub strategy: OptimisationStrategy,
    pub optimiser: OptimiserKind,
    /// Upper bound on optimiser steps, enforced by the optimiser process.
    pub max_cycles: usize,
    pub thresholds: ConvergenceThresholds,
    pub socket: SocketAddress,
    /// Optimiser executable (e.g. `i-pi`).
    pub executable: PathBuf,
    /// Working directory in which the optimiser runs and polls for sentinel files.
    pub work_dir: PathBuf,
    /// How long to wait for the optimiser to accept the companion connection.
    pub connect_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_addresses_are_distinct() {
        let unix = SocketAddress::Unix {
            name: "strata".into(),
        };
        assert_eq!(unix.for_slice(2).to_string(), "unix:/tmp/ipi_strata_2");

        let inet = SocketAddress::Inet {
            host: "localhost".into(),
            port: 31415,
        };
        assert_eq!(
            inet.for_slice(1),
            SocketAddress::Inet {
                host: "localhost".into(),
                port: 31416
            }
        );
    }

    #[test]
    fn optimiser_modes_match_ipi_keywords() {
        assert_eq!(OptimiserKind::Bfgs.ipi_mode(), "bfgs");
        assert_eq!(OptimiserKind::SteepestDescent.ipi_mode(), "sd");
    }
}
