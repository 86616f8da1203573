use super::atom::Multipoles;
use super::ids::AtomIndex;
use super::optimisation::OptimisationSettings;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Default scaling factors applied to embedding multipoles at increasing bond separation from
/// a layer boundary.
pub const DEFAULT_SCALING_FACTORS: [f64; 4] = [0.2, 0.4, 0.6, 0.8];

/// The derivative order requested from an external program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Task {
    #[default]
    Energy,
    Gradient,
    Hessian,
}

#[derive(Debug, Error)]
#[error("Invalid task '{0}'. Expected 'energy', 'gradient' or 'hessian'.")]
pub struct ParseTaskError(String);

impl FromStr for Task {
    type Err = ParseTaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "energy" => Ok(Self::Energy),
            "gradient" | "forces" => Ok(Self::Gradient),
            "hessian" | "frequency" => Ok(Self::Hessian),
            _ => Err(ParseTaskError(s.to_string())),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Energy => write!(f, "energy"),
            Self::Gradient => write!(f, "gradient"),
            Self::Hessian => write!(f, "hessian"),
        }
    }
}

/// How the surroundings of a layer enter its calculation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum Embedding {
    /// The layer is computed in vacuum; the environment only acts through the ONIOM
    /// subtraction.
    #[default]
    Mechanical,
    /// Multipoles of the layers above are included as a point-charge cloud. Multipoles close
    /// to the boundary are damped by `scaling_factors`, indexed by bond separation.
    Electronic { scaling_factors: Option<Vec<f64>> },
}

impl Embedding {
    /// Returns the effective scaling factors, or `None` for mechanical embedding.
    pub fn scaling_factors(&self) -> Option<&[f64]> {
        match self {
            Self::Mechanical => None,
            Self::Electronic {
                scaling_factors: Some(factors),
            } => Some(factors),
            Self::Electronic {
                scaling_factors: None,
            } => Some(&DEFAULT_SCALING_FACTORS),
        }
    }
}

/// The external program wrapper that evaluates a calculation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Software {
    /// Executable invoked for the calculation.
    pub command: PathBuf,
    /// Extra arguments placed before the input file path.
    pub args: Vec<String>,
}

/// Resource limits handed to the external program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub memory_mb: usize,
    pub cores: usize,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            memory_mb: 2000,
            cores: 1,
        }
    }
}

/// Input side of a calculation context.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalcInput {
    /// Requested derivative order; reassigned before every dispatch.
    pub task: Task,
    pub software: Software,
    /// Unique file prefix of this calculation.
    pub prefix: String,
    pub charge: i32,
    pub multiplicity: u32,
    pub embedding: Embedding,
    /// Free-form program-specific template passed through to the wrapper.
    pub template: String,
    pub resources: Resources,
    /// Directory for files that outlive a single run.
    pub permanent_dir: PathBuf,
    /// Working directory of the external program.
    pub scratch_dir: PathBuf,
    /// Optimiser settings, if geometry optimisations are driven from this calculation.
    pub optimisation: Option<OptimisationSettings>,
}

/// Output side of a calculation context, written exactly once per dispatch.
///
/// Gradients are flattened `3N` vectors and Hessians `3N × 3N` matrices, with the atoms of
/// the layer ordered by ascending index. Energies are in Hartree, lengths in Ångström.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalcOutput {
    pub energy: Option<f64>,
    pub gradient: Option<DVector<f64>>,
    pub hessian: Option<DMatrix<f64>>,
    pub multipoles: BTreeMap<AtomIndex, Multipoles>,
}

impl CalcOutput {
    pub fn is_empty(&self) -> bool {
        self.energy.is_none()
            && self.gradient.is_none()
            && self.hessian.is_none()
            && self.multipoles.is_empty()
    }

    /// Returns `true` if the output carries every quantity `task` requires.
    pub fn satisfies(&self, task: Task) -> bool {
        match task {
            Task::Energy => self.energy.is_some(),
            Task::Gradient => self.energy.is_some() && self.gradient.is_some(),
            Task::Hessian => {
                self.energy.is_some() && self.gradient.is_some() && self.hessian.is_some()
            }
        }
    }
}

/// Input and output of one calculation on one layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalculationContext {
    pub input: CalcInput,
    pub output: CalcOutput,
}

impl CalculationContext {
    pub fn new(input: CalcInput) -> Self {
        Self {
            input,
            output: CalcOutput::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_parses_aliases() {
        assert_eq!("Energy".parse::<Task>().unwrap(), Task::Energy);
        assert_eq!("forces".parse::<Task>().unwrap(), Task::Gradient);
        assert_eq!("hessian".parse::<Task>().unwrap(), Task::Hessian);
        assert!("dynamics".parse::<Task>().is_err());
    }

    #[test]
    fn electronic_embedding_defaults_scaling_factors() {
        let embedding = Embedding::Electronic {
            scaling_factors: None,
        };
        assert_eq!(embedding.scaling_factors(), Some(&DEFAULT_SCALING_FACTORS[..]));
        assert_eq!(Embedding::Mechanical.scaling_factors(), None);
    }

    #[test]
    fn custom_scaling_factors_are_kept() {
        let embedding = Embedding::Electronic {
            scaling_factors: Some(vec![0.0, 0.5]),
        };
        assert_eq!(embedding.scaling_factors(), Some(&[0.0, 0.5][..]));
    }

    #[test]
    fn output_satisfaction_depends_on_task() {
        let mut output = CalcOutput {
            energy: Some(-1.0),
            ..Default::default()
        };
        assert!(output.satisfies(Task::Energy));
        assert!(!output.satisfies(Task::Gradient));
        output.gradient = Some(DVector::zeros(3));
        assert!(output.satisfies(Task::Gradient));
        assert!(!output.satisfies(Task::Hessian));
        assert!(!output.is_empty());
        assert!(CalcOutput::default().is_empty());
    }
}
