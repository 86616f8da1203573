use serde::Deserialize;
use std::path::PathBuf;
use strata::core::geometry::ConvergenceThresholds;
use strata::core::models::calculation::{Embedding, Task};
use strata::core::models::optimisation::{OptimisationStrategy, OptimiserKind, SocketAddress};
use strata::core::models::system::ModelKind;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FileMode {
    SinglePoint,
    Optimise,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FileModel {
    Oniom,
    Single,
}

impl From<FileModel> for ModelKind {
    fn from(model: FileModel) -> Self {
        match model {
            FileModel::Oniom => ModelKind::Oniom,
            FileModel::Single => ModelKind::Single,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FileStrategy {
    Macro,
    Micro,
}

impl From<FileStrategy> for OptimisationStrategy {
    fn from(strategy: FileStrategy) -> Self {
        match strategy {
            FileStrategy::Macro => OptimisationStrategy::Macro,
            FileStrategy::Micro => OptimisationStrategy::Micro,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FileOptimiser {
    Bfgs,
    Lbfgs,
    ConjugateGradient,
    SteepestDescent,
}

impl From<FileOptimiser> for OptimiserKind {
    fn from(optimiser: FileOptimiser) -> Self {
        match optimiser {
            FileOptimiser::Bfgs => OptimiserKind::Bfgs,
            FileOptimiser::Lbfgs => OptimiserKind::Lbfgs,
            FileOptimiser::ConjugateGradient => OptimiserKind::ConjugateGradient,
            FileOptimiser::SteepestDescent => OptimiserKind::SteepestDescent,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "type", deny_unknown_fields)]
pub enum FileEmbedding {
    Mechanical,
    Electronic {
        #[serde(rename = "scaling-factors", default)]
        scaling_factors: Option<Vec<f64>>,
    },
}

impl From<FileEmbedding> for Embedding {
    fn from(embedding: FileEmbedding) -> Self {
        match embedding {
            FileEmbedding::Mechanical => Embedding::Mechanical,
            FileEmbedding::Electronic { scaling_factors } => Embedding::Electronic { scaling_factors },
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "type", deny_unknown_fields)]
pub enum FileSocket {
    Unix { name: String },
    Inet { host: String, port: u16 },
}

impl From<FileSocket> for SocketAddress {
    fn from(socket: FileSocket) -> Self {
        match socket {
            FileSocket::Unix { name } => SocketAddress::Unix { name },
            FileSocket::Inet { host, port } => SocketAddress::Inet { host, port },
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileThresholds {
    pub rms_force: Option<f64>,
    pub max_force: Option<f64>,
    pub rms_displacement: Option<f64>,
    pub max_displacement: Option<f64>,
    pub energy_change: Option<f64>,
}

impl FileThresholds {
    /// Fills unset criteria from the default thresholds.
    pub fn resolve(&self) -> ConvergenceThresholds {
        let defaults = ConvergenceThresholds::default();
        ConvergenceThresholds {
            rms_force: self.rms_force.unwrap_or(defaults.rms_force),
            max_force: self.max_force.unwrap_or(defaults.max_force),
            rms_displacement: self.rms_displacement.unwrap_or(defaults.rms_displacement),
            max_displacement: self.max_displacement.unwrap_or(defaults.max_displacement),
            energy_change: self.energy_change.unwrap_or(defaults.energy_change),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileOptimisation {
    pub strategy: Option<FileStrategy>,
    pub optimiser: Option<FileOptimiser>,
    pub max_cycles: Option<usize>,
    pub thresholds: Option<FileThresholds>,
    pub socket: Option<FileSocket>,
    pub executable: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileCalculation {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub prefix: Option<String>,
    pub charge: Option<i32>,
    pub multiplicity: Option<u32>,
    pub embedding: Option<FileEmbedding>,
    pub template: Option<String>,
    pub template_file: Option<PathBuf>,
    pub memory_mb: Option<usize>,
    pub cores: Option<usize>,
    pub permanent_dir: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileLayer {
    #[serde(default)]
    pub atoms: Vec<usize>,
    pub link_element: Option<String>,
    pub g_factor: Option<f64>,
    pub original: Option<FileCalculation>,
    pub inherited: Option<FileCalculation>,
    pub optimisation: Option<FileOptimisation>,
    #[serde(default)]
    pub layers: Vec<FileLayer>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileJobSection {
    pub mode: Option<FileMode>,
    pub model: Option<FileModel>,
    pub task: Option<Task>,
    pub geometry: Option<PathBuf>,
    pub bonds: Option<Vec<[usize; 2]>>,
    pub bond_tolerance: Option<f64>,
}

/// A job file as written by the user: every value optional until merged with defaults.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileJob {
    #[serde(default)]
    pub job: FileJobSection,
    #[serde(default)]
    pub root: FileLayer,
}
