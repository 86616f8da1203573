mod defaults;
mod file;

use crate::error::{CliError, Result};
use defaults::DefaultsConfig;
use file::{FileCalculation, FileJob, FileLayer, FileMode, FileOptimisation};
use serde::de::value::{Error as ValueError, StrDeserializer};
use serde::de::{DeserializeOwned, IntoDeserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata::core::io::xyz::XyzFile;
use strata::core::models::builder::{LayerSpec, MoleculeBuilder};
use strata::core::models::calculation::{CalcInput, Resources, Software, Task};
use strata::core::models::ids::CalcKey;
use strata::core::models::optimisation::{OptimisationSettings, OptimisationStrategy, SocketAddress};
use strata::core::models::system::{ModelKind, Molecule};
use strata::engine::config::{OptimisationSettingsBuilder, OptimiseConfig, SinglePointConfig};
use tracing::{debug, info};

/// Values given on the command line that take precedence over the job file.
#[derive(Debug, Default, Clone)]
pub struct JobOverrides {
    pub geometry: Option<PathBuf>,
    pub optimise: Option<bool>,
    pub task: Option<Task>,
    pub strategy: Option<OptimisationStrategy>,
}

#[derive(Debug, Clone)]
pub enum JobKind {
    SinglePoint(SinglePointConfig),
    Optimise(OptimiseConfig),
}

/// A fully resolved job: the layered molecule and what to do with it.
#[derive(Debug, Clone)]
pub struct Job {
    pub molecule: Molecule,
    pub kind: JobKind,
    pub geometry: PathBuf,
}

/// Loads `path`, applies `-S` overrides and CLI overrides, and assembles the molecule.
pub fn load_job(path: &Path, set_values: &[String], overrides: &JobOverrides) -> Result<Job> {
    let mut file = FileJob::from_file(path)?;
    file.apply_set_values(set_values)?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    file.into_job(&base_dir, overrides)
}

impl FileJob {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading job file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    pub fn into_job(self, base_dir: &Path, overrides: &JobOverrides) -> Result<Job> {
        let defaults = DefaultsConfig::default();
        let section = self.job;

        let geometry = overrides
            .geometry
            .clone()
            .or(section.geometry.map(|p| resolve_path(base_dir, p)))
            .ok_or_else(|| {
                CliError::Config(
                    "A geometry is required either as `job.geometry` or via --xyz.".to_string(),
                )
            })?;
        info!("Loading geometry from {:?}", &geometry);
        let frame = XyzFile::read_from_path(&geometry).map_err(|e| CliError::FileParsing {
            path: geometry.clone(),
            source: e.into(),
        })?;
        let atoms = frame.to_atoms();

        if !self.root.atoms.is_empty() {
            return Err(CliError::Config(
                "`root.atoms` must be empty; the root layer holds every atom.".to_string(),
            ));
        }

        let kind = section.model.map(ModelKind::from).unwrap_or_default();
        let mut builder = MoleculeBuilder::new(kind);
        for (index, atom) in atoms {
            builder.add_atom(index, atom);
        }
        match section.bonds {
            Some(pairs) => {
                for [a, b] in pairs {
                    builder.add_bond(a, b);
                }
            }
            None => {
                let tolerance = section.bond_tolerance.unwrap_or(defaults.bond_tolerance);
                debug!(tolerance, "Guessing bonds from covalent radii.");
                builder.guess_bonds(tolerance);
            }
        }
        for (key, input) in layer_calculations(&self.root, base_dir, &defaults)? {
            builder.root_calculation(key, input);
        }
        for layer in &self.root.layers {
            builder.add_layer(layer_spec(layer, base_dir, &defaults)?);
        }
        let molecule = builder
            .build()
            .map_err(|e| CliError::Config(e.to_string()))?;

        let optimise = overrides
            .optimise
            .unwrap_or(section.mode == Some(FileMode::Optimise));
        let kind = if optimise {
            JobKind::Optimise(OptimiseConfig {
                strategy: overrides.strategy,
            })
        } else {
            JobKind::SinglePoint(SinglePointConfig {
                task: overrides.task.or(section.task).unwrap_or(defaults.task),
            })
        };

        Ok(Job {
            molecule,
            kind,
            geometry,
        })
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let Some((key, value)) = kv_pair.split_once('=') else {
                return Err(CliError::Config(format!(
                    "Invalid --set format: '{}'. Expected KEY=VALUE.",
                    kv_pair
                )));
            };

            match key {
                "job.mode" => self.job.mode = Some(parse_keyword(key, value)?),
                "job.model" => self.job.model = Some(parse_keyword(key, value)?),
                "job.task" => self.job.task = Some(parse_keyword(key, value)?),
                "job.geometry" => self.job.geometry = Some(PathBuf::from(value)),
                "job.bond-tolerance" => self.job.bond_tolerance = Some(parse_number(key, value)?),
                "root.optimisation.strategy" => {
                    self.root_optimisation().strategy = Some(parse_keyword(key, value)?)
                }
                "root.optimisation.optimiser" => {
                    self.root_optimisation().optimiser = Some(parse_keyword(key, value)?)
                }
                "root.optimisation.max-cycles" => {
                    self.root_optimisation().max_cycles = Some(parse_number(key, value)?)
                }
                "root.optimisation.executable" => {
                    self.root_optimisation().executable = Some(PathBuf::from(value))
                }
                "root.optimisation.work-dir" => {
                    self.root_optimisation().work_dir = Some(PathBuf::from(value))
                }
                _ => {
                    return Err(CliError::Config(format!(
                        "Unsupported configuration key for --set: '{}'",
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    fn root_optimisation(&mut self) -> &mut FileOptimisation {
        self.root.optimisation.get_or_insert_with(Default::default)
    }
}

fn parse_keyword<T: DeserializeOwned>(key: &str, value: &str) -> Result<T> {
    let deserializer: StrDeserializer<'_, ValueError> = value.into_deserializer();
    T::deserialize(deserializer)
        .map_err(|e| CliError::Config(format!("Invalid value for {}: {}", key, e)))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CliError::Config(format!("Invalid numeric value for {}: {}", key, value)))
}

fn resolve_path(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

fn layer_spec(layer: &FileLayer, base_dir: &Path, defaults: &DefaultsConfig) -> Result<LayerSpec> {
    let mut spec = LayerSpec::new(layer.atoms.iter().copied()).with_link(
        layer
            .link_element
            .as_deref()
            .unwrap_or(&defaults.link_element),
        layer.g_factor.unwrap_or(defaults.g_factor),
    );
    for (key, input) in layer_calculations(layer, base_dir, defaults)? {
        spec = spec.with_calculation(key, input);
    }
    for child in &layer.layers {
        spec = spec.with_child(layer_spec(child, base_dir, defaults)?);
    }
    Ok(spec)
}

fn layer_calculations(
    layer: &FileLayer,
    base_dir: &Path,
    defaults: &DefaultsConfig,
) -> Result<Vec<(CalcKey, CalcInput)>> {
    let mut calculations = Vec::new();
    if let Some(original) = &layer.original {
        let mut input = calc_input(original, base_dir, defaults)?;
        input.optimisation = layer
            .optimisation
            .as_ref()
            .map(|opt| optimisation_settings(opt, base_dir, defaults))
            .transpose()?;
        calculations.push((CalcKey::Original, input));
    } else if layer.optimisation.is_some() {
        return Err(CliError::Config(
            "An `optimisation` section requires an `original` calculation on the same layer."
                .to_string(),
        ));
    }
    if let Some(inherited) = &layer.inherited {
        calculations.push((CalcKey::Inherited, calc_input(inherited, base_dir, defaults)?));
    }
    Ok(calculations)
}

fn calc_input(
    calc: &FileCalculation,
    base_dir: &Path,
    defaults: &DefaultsConfig,
) -> Result<CalcInput> {
    let template = match (&calc.template, &calc.template_file) {
        (Some(_), Some(_)) => {
            return Err(CliError::Config(
                "`template` and `template-file` are mutually exclusive.".to_string(),
            ));
        }
        (Some(text), None) => text.clone(),
        (None, Some(path)) => {
            let path = resolve_path(base_dir, path.clone());
            std::fs::read_to_string(&path).map_err(|e| CliError::FileParsing {
                path,
                source: e.into(),
            })?
        }
        (None, None) => String::new(),
    };
    let resources = Resources::default();

    Ok(CalcInput {
        task: Task::default(),
        software: Software {
            command: calc.command.clone(),
            args: calc.args.clone(),
        },
        prefix: calc.prefix.clone().unwrap_or_default(),
        charge: calc.charge.unwrap_or(0),
        multiplicity: calc.multiplicity.unwrap_or(defaults.multiplicity),
        embedding: calc.embedding.clone().map(Into::into).unwrap_or_default(),
        template,
        resources: Resources {
            memory_mb: calc.memory_mb.unwrap_or(resources.memory_mb),
            cores: calc.cores.unwrap_or(resources.cores),
        },
        permanent_dir: resolve_path(base_dir, calc.permanent_dir.clone().unwrap_or_default()),
        scratch_dir: resolve_path(base_dir, calc.scratch_dir.clone().unwrap_or_default()),
        optimisation: None,
    })
}

fn optimisation_settings(
    opt: &FileOptimisation,
    base_dir: &Path,
    defaults: &DefaultsConfig,
) -> Result<OptimisationSettings> {
    let socket = opt
        .socket
        .clone()
        .map(SocketAddress::from)
        .unwrap_or_else(|| SocketAddress::Unix {
            name: defaults.socket_name.clone(),
        });
    let work_dir = opt
        .work_dir
        .clone()
        .unwrap_or_else(|| defaults.work_dir.clone());

    OptimisationSettingsBuilder::new()
        .strategy(opt.strategy.map(Into::into).unwrap_or(defaults.strategy))
        .optimiser(opt.optimiser.map(Into::into).unwrap_or(defaults.optimiser))
        .max_cycles(opt.max_cycles.unwrap_or(defaults.max_cycles))
        .thresholds(opt.thresholds.clone().unwrap_or_default().resolve())
        .socket(socket)
        .executable(
            opt.executable
                .clone()
                .unwrap_or_else(|| defaults.executable.clone()),
        )
        .work_dir(resolve_path(base_dir, work_dir))
        .connect_timeout(
            opt.connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
        )
        .build()
        .map_err(|e| CliError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use strata::core::geometry::ConvergenceThresholds;
    use strata::core::models::calculation::Embedding;
    use strata::core::models::ids::{CalcId, LayerId};
    use strata::core::models::optimisation::OptimiserKind;
    use tempfile::TempDir;

    const PROPANE: &str = "\
3
propane backbone
C 0.000 0.000 0.000
C 1.530 0.000 0.000
C 3.060 0.000 0.000
";

    fn workspace(job: &str) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("propane.xyz"), PROPANE).unwrap();
        let job_path = dir.path().join("job.toml");
        fs::write(&job_path, job).unwrap();
        (dir, job_path)
    }

    const TWO_LAYER_JOB: &str = r#"
[job]
mode = "optimise"
geometry = "propane.xyz"

[root.original]
command = "low-level"
charge = 0

[root.optimisation]
strategy = "micro"
optimiser = "lbfgs"
socket = { type = "inet", host = "localhost", port = 31415 }

[root.optimisation.thresholds]
max-force = 1e-3

[[root.layers]]
atoms = [0]
g-factor = 0.7

[root.layers.original]
command = "high-level"
embedding = { type = "electronic", scaling-factors = [0.0, 0.5] }
template = "b3lyp"

[root.layers.inherited]
command = "low-level"

[root.layers.optimisation]
work-dir = "inner"
"#;

    #[test]
    fn job_file_builds_a_layered_molecule() {
        let (dir, job_path) = workspace(TWO_LAYER_JOB);
        let job = load_job(&job_path, &[], &JobOverrides::default()).unwrap();

        let molecule = &job.molecule;
        assert_eq!(molecule.kind, ModelKind::Oniom);
        assert_eq!(molecule.real_atoms().len(), 3);
        assert_eq!(molecule.root().bonds.bonds().count(), 2);

        let model = molecule.layer(&LayerId::from(vec![0])).unwrap();
        assert_eq!(model.link_atoms().len(), 1);

        let original = &molecule
            .calculation(&CalcId::original(LayerId::from(vec![0])))
            .unwrap()
            .input;
        assert_eq!(original.software.command, PathBuf::from("high-level"));
        assert_eq!(original.template, "b3lyp");
        assert_eq!(
            original.embedding,
            Embedding::Electronic {
                scaling_factors: Some(vec![0.0, 0.5])
            }
        );
        let inner = original.optimisation.as_ref().unwrap();
        assert_eq!(inner.work_dir, dir.path().join("inner"));

        let root = molecule
            .calculation(&CalcId::original(LayerId::root()))
            .unwrap()
            .input
            .optimisation
            .clone()
            .unwrap();
        assert_eq!(root.strategy, OptimisationStrategy::Micro);
        assert_eq!(root.optimiser, OptimiserKind::Lbfgs);
        assert_eq!(
            root.socket,
            SocketAddress::Inet {
                host: "localhost".into(),
                port: 31415
            }
        );
        assert_eq!(root.thresholds.max_force, 1e-3);
        assert_eq!(
            root.thresholds.rms_force,
            ConvergenceThresholds::default().rms_force
        );
        assert!(matches!(
            job.kind,
            JobKind::Optimise(OptimiseConfig { strategy: None })
        ));
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let (dir, job_path) = workspace(TWO_LAYER_JOB);
        let other = dir.path().join("other.xyz");
        fs::write(&other, PROPANE).unwrap();
        let overrides = JobOverrides {
            geometry: Some(other.clone()),
            optimise: Some(false),
            task: Some(Task::Hessian),
            strategy: None,
        };

        let job = load_job(&job_path, &[], &overrides).unwrap();

        assert_eq!(job.geometry, other);
        assert!(matches!(
            job.kind,
            JobKind::SinglePoint(SinglePointConfig {
                task: Task::Hessian
            })
        ));
    }

    #[test]
    fn set_values_override_file_values() {
        let (_dir, job_path) = workspace(TWO_LAYER_JOB);
        let set = vec![
            "job.mode=single-point".to_string(),
            "job.task=gradient".to_string(),
            "root.optimisation.max-cycles=7".to_string(),
            "root.optimisation.strategy=macro".to_string(),
        ];

        let job = load_job(&job_path, &set, &JobOverrides::default()).unwrap();

        assert!(matches!(
            job.kind,
            JobKind::SinglePoint(SinglePointConfig {
                task: Task::Gradient
            })
        ));
        let settings = job
            .molecule
            .calculation(&CalcId::original(LayerId::root()))
            .unwrap()
            .input
            .optimisation
            .clone()
            .unwrap();
        assert_eq!(settings.max_cycles, 7);
        assert_eq!(settings.strategy, OptimisationStrategy::Macro);
    }

    #[test]
    fn malformed_set_values_are_rejected() {
        let mut file = FileJob::default();
        assert!(matches!(
            file.apply_set_values(&["job.task".to_string()]),
            Err(CliError::Config(_))
        ));
        assert!(matches!(
            file.apply_set_values(&["job.task=relax".to_string()]),
            Err(CliError::Config(_))
        ));
        assert!(matches!(
            file.apply_set_values(&["job.colour=blue".to_string()]),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn unknown_keys_fail_to_parse() {
        let (_dir, job_path) = workspace("[job]\ngeometry = \"propane.xyz\"\nspeed = 3\n");
        let err = load_job(&job_path, &[], &JobOverrides::default()).unwrap_err();
        assert!(matches!(err, CliError::FileParsing { .. }));
    }

    #[test]
    fn missing_geometry_is_a_configuration_error() {
        let (_dir, job_path) = workspace("[root.original]\ncommand = \"low-level\"\n");
        let err = load_job(&job_path, &[], &JobOverrides::default()).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }

    #[test]
    fn explicit_bonds_replace_guessed_bonds() {
        let (_dir, job_path) = workspace(
            "[job]\ngeometry = \"propane.xyz\"\nbonds = [[0, 2]]\n\n[root.original]\ncommand = \"x\"\n",
        );
        let job = load_job(&job_path, &[], &JobOverrides::default()).unwrap();
        let bonds: Vec<_> = job.molecule.root().bonds.bonds().collect();
        assert_eq!(bonds, vec![(0, 2)]);
    }

    #[test]
    fn optimisation_without_original_is_rejected() {
        let (_dir, job_path) = workspace(
            "[job]\ngeometry = \"propane.xyz\"\n\n[root.optimisation]\nstrategy = \"macro\"\n",
        );
        let err = load_job(&job_path, &[], &JobOverrides::default()).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }
}
