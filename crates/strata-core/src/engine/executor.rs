use crate::core::models::atom::Multipoles;
use crate::core::models::calculation::{CalcInput, CalcOutput, Task};
use crate::core::models::ids::{AtomIndex, CalcId};
use crate::core::models::system::{ModelError, Molecule};
use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Model(#[from] ModelError),

    #[error("Program '{program}' exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Program produced no output file at {0}")]
    MissingOutput(PathBuf),

    #[error("Malformed program output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid program output: {0}")]
    InvalidOutput(String),

    #[error("Program output lacks results required by task '{task}'")]
    Incomplete { task: Task },
}

/// Runs the external program behind one calculation.
///
/// Implementations must not modify shared state; the calculation slot commits the returned
/// output.
pub trait ProcessExecutor: Send + Sync {
    fn execute(&self, calc: &CalcId, molecule: &Molecule) -> Result<CalcOutput, ProgramError>;
}

/// Generic wrapper protocol: one JSON document in, one JSON document out.
///
/// For a calculation with prefix `p` the executor writes `p.in.json` into the scratch
/// directory, runs `command args... p.in.json` there and reads `p.out.json` back. Lengths are
/// in Ångström, energies in Hartree and gradients in Hartree/Å, ordered like the atoms of the
/// input document.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

#[derive(Debug, Serialize)]
struct WrapperInput<'a> {
    calculation: String,
    task: Task,
    charge: i32,
    multiplicity: u32,
    template: &'a str,
    memory_mb: usize,
    cores: usize,
    permanent_dir: &'a Path,
    atoms: Vec<WrapperAtom<'a>>,
    point_charges: Vec<WrapperSite>,
}

#[derive(Debug, Serialize)]
struct WrapperAtom<'a> {
    index: AtomIndex,
    element: &'a str,
    position: [f64; 3],
    link: bool,
    dummy: bool,
}

#[derive(Debug, Serialize)]
struct WrapperSite {
    index: AtomIndex,
    position: [f64; 3],
    charge: f64,
    dipole: [f64; 3],
}

#[derive(Debug, Deserialize)]
struct WrapperOutput {
    energy: Option<f64>,
    gradient: Option<Vec<f64>>,
    hessian: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    multipoles: BTreeMap<AtomIndex, WrapperMultipoles>,
}

#[derive(Debug, Deserialize)]
struct WrapperMultipoles {
    charge: f64,
    #[serde(default)]
    dipole: [f64; 3],
}

/// File stem used for a calculation's wrapper documents.
pub fn file_stem(calc: &CalcId, input: &CalcInput) -> String {
    if !input.prefix.is_empty() {
        return input.prefix.clone();
    }
    let path: Vec<String> = calc.layer.path().iter().map(|i| i.to_string()).collect();
    format!("layer{}_{}", path.join("-"), calc.key)
}

impl ProcessExecutor for CommandExecutor {
    #[instrument(skip_all, name = "command_executor", fields(calc = %calc))]
    fn execute(&self, calc: &CalcId, molecule: &Molecule) -> Result<CalcOutput, ProgramError> {
        let layer = molecule.layer(&calc.layer)?;
        let input = &molecule.calculation(calc)?.input;

        let document = WrapperInput {
            calculation: calc.to_string(),
            task: input.task,
            charge: input.charge,
            multiplicity: input.multiplicity,
            template: &input.template,
            memory_mb: input.resources.memory_mb,
            cores: input.resources.cores,
            permanent_dir: &input.permanent_dir,
            atoms: layer
                .atoms
                .iter()
                .map(|(&index, atom)| WrapperAtom {
                    index,
                    element: &atom.element,
                    position: [atom.position.x, atom.position.y, atom.position.z],
                    link: atom.is_link(),
                    dummy: atom.is_dummy,
                })
                .collect(),
            point_charges: layer
                .polarisation
                .iter()
                .map(|(&index, site)| WrapperSite {
                    index,
                    position: [site.position.x, site.position.y, site.position.z],
                    charge: site.multipoles.monopole,
                    dipole: [
                        site.multipoles.dipole.x,
                        site.multipoles.dipole.y,
                        site.multipoles.dipole.z,
                    ],
                })
                .collect(),
        };

        let stem = file_stem(calc, input);
        fs::create_dir_all(&input.scratch_dir)?;
        let input_path = input.scratch_dir.join(format!("{}.in.json", stem));
        let output_path = input.scratch_dir.join(format!("{}.out.json", stem));
        if output_path.exists() {
            fs::remove_file(&output_path)?;
        }
        fs::write(&input_path, serde_json::to_vec_pretty(&document)?)?;

        debug!(program = %input.software.command.display(), "Running external program.");
        let output = Command::new(&input.software.command)
            .args(&input.software.args)
            .arg(&input_path)
            .current_dir(&input.scratch_dir)
            .output()?;

        if !output.status.success() {
            return Err(ProgramError::Failed {
                program: input.software.command.display().to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if !output_path.exists() {
            return Err(ProgramError::MissingOutput(output_path));
        }
        let raw: WrapperOutput = serde_json::from_slice(&fs::read(&output_path)?)?;
        let result = convert_output(raw, 3 * layer.atoms.len())?;

        if !result.satisfies(input.task) {
            return Err(ProgramError::Incomplete { task: input.task });
        }
        Ok(result)
    }
}

fn convert_output(raw: WrapperOutput, dim: usize) -> Result<CalcOutput, ProgramError> {
    let gradient = match raw.gradient {
        Some(g) if g.len() != dim => {
            return Err(ProgramError::InvalidOutput(format!(
                "gradient has {} components, expected {}",
                g.len(),
                dim
            )));
        }
        Some(g) => Some(DVector::from_vec(g)),
        None => None,
    };

    let hessian = match raw.hessian {
        Some(rows) => {
            if rows.len() != dim || rows.iter().any(|row| row.len() != dim) {
                return Err(ProgramError::InvalidOutput(format!(
                    "hessian must be {0}x{0}",
                    dim
                )));
            }
            Some(DMatrix::from_row_iterator(
                dim,
                dim,
                rows.into_iter().flatten(),
            ))
        }
        None => None,
    };

    let multipoles = raw
        .multipoles
        .into_iter()
        .map(|(index, m)| {
            (
                index,
                Multipoles {
                    monopole: m.charge,
                    dipole: Vector3::from(m.dipole),
                },
            )
        })
        .collect();

    Ok(CalcOutput {
        energy: raw.energy,
        gradient,
        hessian,
        multipoles,
    })
}
