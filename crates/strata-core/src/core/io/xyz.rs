use crate::core::models::atom::Atom;
use crate::core::models::ids::AtomIndex;
use nalgebra::Point3;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XyzError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error on line {line}: {kind}")]
    Parse { line: usize, kind: XyzParseErrorKind },
    #[error("Expected {expected} atoms but found {found}")]
    AtomCount { expected: usize, found: usize },
}

#[derive(Debug, Error)]
pub enum XyzParseErrorKind {
    #[error("Invalid atom count '{0}'")]
    InvalidCount(String),
    #[error("Invalid coordinate '{0}'")]
    InvalidFloat(String),
    #[error("Atom line needs an element and three coordinates")]
    LineTooShort,
}

/// One XYZ frame: a comment line and an ordered list of elements with positions (Å).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XyzFrame {
    pub comment: String,
    pub atoms: Vec<(String, Point3<f64>)>,
}

impl XyzFrame {
    /// Converts the frame into an atom table indexed by file order.
    pub fn to_atoms(&self) -> BTreeMap<AtomIndex, Atom> {
        self.atoms
            .iter()
            .enumerate()
            .map(|(i, (element, position))| (i, Atom::new(element, *position)))
            .collect()
    }

    /// Builds a frame from an atom table, skipping link and dummy atoms.
    pub fn from_atoms<'a>(
        comment: &str,
        atoms: impl IntoIterator<Item = &'a Atom>,
    ) -> Self {
        Self {
            comment: comment.to_string(),
            atoms: atoms
                .into_iter()
                .filter(|a| a.is_real())
                .map(|a| (a.element.clone(), a.position))
                .collect(),
        }
    }
}

pub struct XyzFile;

impl XyzFile {
    /// Reads the first frame from `reader`.
    ///
    /// # Errors
    ///
    /// Returns [`XyzError`] if the header is malformed, a coordinate cannot be parsed or the
    /// file holds fewer atoms than announced.
    pub fn read_from(reader: &mut impl BufRead) -> Result<XyzFrame, XyzError> {
        let mut lines = reader.lines();

        let count_line = lines.next().transpose()?.unwrap_or_default();
        let count: usize = count_line.trim().parse().map_err(|_| XyzError::Parse {
            line: 1,
            kind: XyzParseErrorKind::InvalidCount(count_line.trim().to_string()),
        })?;
        let comment = lines.next().transpose()?.unwrap_or_default();

        let mut atoms = Vec::with_capacity(count);
        for (offset, line) in lines.take(count).enumerate() {
            let line = line?;
            let number = offset + 3;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(XyzError::Parse {
                    line: number,
                    kind: XyzParseErrorKind::LineTooShort,
                });
            }
            let coord = |s: &str| {
                s.parse::<f64>().map_err(|_| XyzError::Parse {
                    line: number,
                    kind: XyzParseErrorKind::InvalidFloat(s.to_string()),
                })
            };
            let position = Point3::new(coord(fields[1])?, coord(fields[2])?, coord(fields[3])?);
            atoms.push((fields[0].to_string(), position));
        }

        if atoms.len() != count {
            return Err(XyzError::AtomCount {
                expected: count,
                found: atoms.len(),
            });
        }

        Ok(XyzFrame {
            comment: comment.trim_end().to_string(),
            atoms,
        })
    }

    pub fn write_to(frame: &XyzFrame, writer: &mut impl Write) -> Result<(), XyzError> {
        writeln!(writer, "{}", frame.atoms.len())?;
        writeln!(writer, "{}", frame.comment)?;
        for (element, p) in &frame.atoms {
            writeln!(writer, "{:<3} {:>16.10} {:>16.10} {:>16.10}", element, p.x, p.y, p.z)?;
        }
        Ok(())
    }

    pub fn read_from_path<P: AsRef<Path>>(path: P) -> Result<XyzFrame, XyzError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::read_from(&mut reader)
    }

    pub fn write_to_path<P: AsRef<Path>>(frame: &XyzFrame, path: P) -> Result<(), XyzError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        Self::write_to(frame, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}
