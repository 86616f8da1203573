//! Coordinate file input and output.
//!
//! Only the plain XYZ format is supported. Atom indices of a [`crate::core::models::system::Molecule`]
//! correspond to the 0-based order of atoms in the file.

pub mod xyz;
