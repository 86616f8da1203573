//! # Core Module
//!
//! Stateless building blocks of Strata: the layered molecule representation, the ONIOM
//! combination of per-layer results, electrostatic embedding, convergence metrics, unit
//! conversions and small I/O helpers.
//!
//! - **Molecular Representation** ([`models`]) - Atoms, bonds, calculation contexts and the layer tree
//! - **Result Collection** ([`oniom`]) - Additive ONIOM combination of layer results
//! - **Embedding** ([`polarisation`]) - Point-charge clouds for electronically embedded layers
//! - **Convergence** ([`geometry`]) - Geometry convergence criteria between two snapshots
//! - **Connectivity** ([`topology`]) - Covalent radii and bond guessing
//! - **File I/O** ([`io`]) - XYZ coordinates

pub mod geometry;
pub mod io;
pub mod models;
pub mod oniom;
pub mod polarisation;
pub mod topology;
pub mod units;
