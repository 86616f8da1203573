//! # Core Models Module
//!
//! Data structures representing a layered ONIOM system.
//!
//! ## Overview
//!
//! A [`system::Molecule`] is a tree of [`layer::Layer`]s. The root layer holds the complete
//! ("real") system; every child is a smaller region nested inside its parent and computed at
//! a higher level of theory. A layer is addressed by the path of child indices leading to it
//! ([`ids::LayerId`]), and each layer carries one calculation context per
//! [`ids::CalcKey`]: its own level of theory (`Original`) and, below the root, the level of
//! its parent (`Inherited`) used for the ONIOM subtraction.
//!
//! Atoms are stored in flat per-layer tables keyed by integer indices. An index means the
//! same physical atom in every layer it appears in; link atoms carry the indices of their
//! partners instead of references.
//!
//! ## Key Components
//!
//! - [`atom`] - Atoms, multipoles and link-atom relations
//! - [`topology`] - Bond graph and bond separations
//! - [`neighbours`] - Cutoff-keyed neighbour-list cache
//! - [`calculation`] - Per-layer calculation inputs and outputs
//! - [`optimisation`] - Optimiser settings attached to calculation inputs
//! - [`layer`] - A single node of the layer tree
//! - [`system`] - The layer tree and its path-addressed operations
//! - [`builder`] - Construction of a layer tree from atom selections
//! - [`ids`] - Layer, calculation and atom identifiers

pub mod atom;
pub mod builder;
pub mod calculation;
pub mod ids;
pub mod layer;
pub mod neighbours;
pub mod optimisation;
pub mod system;
pub mod topology;
