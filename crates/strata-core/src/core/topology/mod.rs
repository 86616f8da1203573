//! # Topology Module
//!
//! Connectivity perception for molecular systems whose job description does not list bonds
//! explicitly.
//!
//! ## Key Components
//!
//! - [`guess`] - Covalent radii and distance-based bond guessing
//!
//! ## Usage
//!
//! ```ignore
//! use strata::core::topology::guess::guess_bonds;
//!
//! let bonds = guess_bonds(&mut layer, 1.2);
//! ```

pub mod guess;
