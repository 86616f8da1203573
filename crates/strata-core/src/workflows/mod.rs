//! # Workflows Module
//!
//! High-level entry points that wire the engine together for complete jobs.
//!
//! ## Overview
//!
//! A workflow takes a fully built [`crate::core::models::system::Molecule`], the external
//! collaborators that evaluate it (a process executor and, for optimisations, an optimiser
//! launcher) and a progress reporter. It owns the shared molecule and the calculation slot
//! for the duration of the job and hands back the final molecule.
//!
//! - **Single Point** ([`single_point`]) - One top-down evaluation of the layer tree.
//! - **Optimisation** ([`optimise`]) - Macro- or micro-cycle geometry optimisation.

pub mod optimise;
pub mod single_point;
