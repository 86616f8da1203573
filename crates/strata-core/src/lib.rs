//! # Strata Core Library
//!
//! A driver for multi-layer ONIOM simulations. A molecular system is partitioned into nested
//! layers computed at different levels of theory; external programs evaluate each layer and
//! the results are recombined into one consistent energy surface for the whole system.
//!
//! ## Architectural Philosophy
//!
//! The library follows a strict three-layer architecture:
//!
//! - **[`core`]: The Foundation.** Stateless data models (`Molecule`, `Layer`), the ONIOM
//!   result collector, polarisation embedding, geometry convergence metrics and minimal I/O.
//!
//! - **[`engine`]: The Logic Core.** The stateful orchestration layer. It owns the shared
//!   molecule handle, the single-slot handoff cells, the calculation slot that serialises
//!   external program runs, the optimiser channels, and the atomic, macro-cycle and
//!   micro-cycle drivers.
//!
//! - **[`workflows`]: The Public API.** Complete procedures (single points and geometry
//!   optimisations) that wire the engine together for end users.

pub mod core;
pub mod engine;
pub mod workflows;
