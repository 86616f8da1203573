//! # Engine Module
//!
//! The stateful orchestration layer of Strata. It moves a layered molecule through external
//! quantum chemistry programs and external geometry optimisers while keeping one consistent
//! view of the system.
//!
//! ## Overview
//!
//! All drivers share a single [`shared::SharedMolecule`], which is only ever changed through
//! whole-value transactions. External programs run one at a time behind the
//! [`slot::CalculationSlot`]; external optimisers talk to the drivers through single-slot
//! [`handoff::HandoffCell`]s bundled in an [`optimizer::OptimizerEndpoint`].
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Workflow parameters and the optimiser settings builder
//! - **Shared State** ([`shared`], [`handoff`]) - Transactional molecule handle and rendezvous cells
//! - **Execution** ([`executor`], [`slot`]) - External program wrappers and their serialisation
//! - **Optimisers** ([`optimizer`]) - Optimiser channels, the i-PI companion and process launcher
//! - **Drivers** ([`tasks`]) - Atomic traversal, macro-cycle and micro-cycle optimisation
//! - **History** ([`motion`]) - Recorded optimisation steps
//! - **Progress Monitoring** ([`progress`]) - Progress events for front ends
//! - **Error Handling** ([`error`]) - Engine-wide error type

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod handoff;
pub mod motion;
pub mod optimizer;
pub mod progress;
pub mod shared;
pub mod slot;
pub mod tasks;
