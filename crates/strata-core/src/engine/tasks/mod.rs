//! Drivers that move data through the layer tree.
//!
//! The [`atomic`] driver runs single calculations and full top-down traversals. The
//! [`macro_cycle`] driver optimises the complete system with one external optimiser, while
//! the [`micro_cycle`] driver runs one optimiser per horizontal slice and converges the
//! shallower slices adiabatically before every step of a deeper one.

pub mod atomic;
pub mod macro_cycle;
pub mod micro_cycle;

#[cfg(test)]
pub(crate) mod testing;
