//! The five governance components.

pub mod attack;
pub mod drift;
pub mod invariants;
pub mod lint;
pub mod registry;
