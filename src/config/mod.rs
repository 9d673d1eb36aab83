//! # Configuration Module
//!
//! Centralized home for the engine's format and tuning constants. Constants
//! that depend on each other live side by side so a change to one is made in
//! sight of the others, and the relationships are enforced with compile-time
//! assertions where possible.

pub mod constants;
pub use constants::*;
