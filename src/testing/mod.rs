//! Testing utilities and mock implementations
//!
//! Lets the agent run end to end without a hub: a scriptable transport plus
//! deterministic randomness and time.

pub mod mocks;

pub use mocks::*;
