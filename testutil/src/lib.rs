/// Testing utilities for the HotStuff consensus workspace
/// 
/// Provides:
/// - Random payload generators
/// - Deterministic key seeds and validator counts
/// - Tracing setup for tests

pub mod generators;
pub mod fixtures;

pub use generators::*;
pub use fixtures::*;
