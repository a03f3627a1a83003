//! # vigil-core
//!
//! Core types for the Vigil quality pipeline.
//!
//! Vigil runs a fixed sequence of quality hooks (formatters, linters,
//! type-checkers, scanners, test runners), normalizes their output into a
//! single issue model and hands remaining issues to fix agents until the
//! project passes or the iteration budget runs out.
//!
//! ## Core Model
//!
//! - An [`Issue`] is one normalized defect, identified by a stable hash
//! - A [`HookResult`] is the outcome of one tool invocation
//! - A [`FixResult`] is the outcome of one agent pass over a batch of issues
//! - An [`IterationState`] tracks one autofix loop

pub mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::{AutofixConfig, BudgetMode, CommandAgentConfig, VigilConfig};
pub use error::{ErrorClass, Result, VigilError};
pub use types::*;
