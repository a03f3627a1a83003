//! Vigil hooks - runs quality tools and normalizes their output
//!
//! - [`command`]: the subprocess seam, with a scripted mock for tests
//! - [`parsers`]: tool-name keyed registry turning raw output into issues
//! - [`executor`]: stage runner with bounded parallelism

pub mod command;
pub mod executor;
pub mod parsers;

pub use command::{CommandOutput, CommandRunner, MockResponse, MockRunner, ProcessRunner, RunError};
pub use executor::{HookExecutor, DEFAULT_MAX_PARALLEL};
pub use parsers::{Finding, ParseError, ParseStrategy, Parser, ParserRegistry};
