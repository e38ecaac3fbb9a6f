//! CLI command handlers
//!
//! Parsing lives in [`parser`]; each subcommand has its own module.

pub mod audit;
pub mod monitor;
pub mod parser;
pub mod run;

pub use parser::*;
