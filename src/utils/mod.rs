//! Small helpers shared across modules.

pub mod env;
pub mod logger;
