//! CLI command implementations.

pub mod cleanup;
pub mod run;
pub mod status;
