//! Command implementations for the `aegis` CLI.

pub mod simulate;
pub mod validate;
