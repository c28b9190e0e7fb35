//! CLI command implementations.

pub mod dead_letters;
pub mod history;
pub mod resolve;
pub mod run;
pub mod status;
