//! Cinch - distributed CI control plane.

mod cli;
mod runtime;

pub use cli::Cli;
