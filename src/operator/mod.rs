//! The operator side: turns SVNServer objects and everything referencing them
//! into running children.
pub mod api;
pub mod controller;
pub mod drift;
pub mod index;
pub mod resources;
pub mod snapshot;
pub mod synthesizer;

#[cfg(test)]
mod fake;

pub use controller::run;
