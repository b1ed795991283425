//! Desired and observed cluster state.

pub mod cluster;
pub mod instance;

pub use cluster::*;
pub use instance::*;
