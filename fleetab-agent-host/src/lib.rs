//! FleetAB agent host - runs collectors and load generators for experiments
//!
//! The agent only ever talks outward: it long-polls the kernel for tasks,
//! supervises the processes those tasks describe and reports back.

pub mod client;
pub mod config;
pub mod discovery;
pub mod metrics;
pub mod protocol;
pub mod render;
pub mod runtime;
pub mod supervisor;
