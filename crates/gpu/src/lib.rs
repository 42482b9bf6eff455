//! `fluxbot-gpu` library crate.
//!
//! GPU memory probing and the admission gate applied before a cold
//! engine start.

pub mod admission;
pub mod collector;
pub mod probe;
pub mod smi;

pub use admission::{AdmissionConfig, AdmissionController};
pub use collector::NvmlProbe;
pub use probe::{ProbeUnavailable, ResourceProbe, ResourceUsage};
