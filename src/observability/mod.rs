//! Log subscriber setup for the server binary.

mod tracing_init;

pub use tracing_init::*;
