//! The per-cell maths, aka the kernels. We keep them in a seperate crate so that the host substrate,
//! the tests and the GPU all agree on one definition of each.
//!
//! Every kernel here exists twice: as plain Rust, which the host substrate calls once per cell, and
//! as WGSL source, which the device substrate compiles into a compute pipeline. The two are kept
//! operation-for-operation alike so that results only differ by the GPU's own float rounding.

pub mod field;
pub mod reduce;
pub mod sampling;
