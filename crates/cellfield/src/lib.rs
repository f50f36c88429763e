//! A double-buffered cellular field engine, with a hierarchical mean reduction.
//!
//! An [`Engine`] owns named variables. Each variable is a pair of [`GridBuffer`]s and a [`Kernel`]
//! that computes one cell of the next generation from the current generation of the variables it
//! depends on. [`Engine::step`] runs every kernel and then swaps every pair at once.
//! [`Engine::reduce`] collapses channel 0 of a grid to its mean with a chain of 2×2 averaging
//! passes, only copying the final value back to the host.
//!
//! Kernels run either as WGSL compute shaders through wgpu, or as plain Rust functions on the CPU.

pub mod engine;
pub mod error;
pub mod gpu;
pub mod grid;
pub mod kernel;
pub mod reduction;

mod cpu;
mod variable;

pub use engine::{slot, ComputeType, Engine, EngineState, EngineStats, ExecutionContext};
pub use error::{EngineError, EngineResult};
pub use glam::Vec4;
pub use grid::{GridBuffer, CHANNELS};
pub use kernel::{Cell, Kernel, Platform, Program};
pub use reduction::ReductionPipeline;
pub use variable::VariableHandle;
