//! Everything that can go wrong inside the engine.
//!
//! No operation is retried internally: every failure is handed straight back to the caller. After
//! an `ExecutionContextLost` the device-resident state can't be trusted, so the caller should
//! dispose the engine, build a new one and re-seed every buffer.

use thiserror::Error;

/// Errors raised by the engine and its buffers.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine was asked for a grid without any cells.
    #[error("Invalid grid dimensions {width}x{height}: both must be at least 1")]
    InvalidDimensions {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },

    /// Data doesn't match the `width × height × 4` layout of a buffer.
    #[error("Expected {expected} values but got {actual}")]
    ShapeMismatch {
        /// The number of `f32` values the buffer holds.
        expected: usize,
        /// The number of `f32` values that were supplied.
        actual: usize,
    },

    /// A dependency, or a handle, doesn't refer to a registered variable.
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    /// The engine was used after `dispose()`.
    #[error("The engine has been disposed")]
    EngineDisposed,

    /// The device failed: a kernel didn't compile, a dispatch was rejected or the device went
    /// away. Nothing on the device can be trusted after this.
    #[error("Execution context lost: {0}")]
    ExecutionContextLost(String),

    /// A uniform was set that its kernel never declared.
    #[error("The kernel doesn't declare a uniform called `{0}`")]
    UnknownUniform(String),

    /// Variable and uniform names end up in generated shader source, so they must be identifiers.
    #[error("`{0}` is not a valid identifier")]
    InvalidName(String),

    /// Variable names are unique within an engine.
    #[error("A variable called `{0}` is already registered")]
    DuplicateVariable(String),

    /// The kernel's program can't run on the engine's substrate.
    #[error("A {kernel} kernel can't run on the {substrate} substrate")]
    IncompatibleKernel {
        /// The kernel's platform.
        kernel: &'static str,
        /// The engine's substrate.
        substrate: &'static str,
    },

    /// A buffer was handed to an engine that lives on a different substrate or device.
    #[error("The buffer belongs to a different execution context")]
    ForeignBuffer,
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Create a lost context error.
    pub fn context_lost(message: impl Into<String>) -> Self {
        Self::ExecutionContextLost(message.into())
    }
}
