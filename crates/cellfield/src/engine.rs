//! `Engine`: steps a set of double-buffered variables in lockstep.
//!
//! Every variable owns two buffers. Which one holds the latest completed generation is a pure
//! function of the engine's generation counter, so all variables swap together, exactly once per
//! step, after every kernel has run. Kernels only ever read their dependencies' current buffers.
//! That means a dependency is always one step behind, cycles between variables are harmless and
//! registration order never changes the result.

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::grid::GridBuffer;
use crate::kernel::{is_identifier, Kernel, Platform};
use crate::reduction::ReductionPipeline;
use crate::variable::{Variable, VariableHandle};

/// The ways of running kernels.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputeType {
    /// Rust kernels on the CPU, spread over every core with rayon. Slow but needs no GPU.
    Cpu,
    /// WGSL compute shaders on whatever GPU wgpu finds.
    Gpu,
}

/// Where an engine's buffers live and its kernels run.
#[derive(Clone, Debug)]
pub enum ExecutionContext {
    /// Host memory and host kernels.
    Host,
    /// GPU memory and compute shaders. Shareable between engines, so that a resized engine can be
    /// rebuilt without reopening the device.
    Device(Arc<crate::gpu::Context>),
}

impl ExecutionContext {
    /// Set up the substrate for a compute type.
    ///
    /// # Errors
    /// `ExecutionContextLost` if a GPU was asked for but there isn't a usable one.
    pub fn new(compute: ComputeType) -> EngineResult<Self> {
        match compute {
            ComputeType::Cpu => Ok(Self::Host),
            ComputeType::Gpu => Ok(Self::Device(Arc::new(crate::gpu::Context::new()?))),
        }
    }

    /// The kernel platform this context runs.
    #[must_use]
    pub const fn platform(&self) -> Platform {
        match self {
            Self::Host => Platform::Host,
            Self::Device(_) => Platform::ComputeShader,
        }
    }

    /// A human readable name.
    #[must_use]
    pub const fn substrate(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Device(_) => "device",
        }
    }
}

/// The engine's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// No variables yet.
    Uninitialized,
    /// At least one variable. Stepping, reducing and reading are all allowed.
    Ready,
    /// Everything has been released. Every call fails.
    Disposed,
}

/// A snapshot of what the engine holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Completed steps.
    pub generation: u64,
    /// Registered variables.
    pub variables: usize,
    /// Buffers owned by variables, two per variable.
    pub resident_buffers: usize,
    /// Passes in the reduction chain, once it's been built.
    pub reduction_passes: usize,
}

/// Which of a variable's two buffers holds the state after `generation` steps.
#[must_use]
pub const fn slot(generation: u64) -> usize {
    if generation % 2 == 0 {
        0
    } else {
        1
    }
}

/// The other buffer of the pair.
pub(crate) const fn slot_after(slot: usize) -> usize {
    (slot + 1) % 2
}

/// Runs kernels over variables.
#[derive(Debug)]
pub struct Engine {
    /// Cells per row, for every buffer.
    width: u32,
    /// Rows, for every buffer.
    height: u32,
    /// Where everything lives.
    context: ExecutionContext,
    /// In registration order, indexed by `VariableHandle`.
    variables: Vec<Variable>,
    /// Completed steps.
    generation: u64,
    /// Built on the first reduction.
    reduction: Option<ReductionPipeline>,
    /// Set by `dispose()`.
    disposed: bool,
}

impl Engine {
    /// Instantiate. Every buffer the engine makes or accepts is `width × height`.
    ///
    /// # Errors
    /// `InvalidDimensions` if either dimension is 0, or `ExecutionContextLost` for a lost device.
    pub fn new(width: u32, height: u32, context: ExecutionContext) -> EngineResult<Self> {
        if width == 0 || height == 0 {
            return Err(EngineError::InvalidDimensions { width, height });
        }
        if let ExecutionContext::Device(device) = &context {
            device.ensure_alive()?;
        }

        tracing::info!(
            "Creating a {width}x{height} engine on the {} substrate",
            context.substrate()
        );
        Ok(Self {
            width,
            height,
            context,
            variables: Vec::new(),
            generation: 0,
            reduction: None,
            disposed: false,
        })
    }

    /// Cells per row.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Rows.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Where the engine's buffers live.
    #[must_use]
    pub const fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Completed steps.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Where the engine is in its lifecycle.
    #[must_use]
    pub fn state(&self) -> EngineState {
        if self.disposed {
            EngineState::Disposed
        } else if self.variables.is_empty() {
            EngineState::Uninitialized
        } else {
            EngineState::Ready
        }
    }

    /// Counts of everything the engine holds.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            generation: self.generation,
            variables: self.variables.len(),
            resident_buffers: self.variables.len() * 2,
            reduction_passes: self
                .reduction
                .as_ref()
                .map_or(0, ReductionPipeline::pass_count),
        }
    }

    /// Fail if the engine has been disposed.
    const fn ensure_live(&self) -> EngineResult<()> {
        if self.disposed {
            return Err(EngineError::EngineDisposed);
        }
        Ok(())
    }

    /// A neutral buffer of the engine's size, for seeding.
    ///
    /// # Errors
    /// `EngineDisposed`.
    pub fn create_buffer(&self) -> EngineResult<GridBuffer> {
        self.ensure_live()?;
        Ok(self.allocate("cellfield buffer"))
    }

    /// A zeroed buffer wherever the engine computes.
    fn allocate(&self, label: &str) -> GridBuffer {
        match &self.context {
            ExecutionContext::Host => GridBuffer::host(self.width, self.height),
            ExecutionContext::Device(device) => {
                GridBuffer::device(device, self.width, self.height, label)
            }
        }
    }

    /// Add a variable, with both of its buffers holding a copy of `initial`. It starts without
    /// dependencies.
    ///
    /// # Errors
    /// - `InvalidName` if `name` isn't an identifier, or the kernel declares a uniform that isn't.
    /// - `DuplicateVariable` if `name` is taken.
    /// - `IncompatibleKernel` if the kernel can't run on this engine's substrate.
    /// - `ShapeMismatch` or `ForeignBuffer` if `initial` isn't one of this engine's buffers.
    /// - `EngineDisposed`.
    pub fn register_variable(
        &mut self,
        name: &str,
        kernel: Kernel,
        initial: &GridBuffer,
    ) -> EngineResult<VariableHandle> {
        self.ensure_live()?;
        if !is_identifier(name) {
            return Err(EngineError::InvalidName(name.to_owned()));
        }
        if self.variable(name).is_some() {
            return Err(EngineError::DuplicateVariable(name.to_owned()));
        }
        if kernel.platform() != self.context.platform() {
            return Err(EngineError::IncompatibleKernel {
                kernel: kernel.platform().name(),
                substrate: self.context.substrate(),
            });
        }
        kernel.validate()?;

        let mut slots = [self.allocate(name), self.allocate(name)];
        for slot in &mut slots {
            slot.copy_from(initial)?;
        }

        let handle = VariableHandle(self.variables.len());
        self.variables
            .push(Variable::new(name.to_owned(), slots, kernel));
        tracing::debug!("Registered variable `{name}` as {handle:?}");
        Ok(handle)
    }

    /// Look up a variable by name.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<VariableHandle> {
        self.variables
            .iter()
            .position(|variable| variable.name == name)
            .map(VariableHandle)
    }

    /// The registered variable a handle refers to.
    fn get(&self, handle: VariableHandle) -> EngineResult<&Variable> {
        self.variables
            .get(handle.0)
            .ok_or_else(|| unknown(handle))
    }

    /// The registered variable a handle refers to.
    fn get_mut(&mut self, handle: VariableHandle) -> EngineResult<&mut Variable> {
        self.variables
            .get_mut(handle.0)
            .ok_or_else(|| unknown(handle))
    }

    /// Replace the variables whose current buffers `handle`'s kernel reads. A variable may depend on
    /// itself, and repeats are ignored. Applies from the next step.
    ///
    /// # Errors
    /// `UnknownVariable` if any handle isn't registered, in which case nothing changes. Or
    /// `EngineDisposed`.
    pub fn set_dependencies(
        &mut self,
        handle: VariableHandle,
        dependencies: &[VariableHandle],
    ) -> EngineResult<()> {
        self.ensure_live()?;
        if let Some(missing) = dependencies
            .iter()
            .find(|dependency| dependency.0 >= self.variables.len())
        {
            return Err(unknown(*missing));
        }
        let variable = self.get_mut(handle)?;
        variable.set_dependencies(dependencies);
        tracing::debug!(
            "`{}` now depends on {:?}",
            variable.name,
            variable.dependencies
        );
        Ok(())
    }

    /// `set_dependencies()` by variable name.
    ///
    /// # Errors
    /// `UnknownVariable` naming the first name that isn't registered. Or `EngineDisposed`.
    pub fn set_dependencies_by_name(
        &mut self,
        handle: VariableHandle,
        names: &[&str],
    ) -> EngineResult<()> {
        self.ensure_live()?;
        let dependencies = names
            .iter()
            .map(|name| {
                self.variable(name)
                    .ok_or_else(|| EngineError::UnknownVariable((*name).to_owned()))
            })
            .collect::<EngineResult<Vec<_>>>()?;
        self.set_dependencies(handle, &dependencies)
    }

    /// Set one of a variable's kernel uniforms. Applies from the next step.
    ///
    /// # Errors
    /// `UnknownUniform` if the kernel doesn't declare `name`, `UnknownVariable` or
    /// `EngineDisposed`.
    pub fn set_uniform(&mut self, handle: VariableHandle, name: &str, value: f32) -> EngineResult<()> {
        self.ensure_live()?;
        self.get_mut(handle)?.kernel.set_uniform(name, value)
    }

    /// The kernel a variable runs.
    ///
    /// # Errors
    /// `UnknownVariable` or `EngineDisposed`.
    pub fn kernel(&self, handle: VariableHandle) -> EngineResult<&Kernel> {
        self.ensure_live()?;
        Ok(&self.get(handle)?.kernel)
    }

    /// Advance every variable by one generation.
    ///
    /// Each kernel runs once per cell of its variable's next buffer, reading only current buffers.
    /// Then, and only then, the generation advances, which makes every next buffer current at once.
    /// Without any variables this does nothing.
    ///
    /// # Errors
    /// `ExecutionContextLost` if the device fails, after which the engine should be disposed and
    /// rebuilt. Or `EngineDisposed`.
    pub fn step(&mut self) -> EngineResult<()> {
        self.ensure_live()?;
        if self.variables.is_empty() {
            return Ok(());
        }

        match &self.context {
            ExecutionContext::Host => crate::cpu::step(
                &mut self.variables,
                self.generation,
                self.width,
                self.height,
            )?,
            ExecutionContext::Device(device) => crate::gpu::step(
                device,
                &mut self.variables,
                self.generation,
                self.width,
                self.height,
            )?,
        }

        self.generation += 1;
        tracing::trace!("Completed generation {}", self.generation);
        Ok(())
    }

    /// The buffer holding a variable's latest completed generation.
    ///
    /// # Errors
    /// `UnknownVariable` or `EngineDisposed`.
    pub fn current_buffer(&self, handle: VariableHandle) -> EngineResult<&GridBuffer> {
        self.ensure_live()?;
        Ok(self.get(handle)?.current(self.generation))
    }

    /// The mean of channel 0 of one of this engine's buffers. Blocks on the GPU, so call it
    /// sparingly.
    ///
    /// # Errors
    /// `ShapeMismatch` or `ForeignBuffer` for a buffer from elsewhere, `ExecutionContextLost` or
    /// `EngineDisposed`.
    pub fn reduce(&mut self, buffer: &GridBuffer) -> EngineResult<f32> {
        self.ensure_live()?;
        let mut reduction = self.take_reduction()?;
        let average = reduction.reduce(buffer);
        self.reduction = Some(reduction);
        average
    }

    /// The mean of channel 0 of a variable's current buffer.
    ///
    /// # Errors
    /// `UnknownVariable`, `ExecutionContextLost` or `EngineDisposed`.
    pub fn reduce_variable(&mut self, handle: VariableHandle) -> EngineResult<f32> {
        self.ensure_live()?;
        let mut reduction = self.take_reduction()?;
        let average = match self.variables.get(handle.0) {
            Some(variable) => reduction.reduce(variable.current(self.generation)),
            None => Err(unknown(handle)),
        };
        self.reduction = Some(reduction);
        average
    }

    /// The reduction chain, built on first use. It has to be put back after use.
    fn take_reduction(&mut self) -> EngineResult<ReductionPipeline> {
        match self.reduction.take() {
            Some(reduction) if reduction.matches(self.width, self.height) => Ok(reduction),
            _ => ReductionPipeline::new(&self.context, self.width, self.height),
        }
    }

    /// Release every buffer and pass. Every later call fails with `EngineDisposed`.
    ///
    /// # Errors
    /// `EngineDisposed` if it's already been disposed.
    pub fn dispose(&mut self) -> EngineResult<()> {
        self.ensure_live()?;
        tracing::debug!(
            "Disposing engine with {} variables after {} generations",
            self.variables.len(),
            self.generation
        );
        self.variables.clear();
        self.reduction = None;
        self.generation = 0;
        self.disposed = true;
        Ok(())
    }
}

/// The error for a handle that doesn't refer to a registered variable.
fn unknown(handle: VariableHandle) -> EngineError {
    EngineError::UnknownVariable(format!("#{}", handle.index()))
}
