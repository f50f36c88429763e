//! A named, double-buffered field and the kernel that advances it.

use crate::grid::GridBuffer;
use crate::kernel::Kernel;

/// Refers to a variable registered with an `Engine`. Handles are only meaningful to the engine
/// that issued them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VariableHandle(pub(crate) usize);

impl VariableHandle {
    /// Registration order, starting at 0.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A `ComputeVariable`.
#[derive(Debug)]
pub(crate) struct Variable {
    /// Unique within the engine, and a valid identifier.
    pub name: String,
    /// The ping-pong pair. Which one is current depends only on the engine's generation.
    pub slots: [GridBuffer; 2],
    /// Variables whose current generation the kernel reads, without repeats.
    pub dependencies: Vec<VariableHandle>,
    /// Computes the next generation of every cell.
    pub kernel: Kernel,
    /// The compiled kernel, for GPU engines. Rebuilt whenever the bindings change.
    pub pipeline: Option<crate::gpu::StepPipeline>,
}

impl Variable {
    /// Instantiate with no dependencies.
    pub fn new(name: String, slots: [GridBuffer; 2], kernel: Kernel) -> Self {
        Self {
            name,
            slots,
            dependencies: Vec::new(),
            kernel,
            pipeline: None,
        }
    }

    /// Replace the dependency list. Repeats are dropped, keeping the first occurrence.
    pub fn set_dependencies(&mut self, dependencies: &[VariableHandle]) {
        let mut unique = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            if !unique.contains(dependency) {
                unique.push(*dependency);
            }
        }
        self.dependencies = unique;
        self.pipeline = None;
    }

    /// The buffer holding the most recently completed generation.
    pub fn current(&self, generation: u64) -> &GridBuffer {
        &self.slots[crate::engine::slot(generation)]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dependencies_are_unique() {
        let slots = [GridBuffer::host(1, 1), GridBuffer::host(1, 1)];
        let mut variable = Variable::new(
            "field".to_owned(),
            slots,
            Kernel::host(|_| glam::Vec4::ZERO, &[]),
        );
        variable.set_dependencies(&[VariableHandle(2), VariableHandle(0), VariableHandle(2)]);
        assert_eq!(
            variable.dependencies,
            [VariableHandle(2), VariableHandle(0)]
        );
    }
}
