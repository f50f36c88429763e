//! The host substrate: kernels are Rust functions run over every cell with `rayon`.

use glam::Vec4;
use rayon::prelude::*;

use crate::error::{EngineError, EngineResult};
use crate::grid::{to_coordinate, to_index};
use crate::kernel::{Cell, Input, Program};
use crate::variable::Variable;

/// How many rows each rayon task computes.
const ROWS_PER_TASK: usize = 4;

/// Step every variable once, in registration order.
///
/// Each variable's next buffer is filled from its dependencies' current buffers. Since a
/// variable can depend on itself, the next buffers are taken out first so that the current ones
/// can be shared freely while they're written.
pub(crate) fn step(
    variables: &mut [Variable],
    generation: u64,
    width: u32,
    height: u32,
) -> EngineResult<()> {
    if let Some(variable) = variables
        .iter()
        .find(|variable| !matches!(variable.kernel.program(), Program::Host(_)))
    {
        return Err(EngineError::IncompatibleKernel {
            kernel: variable.kernel.platform().name(),
            substrate: "host",
        });
    }

    let current = crate::engine::slot(generation);
    let next = crate::engine::slot_after(current);

    if variables
        .iter()
        .any(|variable| variable.slots[next].host_cells().is_none())
    {
        return Err(EngineError::ForeignBuffer);
    }
    let mut outputs: Vec<Vec<Vec4>> = variables
        .iter_mut()
        .map(|variable| variable.slots[next].take_host().unwrap_or_default())
        .collect();

    let result = compute(variables, &mut outputs, current, generation, width, height);

    for (variable, cells) in variables.iter_mut().zip(outputs) {
        variable.slots[next].restore_host(cells);
    }
    result
}

/// Fill `outputs` from the `current` slots.
fn compute(
    variables: &[Variable],
    outputs: &mut [Vec<Vec4>],
    current: usize,
    generation: u64,
    width: u32,
    height: u32,
) -> EngineResult<()> {
    let row = to_index(width);

    for (variable, output) in variables.iter().zip(outputs.iter_mut()) {
        let Program::Host(function) = variable.kernel.program() else {
            continue;
        };
        let inputs = variable
            .dependencies
            .iter()
            .map(|handle| {
                let dependency = variables
                    .get(handle.index())
                    .ok_or_else(|| EngineError::UnknownVariable(format!("#{}", handle.index())))?;
                let cells = dependency.slots[current]
                    .host_cells()
                    .ok_or(EngineError::ForeignBuffer)?;
                Ok(Input {
                    name: &dependency.name,
                    cells,
                })
            })
            .collect::<EngineResult<Vec<Input<'_>>>>()?;
        let uniforms = variable.kernel.uniforms();

        output
            .par_chunks_mut(row * ROWS_PER_TASK)
            .enumerate()
            .for_each(|(chunk, cells)| {
                for (offset, cell) in cells.iter_mut().enumerate() {
                    let index = chunk * row * ROWS_PER_TASK + offset;
                    let position = (to_coordinate(index % row), to_coordinate(index / row));
                    *cell = function(&Cell::new(
                        position,
                        (width, height),
                        generation,
                        &inputs,
                        uniforms,
                    ));
                }
            });
    }
    Ok(())
}
