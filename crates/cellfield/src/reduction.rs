//! `ReductionPipeline`: the mean of channel 0 of a grid, in a logarithmic number of passes.
//!
//! Every pass averages 2×2 blocks of its predecessor's output, halving both dimensions until a
//! single cell is left. Blocks are clamped to the edges rather than wrapped around them, so cells
//! on opposite edges are never averaged together. Only that final cell is copied back to the host.
//!
//! Sums are plain `f32` at every level. On very large grids this loses some precision.

use std::sync::Arc;

use cellfield_kernel::reduce::{block_mean, pass_sizes, REDUCE_WGSL};
use glam::Vec4;
use rayon::prelude::*;
use wgpu::util::DeviceExt as _;

use crate::engine::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::gpu::{self, DeviceGrid};
use crate::grid::{cell_count, to_coordinate, to_index, GridBuffer, CHANNELS};

/// A chain of 2×2 averaging passes for grids of one size.
#[derive(Debug)]
pub struct ReductionPipeline {
    /// Width of the grids this chain reduces.
    width: u32,
    /// Height of the grids this chain reduces.
    height: u32,
    /// The passes and their output buffers.
    passes: Passes,
}

/// Pass outputs, wherever the grids live.
#[derive(Debug)]
enum Passes {
    /// One `f32` per output cell, in host memory.
    Host(Vec<HostPass>),
    /// Storage buffers on the GPU.
    Device(DevicePasses),
}

impl ReductionPipeline {
    /// Build every pass needed to bring a `width × height` grid down to a single cell.
    ///
    /// # Errors
    /// `InvalidDimensions` for an empty grid, or `ExecutionContextLost` if the device can't build
    /// the passes.
    pub fn new(context: &ExecutionContext, width: u32, height: u32) -> EngineResult<Self> {
        if width == 0 || height == 0 {
            return Err(EngineError::InvalidDimensions { width, height });
        }

        let sizes = pass_sizes(width, height);
        tracing::debug!(
            "Building a {}-pass reduction chain for a {width}x{height} grid",
            sizes.len()
        );
        let passes = match context {
            ExecutionContext::Host => Passes::Host(
                sizes
                    .iter()
                    .map(|&(pass_width, pass_height)| HostPass::new(pass_width, pass_height))
                    .collect(),
            ),
            ExecutionContext::Device(device) => {
                Passes::Device(DevicePasses::new(device, width, height, &sizes)?)
            }
        };

        Ok(Self {
            width,
            height,
            passes,
        })
    }

    /// Whether this chain reduces grids of the given size.
    #[must_use]
    pub const fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    /// The number of passes in the chain. 0 for a 1×1 grid.
    #[must_use]
    pub fn pass_count(&self) -> usize {
        match &self.passes {
            Passes::Host(passes) => passes.len(),
            Passes::Device(passes) => passes.stages.len(),
        }
    }

    /// The mean of channel 0 of `source`. Out of range values aren't clamped.
    ///
    /// On the GPU this blocks until the device has finished everything submitted before it.
    ///
    /// # Errors
    /// `ShapeMismatch` if `source` isn't the size this chain was built for, `ForeignBuffer` if it
    /// lives somewhere else, or `ExecutionContextLost` if the device fails.
    pub fn reduce(&mut self, source: &GridBuffer) -> EngineResult<f32> {
        if !self.matches(source.width(), source.height()) {
            return Err(EngineError::ShapeMismatch {
                expected: cell_count(self.width, self.height) * CHANNELS,
                actual: source.len(),
            });
        }

        match &mut self.passes {
            Passes::Host(passes) => {
                let cells = source.host_cells().ok_or(EngineError::ForeignBuffer)?;
                Ok(reduce_host(cells, self.width, self.height, passes))
            }
            Passes::Device(passes) => {
                passes.reduce(source.device_grid().ok_or(EngineError::ForeignBuffer)?)
            }
        }
    }
}

/// One pass's output in host memory.
#[derive(Debug)]
struct HostPass {
    /// Output width.
    width: u32,
    /// Output height.
    height: u32,
    /// The block means.
    cells: Vec<f32>,
}

impl HostPass {
    /// Instantiate.
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![0.0; cell_count(width, height)],
        }
    }

    /// Average every 2×2 block of a `width × height` input.
    fn fill(&mut self, fetch: impl Fn(usize) -> f32 + Sync, width: u32, height: u32) {
        let row = to_index(self.width);
        self.cells
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, cell)| {
                *cell = block_mean(
                    &fetch,
                    to_coordinate(index % row),
                    to_coordinate(index / row),
                    width,
                    height,
                );
            });
    }
}

/// Run every host pass over `source` and return the final cell.
fn reduce_host(source: &[Vec4], width: u32, height: u32, passes: &mut [HostPass]) -> f32 {
    let Some((first, rest)) = passes.split_first_mut() else {
        return source.first().map_or(0.0, |cell| cell.x);
    };

    first.fill(
        |index| source.get(index).map_or(0.0, |cell| cell.x),
        width,
        height,
    );
    let mut previous: &HostPass = first;
    for pass in rest {
        pass.fill(
            |index| previous.cells.get(index).copied().unwrap_or_default(),
            previous.width,
            previous.height,
        );
        previous = pass;
    }
    previous.cells.first().copied().unwrap_or_default()
}

/// The `pass_info` uniform of the reduction shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct PassInfo {
    /// Input width.
    input_width: u32,
    /// Input height.
    input_height: u32,
    /// Output width.
    output_width: u32,
    /// Output height.
    output_height: u32,
}

/// The whole chain on the GPU. Every pass shares one pipeline.
#[derive(Debug)]
struct DevicePasses {
    /// The GPU the passes run on.
    context: Arc<gpu::Context>,
    /// The compiled 2×2 mean.
    pipeline: wgpu::ComputePipeline,
    /// Layout of every pass's bindings.
    layout: wgpu::BindGroupLayout,
    /// The passes, in order.
    stages: Vec<Stage>,
    /// Where the final cell lands for the CPU to read.
    staging: wgpu::Buffer,
}

/// One pass on the GPU.
#[derive(Debug)]
struct Stage {
    /// Output dimensions.
    size: (u32, u32),
    /// Holds a `PassInfo`.
    info: wgpu::Buffer,
    /// The block means, in channel 0 of each cell.
    output: wgpu::Buffer,
    /// Bindings to the previous pass's output. The first pass reads whichever grid it's handed, so
    /// its bindings are made on each call.
    bind_group: Option<wgpu::BindGroup>,
}

impl DevicePasses {
    /// Compile the shader and allocate every pass's output.
    fn new(
        context: &Arc<gpu::Context>,
        width: u32,
        height: u32,
        sizes: &[(u32, u32)],
    ) -> EngineResult<Self> {
        context.checked("Building the reduction chain", |device, _| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("cellfield reduction"),
                source: wgpu::ShaderSource::Wgsl(REDUCE_WGSL.into()),
            });
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("cellfield reduction"),
                entries: &[
                    gpu::uniform_layout_entry(0),
                    gpu::storage_layout_entry(1, true),
                    gpu::storage_layout_entry(2, false),
                ],
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("cellfield reduction"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("cellfield reduction"),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

            let mut stages: Vec<Stage> = Vec::with_capacity(sizes.len());
            let mut input = (width, height);
            for &size in sizes {
                let info = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("cellfield reduction pass"),
                    contents: bytemuck::bytes_of(&PassInfo {
                        input_width: input.0,
                        input_height: input.1,
                        output_width: size.0,
                        output_height: size.1,
                    }),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
                let output = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("cellfield reduction pass"),
                    size: u64::try_from(cell_count(size.0, size.1))
                        .map_or(u64::MAX, |cells| cells.saturating_mul(gpu::CELL_BYTES)),
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                });

                let bind_group = stages.last().map(|previous| {
                    device.create_bind_group(&wgpu::BindGroupDescriptor {
                        label: Some("cellfield reduction pass"),
                        layout: &layout,
                        entries: &[
                            wgpu::BindGroupEntry {
                                binding: 0,
                                resource: info.as_entire_binding(),
                            },
                            wgpu::BindGroupEntry {
                                binding: 1,
                                resource: previous.output.as_entire_binding(),
                            },
                            wgpu::BindGroupEntry {
                                binding: 2,
                                resource: output.as_entire_binding(),
                            },
                        ],
                    })
                });

                stages.push(Stage {
                    size,
                    info,
                    output,
                    bind_group,
                });
                input = size;
            }

            let staging = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("cellfield reduction result"),
                size: gpu::CELL_BYTES,
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            });

            Self {
                context: Arc::clone(context),
                pipeline,
                layout,
                stages,
                staging,
            }
        })
    }

    /// Run every pass over `source` and read back the final cell.
    fn reduce(&self, source: &DeviceGrid) -> EngineResult<f32> {
        if !Arc::ptr_eq(source.context(), &self.context) {
            return Err(EngineError::ForeignBuffer);
        }

        self.context.checked("Reducing a grid", |device, queue| {
            let first = self.stages.first().map(|stage| {
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("cellfield reduction pass"),
                    layout: &self.layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: stage.info.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: source.buffer().as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: stage.output.as_entire_binding(),
                        },
                    ],
                })
            });

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("cellfield reduction"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("cellfield reduction"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.pipeline);
                for (index, stage) in self.stages.iter().enumerate() {
                    let bind_group = if index == 0 {
                        first.as_ref()
                    } else {
                        stage.bind_group.as_ref()
                    };
                    let Some(bind_group) = bind_group else {
                        continue;
                    };
                    pass.set_bind_group(0, bind_group, &[]);
                    pass.dispatch_workgroups(
                        stage.size.0.div_ceil(gpu::WORKGROUP_SIZE),
                        stage.size.1.div_ceil(gpu::WORKGROUP_SIZE),
                        1,
                    );
                }
            }

            // A 1×1 grid has no passes, its only cell is the answer.
            let result = self
                .stages
                .last()
                .map_or_else(|| source.buffer(), |stage| &stage.output);
            encoder.copy_buffer_to_buffer(result, 0, &self.staging, 0, gpu::CELL_BYTES);
            queue.submit([encoder.finish()]);
        })?;

        self.context
            .map_read(&self.staging)?
            .first()
            .copied()
            .ok_or_else(|| EngineError::context_lost("The reduction read back nothing"))
    }
}

#[cfg(test)]
mod test {
    use cellfield_kernel::sampling::wrapped_index;

    use super::*;

    fn pipeline(width: u32, height: u32) -> ReductionPipeline {
        ReductionPipeline::new(&ExecutionContext::Host, width, height).unwrap()
    }

    fn grid(width: u32, height: u32, energy: impl Fn(u32, u32) -> f32) -> GridBuffer {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                data.extend([energy(x, y), 0.25, 0.5, 0.75]);
            }
        }
        let mut buffer = GridBuffer::host(width, height);
        buffer.upload(&data).unwrap();
        buffer
    }

    #[test]
    fn constants_reduce_to_themselves() {
        for size in [1, 2, 3, 4, 5, 8, 16, 31, 64] {
            let mut reduction = pipeline(size, size);
            let average = reduction.reduce(&grid(size, size, |_, _| 0.3)).unwrap();
            assert!(
                (average - 0.3).abs() < 1e-6,
                "{size}x{size} reduced to {average}"
            );
        }
    }

    #[test]
    fn checkerboard_is_half() {
        let mut reduction = pipeline(4, 4);
        assert_eq!(reduction.pass_count(), 2);
        let checkerboard = grid(4, 4, |x, y| if (x + y) % 2 == 0 { 1.0 } else { 0.0 });
        let average = reduction.reduce(&checkerboard).unwrap();
        assert!((average - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn scaling_the_input_scales_the_mean() {
        let mut reduction = pipeline(16, 16);
        let pattern = |x: u32, y: u32| f32::from(u16::try_from((x * 7 + y * 3) % 11).unwrap()) / 10.0;
        let plain = reduction.reduce(&grid(16, 16, pattern)).unwrap();
        let scaled = reduction
            .reduce(&grid(16, 16, |x, y| pattern(x, y) * 3.0))
            .unwrap();
        assert!((scaled - plain * 3.0).abs() < 1e-5);
    }

    #[test]
    fn out_of_range_values_are_not_clamped() {
        let mut reduction = pipeline(2, 2);
        let average = reduction.reduce(&grid(2, 2, |_, _| 4.0)).unwrap();
        assert!((average - 4.0).abs() < f32::EPSILON);
    }

    #[test]
    fn single_cell_needs_no_passes() {
        let mut reduction = pipeline(1, 1);
        assert_eq!(reduction.pass_count(), 0);
        assert!((reduction.reduce(&grid(1, 1, |_, _| 0.7)).unwrap() - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn rectangles_reduce_each_dimension_independently() {
        let mut reduction = pipeline(8, 2);
        assert_eq!(reduction.pass_count(), 3);
        let average = reduction
            .reduce(&grid(8, 2, |x, _| if x < 4 { 1.0 } else { 0.0 }))
            .unwrap();
        assert!((average - 0.5).abs() < f32::EPSILON);
    }

    /// The same chain of 2×2 means, but with blocks wrapping around the edges.
    fn wrapped_mean(cells: &[f32], width: u32, height: u32) -> f32 {
        let mut input = (cells.to_vec(), width, height);
        for (pass_width, pass_height) in pass_sizes(width, height) {
            let mut output = Vec::new();
            for y in 0..i64::from(pass_height) {
                for x in 0..i64::from(pass_width) {
                    let at = |dx: i64, dy: i64| {
                        input.0[wrapped_index(x * 2 + dx, y * 2 + dy, input.1, input.2)]
                    };
                    output.push((at(0, 0) + at(1, 0) + at(0, 1) + at(1, 1)) * 0.25);
                }
            }
            input = (output, pass_width, pass_height);
        }
        input.0[0]
    }

    #[test]
    fn odd_grids_keep_their_last_row_and_column() {
        let mut reduction = pipeline(3, 3);
        assert_eq!(reduction.pass_count(), 2);
        let edges = |x: u32, y: u32| if x == 2 || y == 2 { 1.0 } else { 0.0 };
        let average = reduction.reduce(&grid(3, 3, edges)).unwrap();
        assert!((average - 0.75).abs() < f32::EPSILON, "reduced to {average}");

        let cells: Vec<f32> = (0..9).map(|index| edges(index % 3, index / 3)).collect();
        let wrapped = wrapped_mean(&cells, 3, 3);
        assert!((wrapped - 0.4375).abs() < f32::EPSILON);
    }

    #[test]
    fn odd_edges_are_clamped_not_wrapped() {
        let mut reduction = pipeline(5, 1);
        assert_eq!(reduction.pass_count(), 3);
        let last = |x: u32, _| if x == 4 { 1.0 } else { 0.0 };
        let average = reduction.reduce(&grid(5, 1, last)).unwrap();
        assert!((average - 0.5).abs() < f32::EPSILON, "reduced to {average}");

        let wrapped = wrapped_mean(&[0.0, 0.0, 0.0, 0.0, 1.0], 5, 1);
        assert!((wrapped - 0.125).abs() < f32::EPSILON);
    }

    #[test]
    fn rejects_other_sizes() {
        let mut reduction = pipeline(4, 4);
        assert!(matches!(
            reduction.reduce(&GridBuffer::host(2, 2)),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_empty_grids() {
        assert!(matches!(
            ReductionPipeline::new(&ExecutionContext::Host, 0, 4),
            Err(EngineError::InvalidDimensions { .. })
        ));
    }

    #[test]
    #[ignore = "Requires a GPU adapter"]
    fn device_checkerboard_is_half() {
        let context = ExecutionContext::new(crate::engine::ComputeType::Gpu).unwrap();
        let ExecutionContext::Device(device) = &context else {
            panic!("Expected a GPU context");
        };
        let mut data = Vec::new();
        for y in 0..4_u32 {
            for x in 0..4_u32 {
                data.extend([if (x + y) % 2 == 0 { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0]);
            }
        }
        let mut source = GridBuffer::device(device, 4, 4, "test");
        source.upload(&data).unwrap();

        let mut reduction = ReductionPipeline::new(&context, 4, 4).unwrap();
        let average = reduction.reduce(&source).unwrap();
        assert!((average - 0.5).abs() < f32::EPSILON);
    }
}
