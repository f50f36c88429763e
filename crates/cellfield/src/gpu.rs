//! The wgpu substrate.
//!
//! Cells live in storage buffers of `vec4<f32>`, one per ping-pong slot. A variable's kernel is
//! compiled into a compute pipeline the first time it's stepped, and again whenever its
//! dependencies change. Nothing leaves the device during a step. The only read-backs are explicit:
//! `GridBuffer::read` and the final cell of a reduction.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use wgpu::util::DeviceExt as _;

use crate::error::{EngineError, EngineResult};
use crate::variable::Variable;

/// The size in bytes of one cell: four `f32` channels.
pub(crate) const CELL_BYTES: u64 = 16;

/// Threads per workgroup along each axis. Must match the `@workgroup_size` of every shader.
pub(crate) const WORKGROUP_SIZE: u32 = 8;

/// The entrypoint generated for every variable kernel.
const STEP_ENTRYPOINT: &str = "cellfield_step";

/// The adapter, device and queue that every GPU engine and buffer computes with.
#[derive(Debug)]
pub struct Context {
    /// Used to create and manage GPU resources.
    device: wgpu::Device,
    /// Used to submit work for the GPU to process.
    queue: wgpu::Queue,
    /// Details of the physical GPU.
    info: wgpu::AdapterInfo,
    /// Set by wgpu when the device goes away.
    lost: Arc<AtomicBool>,
}

impl Context {
    /// Find a GPU and open a device on it.
    ///
    /// # Errors
    /// `ExecutionContextLost` if there's no adapter that can run compute shaders, or if it refuses
    /// to give us a device.
    pub fn new() -> EngineResult<Self> {
        // An `Instance` holds any "global" state wgpu needs and loads the vulkan/dx12/metal/opengl
        // libraries.
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());

        // Requesting an adapter is asynchronous in WebGPU. On native the future resolves
        // immediately, so we can block on it without harm.
        let adapter = pollster::block_on(instance.request_adapter(
            &wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            },
        ))
        .map_err(|error| EngineError::context_lost(format!("No suitable GPU adapter: {error}")))?;

        let info = adapter.get_info();
        tracing::info!("Running on Adapter: {:#?}", info);

        // wgpu supports "downlevel" devices that might not run compute shaders at all.
        if !adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(EngineError::context_lost(
                "Adapter does not support compute shaders",
            ));
        }

        // Every dependency is its own storage binding, so ask for as many as the adapter has.
        let required_limits = wgpu::Limits {
            max_storage_buffers_per_shader_stage: adapter
                .limits()
                .max_storage_buffers_per_shader_stage,
            ..wgpu::Limits::default()
        };
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("cellfield"),
            required_features: wgpu::Features::empty(),
            required_limits,
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|error| {
            EngineError::context_lost(format!("Failed to create a device: {error}"))
        })?;

        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            tracing::error!("GPU device lost ({reason:?}): {message}");
            flag.store(true, Ordering::SeqCst);
        });

        Ok(Self {
            device,
            queue,
            info,
            lost,
        })
    }

    /// Details of the physical GPU.
    #[must_use]
    pub const fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.info
    }

    /// Whether the device has gone away. Once lost, it never comes back.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Fail fast on a lost device.
    pub(crate) fn ensure_alive(&self) -> EngineResult<()> {
        if self.is_lost() {
            return Err(EngineError::context_lost("The GPU device was lost"));
        }
        Ok(())
    }

    /// The device.
    pub(crate) const fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// The queue.
    pub(crate) const fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Run `build` inside a validation error scope, so that a bad shader or a rejected dispatch
    /// comes back as an error rather than a panic on the device's timeline.
    pub(crate) fn checked<T>(
        &self,
        what: &str,
        build: impl FnOnce(&wgpu::Device, &wgpu::Queue) -> T,
    ) -> EngineResult<T> {
        self.ensure_alive()?;
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = build(&self.device, &self.queue);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(error) = validation.or(out_of_memory) {
            return Err(EngineError::context_lost(format!("{what}: {error}")));
        }
        self.ensure_alive()?;
        Ok(value)
    }

    /// Copy the start of `source` back to the host. Blocks until the device has caught up.
    pub(crate) fn download(&self, source: &wgpu::Buffer, size: u64) -> EngineResult<Vec<f32>> {
        // Only buffers with `MAP_READ` can be read by the CPU, and that usage can only be combined
        // with `COPY_DST`. So the data takes a detour through a staging buffer.
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("cellfield download"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        self.checked("Copying a buffer to the host", |device, queue| {
            let mut encoder =
                device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
            encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
            queue.submit([encoder.finish()]);
        })?;
        self.map_read(&staging)
    }

    /// Map a `MAP_READ` buffer that already has its copy submitted, and read it as `f32`s.
    pub(crate) fn map_read(&self, staging: &wgpu::Buffer) -> EngineResult<Vec<f32>> {
        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // The receiver only disappears if we've already bailed out below.
            let _ = sender.send(result);
        });

        // Mapping only resolves once the GPU is done with the buffer, which is the stall that
        // makes read-backs expensive.
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|error| EngineError::context_lost(format!("Polling the device: {error}")))?;
        receiver
            .recv()
            .map_err(|_| EngineError::context_lost("The device dropped a buffer mapping"))?
            .map_err(|error| EngineError::context_lost(format!("Mapping a buffer: {error}")))?;

        let values = {
            let data = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, f32>(&data).to_vec()
        };
        staging.unmap();
        Ok(values)
    }
}

/// Cells on the GPU.
#[derive(Debug)]
pub struct DeviceGrid {
    /// The context the buffer belongs to.
    context: Arc<Context>,
    /// The cells.
    buffer: wgpu::Buffer,
    /// Size in bytes.
    size: u64,
}

impl DeviceGrid {
    /// A zeroed storage buffer with room for `cells` cells.
    pub(crate) fn new(context: &Arc<Context>, cells: usize, label: &str) -> Self {
        let size = u64::try_from(cells).map_or(u64::MAX, |count| count.saturating_mul(CELL_BYTES));
        let buffer = context.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Self {
            context: Arc::clone(context),
            buffer,
            size,
        }
    }

    /// Replace the contents. The write lands before the next submitted command buffer.
    pub(crate) fn write(&self, data: &[f32]) -> EngineResult<()> {
        self.context.ensure_alive()?;
        self.context
            .queue()
            .write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
        Ok(())
    }

    /// Copy the contents back to the host.
    pub(crate) fn read(&self) -> EngineResult<Vec<f32>> {
        self.context.ensure_alive()?;
        self.context.download(&self.buffer, self.size)
    }

    /// Copy the contents of another buffer of the same size, device-side.
    pub(crate) fn copy_from(&self, source: &Self) -> EngineResult<()> {
        if !Arc::ptr_eq(&self.context, &source.context) {
            return Err(EngineError::ForeignBuffer);
        }
        self.context.checked("Copying a buffer", |device, queue| {
            let mut encoder =
                device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
            encoder.copy_buffer_to_buffer(&source.buffer, 0, &self.buffer, 0, self.size);
            queue.submit([encoder.finish()]);
        })
    }

    /// The wgpu buffer.
    pub(crate) const fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// The context the buffer belongs to.
    pub(crate) const fn context(&self) -> &Arc<Context> {
        &self.context
    }
}

/// The `grid` uniform every variable kernel can read.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct GridUniform {
    /// Cells per row.
    width: u32,
    /// Rows.
    height: u32,
    /// Completed steps, truncated to 32 bits.
    generation: u32,
    /// Padding.
    padding: u32,
}

/// A variable's compiled kernel, ready to dispatch.
#[derive(Debug)]
pub(crate) struct StepPipeline {
    /// The compiled kernel.
    pipeline: wgpu::ComputePipeline,
    /// Holds a `GridUniform`.
    grid: wgpu::Buffer,
    /// Holds the kernel's uniforms, padded to 16 bytes.
    uniforms: wgpu::Buffer,
    /// One bind group per ping-pong parity, indexed by the current slot. Each writes the other
    /// slot and reads the dependencies' current slots.
    bind_groups: [wgpu::BindGroup; 2],
}

impl StepPipeline {
    /// Compile the kernel of `variables[index]` against its current dependencies.
    pub(crate) fn build(
        context: &Context,
        variables: &[Variable],
        index: usize,
        width: u32,
        height: u32,
    ) -> EngineResult<Self> {
        let variable = variables
            .get(index)
            .ok_or_else(|| EngineError::UnknownVariable(format!("#{index}")))?;
        let crate::kernel::Program::ComputeShader(source) = variable.kernel.program() else {
            return Err(EngineError::IncompatibleKernel {
                kernel: variable.kernel.platform().name(),
                substrate: "device",
            });
        };

        let dependencies = variable
            .dependencies
            .iter()
            .map(|handle| {
                variables
                    .get(handle.index())
                    .ok_or_else(|| EngineError::UnknownVariable(format!("#{}", handle.index())))
            })
            .collect::<EngineResult<Vec<&Variable>>>()?;
        let names: Vec<&str> = dependencies
            .iter()
            .map(|dependency| dependency.name.as_str())
            .collect();
        let uniform_names: Vec<&str> = variable
            .kernel
            .uniforms()
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        let wgsl = assemble(&names, &uniform_names, source);
        tracing::debug!(
            "Compiling kernel for `{}` with inputs {names:?}",
            variable.name
        );

        let what = format!("Compiling the kernel for `{}`", variable.name);
        context.checked(&what, |device, _| -> EngineResult<Self> {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(variable.name.as_str()),
                source: wgpu::ShaderSource::Wgsl(wgsl.into()),
            });

            let mut entries = vec![
                uniform_layout_entry(0),
                uniform_layout_entry(1),
                storage_layout_entry(2, false),
            ];
            for binding in 0..names.len() {
                entries.push(storage_layout_entry(binding_index(3, binding), true));
            }
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(variable.name.as_str()),
                entries: &entries,
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(variable.name.as_str()),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(variable.name.as_str()),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(STEP_ENTRYPOINT),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

            let grid = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("cellfield grid uniform"),
                contents: bytemuck::bytes_of(&GridUniform {
                    width,
                    height,
                    ..GridUniform::default()
                }),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });
            let uniforms = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("cellfield kernel uniforms"),
                contents: bytemuck::cast_slice(&padded_uniforms(&variable.kernel)),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });

            let bind_group = |current: usize| -> EngineResult<wgpu::BindGroup> {
                let next = crate::engine::slot_after(current);
                let output = device_buffer(&variable.slots[next])?;
                let mut bindings = vec![
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: grid.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: uniforms.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: output.as_entire_binding(),
                    },
                ];
                for (binding, dependency) in dependencies.iter().enumerate() {
                    bindings.push(wgpu::BindGroupEntry {
                        binding: binding_index(3, binding),
                        resource: device_buffer(&dependency.slots[current])?.as_entire_binding(),
                    });
                }
                Ok(device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(variable.name.as_str()),
                    layout: &layout,
                    entries: &bindings,
                }))
            };

            Ok(Self {
                bind_groups: [bind_group(0)?, bind_group(1)?],
                pipeline,
                grid,
                uniforms,
            })
        })?
    }

    /// Upload this step's generation and uniform values.
    pub(crate) fn write_uniforms(
        &self,
        queue: &wgpu::Queue,
        kernel: &crate::kernel::Kernel,
        width: u32,
        height: u32,
        generation: u64,
    ) {
        let grid = GridUniform {
            width,
            height,
            // Kernels only see the low 32 bits of the generation.
            generation: u32::try_from(generation & u64::from(u32::MAX)).unwrap_or_default(),
            padding: 0,
        };
        queue.write_buffer(&self.grid, 0, bytemuck::bytes_of(&grid));
        queue.write_buffer(
            &self.uniforms,
            0,
            bytemuck::cast_slice(&padded_uniforms(kernel)),
        );
    }

    /// Record a dispatch over every cell, reading the `current` slot.
    pub(crate) fn dispatch(
        &self,
        pass: &mut wgpu::ComputePass<'_>,
        current: usize,
        width: u32,
        height: u32,
    ) {
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_groups[current], &[]);
        pass.dispatch_workgroups(
            width.div_ceil(WORKGROUP_SIZE),
            height.div_ceil(WORKGROUP_SIZE),
            1,
        );
    }
}

/// Step every variable once, in registration order, in a single submission.
pub(crate) fn step(
    context: &Context,
    variables: &mut [Variable],
    generation: u64,
    width: u32,
    height: u32,
) -> EngineResult<()> {
    context.ensure_alive()?;
    for index in 0..variables.len() {
        if variables[index].pipeline.is_none() {
            let pipeline = StepPipeline::build(context, variables, index, width, height)?;
            variables[index].pipeline = Some(pipeline);
        }
    }

    let current = crate::engine::slot(generation);
    let pipelines = variables
        .iter()
        .map(|variable| {
            let pipeline = variable
                .pipeline
                .as_ref()
                .ok_or_else(|| EngineError::context_lost("A kernel pipeline went missing"))?;
            Ok((pipeline, &variable.kernel))
        })
        .collect::<EngineResult<Vec<_>>>()?;

    context.checked("Dispatching a step", |device, queue| {
        for (pipeline, kernel) in &pipelines {
            pipeline.write_uniforms(queue, kernel, width, height, generation);
        }
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("cellfield step"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("cellfield step"),
                timestamp_writes: None,
            });
            for (pipeline, _) in &pipelines {
                pipeline.dispatch(&mut pass, current, width, height);
            }
        }
        queue.submit([encoder.finish()]);
    })
}

/// Wrap a kernel's source with the declarations it relies on and the entrypoint that runs it.
pub(crate) fn assemble(inputs: &[&str], uniforms: &[&str], source: &str) -> String {
    let mut wgsl = String::new();
    wgsl.push_str(
        "struct Grid {\n    width: u32,\n    height: u32,\n    generation: u32,\n    padding: u32,\n}\n\n",
    );

    wgsl.push_str("struct Uniforms {\n");
    for name in uniforms {
        wgsl.push_str(&format!("    {name}: f32,\n"));
    }
    for padding in 0..uniform_padding(uniforms.len()) {
        wgsl.push_str(&format!("    cellfield_padding_{padding}: f32,\n"));
    }
    wgsl.push_str("}\n\n");

    wgsl.push_str("@group(0) @binding(0) var<uniform> grid: Grid;\n");
    wgsl.push_str("@group(0) @binding(1) var<uniform> uniforms: Uniforms;\n");
    wgsl.push_str(
        "@group(0) @binding(2) var<storage, read_write> cellfield_next: array<vec4<f32>>;\n",
    );
    for (binding, name) in inputs.iter().enumerate() {
        wgsl.push_str(&format!(
            "@group(0) @binding({}) var<storage, read> input_{name}: array<vec4<f32>>;\n",
            binding_index(3, binding)
        ));
    }

    wgsl.push_str(cellfield_kernel::sampling::WRAP_WGSL);
    for name in inputs {
        wgsl.push_str(&format!(
            "\nfn sample_{name}(x: i32, y: i32) -> vec4<f32> {{\n    return input_{name}[wrap_index(x, y)];\n}}\n"
        ));
    }

    wgsl.push('\n');
    wgsl.push_str(source);
    wgsl.push_str(&format!(
        "

@compute @workgroup_size({WORKGROUP_SIZE}, {WORKGROUP_SIZE})
fn {STEP_ENTRYPOINT}(@builtin(global_invocation_id) id: vec3<u32>) {{
    if (id.x >= grid.width || id.y >= grid.height) {{
        return;
    }}
    cellfield_next[id.y * grid.width + id.x] = cell(vec2<i32>(i32(id.x), i32(id.y)));
}}
"
    ));
    wgsl
}

/// How many padding fields bring `count` uniforms up to a whole number of 16 byte rows. An empty
/// struct isn't valid WGSL, so no uniforms still get one row.
const fn uniform_padding(count: usize) -> usize {
    if count == 0 {
        4
    } else {
        (4 - count % 4) % 4
    }
}

/// A kernel's uniform values with the same padding the generated struct has.
fn padded_uniforms(kernel: &crate::kernel::Kernel) -> Vec<f32> {
    let mut values: Vec<f32> = kernel.uniforms().iter().map(|&(_, value)| value).collect();
    values.resize(values.len() + uniform_padding(values.len()), 0.0);
    values
}

/// The GPU buffer behind a grid, which every buffer in a GPU engine has.
fn device_buffer(grid: &crate::grid::GridBuffer) -> EngineResult<&wgpu::Buffer> {
    grid.device_grid()
        .map(DeviceGrid::buffer)
        .ok_or(EngineError::ForeignBuffer)
}

/// The binding number of the `offset`th binding after `first`.
fn binding_index(first: u32, offset: usize) -> u32 {
    first.saturating_add(u32::try_from(offset).unwrap_or(u32::MAX))
}

/// A uniform buffer binding visible to compute shaders.
pub(crate) const fn uniform_layout_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// A storage buffer binding of whole cells visible to compute shaders.
pub(crate) const fn storage_layout_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            // This is the size of a single element in the buffer.
            min_binding_size: NonZeroU64::new(CELL_BYTES),
        },
        count: None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uniforms_fill_whole_rows() {
        assert_eq!(uniform_padding(0), 4);
        assert_eq!(uniform_padding(1), 3);
        assert_eq!(uniform_padding(4), 0);
        assert_eq!(uniform_padding(8), 0);
        assert_eq!(uniform_padding(9), 3);
    }

    #[test]
    fn assembles_declarations_for_every_input() {
        let wgsl = assemble(
            &["energy", "matter"],
            &["mu"],
            "fn cell(position: vec2<i32>) -> vec4<f32> { return vec4<f32>(uniforms.mu); }",
        );
        assert!(wgsl.contains("    mu: f32,"));
        assert!(wgsl.contains("cellfield_padding_2: f32,"));
        assert!(wgsl.contains("@binding(3) var<storage, read> input_energy"));
        assert!(wgsl.contains("@binding(4) var<storage, read> input_matter"));
        assert!(wgsl.contains("fn sample_matter(x: i32, y: i32) -> vec4<f32>"));
        assert!(wgsl.contains("fn wrap_index(x: i32, y: i32) -> u32"));
        assert!(wgsl.contains(&format!("fn {STEP_ENTRYPOINT}(")));
        assert!(STEP_ENTRYPOINT.starts_with(crate::kernel::GENERATED_PREFIX));
    }

    #[test]
    fn assembles_a_kernel_without_uniforms_or_inputs() {
        let wgsl = assemble(&[], &[], "");
        assert!(wgsl.contains("cellfield_padding_3: f32,"));
        assert!(!wgsl.contains("input_"));
    }
}
