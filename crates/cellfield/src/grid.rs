//! `GridBuffer`: one generation of field state.
//!
//! A fixed `width × height` array of cells, each holding 4 independent `f32` channels. By
//! convention channel 0 is energy and channel 1 is matter, channels 2 and 3 are free. Dimensions
//! never change: a different size means a different buffer.

use std::sync::Arc;

use glam::Vec4;

use crate::error::{EngineError, EngineResult};

/// The number of channels in every cell.
pub const CHANNELS: usize = 4;

/// A 2-D array of four-channel cells, resident wherever its engine computes.
#[derive(Debug)]
pub struct GridBuffer {
    /// Cells per row.
    width: u32,
    /// Rows.
    height: u32,
    /// The cells themselves.
    storage: Storage,
}

/// Where a buffer's cells live.
#[derive(Debug)]
pub(crate) enum Storage {
    /// Host memory, for the CPU substrate.
    Host(Vec<Vec4>),
    /// A storage buffer on the GPU.
    Device(crate::gpu::DeviceGrid),
}

impl GridBuffer {
    /// A zeroed buffer in host memory.
    pub(crate) fn host(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            storage: Storage::Host(vec![Vec4::ZERO; cell_count(width, height)]),
        }
    }

    /// A zeroed buffer on the GPU.
    pub(crate) fn device(
        context: &Arc<crate::gpu::Context>,
        width: u32,
        height: u32,
        label: &str,
    ) -> Self {
        Self {
            width,
            height,
            storage: Storage::Device(crate::gpu::DeviceGrid::new(
                context,
                cell_count(width, height),
                label,
            )),
        }
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

    /// The number of cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        cell_count(self.width, self.height)
    }

    /// The number of `f32` values the buffer holds, ie; `width × height × 4`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cell_count() * CHANNELS
    }

    /// Buffers always have at least one cell.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Whether the cells live on the GPU.
    #[must_use]
    pub const fn is_device_resident(&self) -> bool {
        matches!(self.storage, Storage::Device(_))
    }

    /// Replace the entire contents with row-major, channel-interleaved `data`.
    ///
    /// # Errors
    /// `ShapeMismatch` if `data` isn't exactly `width × height × 4` long, or
    /// `ExecutionContextLost` if the device has gone.
    pub fn upload(&mut self, data: &[f32]) -> EngineResult<()> {
        if data.len() != self.len() {
            return Err(EngineError::ShapeMismatch {
                expected: self.len(),
                actual: data.len(),
            });
        }

        match &mut self.storage {
            Storage::Host(cells) => {
                for (cell, values) in cells.iter_mut().zip(data.chunks_exact(CHANNELS)) {
                    *cell = Vec4::from_slice(values);
                }
                Ok(())
            }
            Storage::Device(grid) => grid.write(data),
        }
    }

    /// Copy the entire contents to host memory, in the same layout `upload` takes.
    ///
    /// For a GPU buffer this blocks until the device has finished all prior work. It's meant for
    /// seeding checks and snapshots, not for every frame.
    ///
    /// # Errors
    /// `ExecutionContextLost` if the device has gone.
    pub fn read(&self) -> EngineResult<Vec<f32>> {
        match &self.storage {
            Storage::Host(cells) => Ok(bytemuck::cast_slice(cells).to_vec()),
            Storage::Device(grid) => grid.read(),
        }
    }

    /// Copy a single channel to host memory. A channel past the last one is empty.
    ///
    /// # Errors
    /// `ExecutionContextLost` if the device has gone.
    pub fn channel(&self, channel: usize) -> EngineResult<Vec<f32>> {
        Ok(self
            .read()?
            .chunks_exact(CHANNELS)
            .filter_map(|cell| cell.get(channel).copied())
            .collect())
    }

    /// Overwrite this buffer with the contents of `other`.
    pub(crate) fn copy_from(&mut self, other: &Self) -> EngineResult<()> {
        if self.width != other.width || self.height != other.height {
            return Err(EngineError::ShapeMismatch {
                expected: self.len(),
                actual: other.len(),
            });
        }

        match (&mut self.storage, &other.storage) {
            (Storage::Host(cells), Storage::Host(source)) => {
                cells.copy_from_slice(source);
                Ok(())
            }
            (Storage::Device(grid), Storage::Device(source)) => grid.copy_from(source),
            _ => Err(EngineError::ForeignBuffer),
        }
    }

    /// The host cells, if that's where they live.
    pub(crate) fn host_cells(&self) -> Option<&[Vec4]> {
        match &self.storage {
            Storage::Host(cells) => Some(cells),
            Storage::Device(_) => None,
        }
    }

    /// Borrow the host cells out of the buffer, leaving it empty until they're restored.
    pub(crate) fn take_host(&mut self) -> Option<Vec<Vec4>> {
        match &mut self.storage {
            Storage::Host(cells) => Some(std::mem::take(cells)),
            Storage::Device(_) => None,
        }
    }

    /// Put back cells taken with `take_host`.
    pub(crate) fn restore_host(&mut self, cells: Vec<Vec4>) {
        self.storage = Storage::Host(cells);
    }

    /// The GPU buffer, if that's where the cells live.
    pub(crate) const fn device_grid(&self) -> Option<&crate::gpu::DeviceGrid> {
        match &self.storage {
            Storage::Device(grid) => Some(grid),
            Storage::Host(_) => None,
        }
    }
}

/// The number of cells in a `width × height` grid.
#[must_use]
pub const fn cell_count(width: u32, height: u32) -> usize {
    to_index(width) * to_index(height)
}

/// A dimension or coordinate as an index.
#[expect(
    clippy::as_conversions,
    reason = "`usize` is at least 32 bits on every platform wgpu supports"
)]
pub(crate) const fn to_index(value: u32) -> usize {
    value as usize
}

/// An index along one dimension as a coordinate. Grid dimensions are `u32`, so it always fits.
pub(crate) fn to_coordinate(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_neutral() {
        let buffer = GridBuffer::host(3, 2);
        assert_eq!(buffer.len(), 24);
        assert!(buffer.read().unwrap().iter().all(|&value| value == 0.0));
    }

    #[test]
    fn upload_replaces_everything() {
        let mut buffer = GridBuffer::host(2, 1);
        buffer
            .upload(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])
            .unwrap();
        assert_eq!(
            buffer.read().unwrap(),
            [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
        );
        assert_eq!(buffer.channel(1).unwrap(), [2.0, 6.0]);
        assert!(buffer.channel(4).unwrap().is_empty());
    }

    #[test]
    fn upload_rejects_the_wrong_shape() {
        let mut buffer = GridBuffer::host(2, 2);
        let result = buffer.upload(&[0.0; 15]);
        assert!(matches!(
            result,
            Err(EngineError::ShapeMismatch {
                expected: 16,
                actual: 15
            })
        ));
        assert!(buffer.read().unwrap().iter().all(|&value| value == 0.0));
    }

    #[test]
    fn copies_only_between_equal_shapes() {
        let mut source = GridBuffer::host(2, 2);
        source.upload(&[0.5; 16]).unwrap();
        let mut same = GridBuffer::host(2, 2);
        same.copy_from(&source).unwrap();
        assert_eq!(same.read().unwrap(), source.read().unwrap());

        let mut other = GridBuffer::host(4, 1);
        assert!(matches!(
            other.copy_from(&source),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }
}
