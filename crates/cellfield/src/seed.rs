//! Initial fields: soft blobs of energy scattered over an empty grid.

use cellfield::grid::cell_count;
use cellfield::CHANNELS;
use cellfield_kernel::sampling::wrapped_index;
use rand::prelude::*;

/// The fraction of a blob's energy laid down as matter.
const MATTER_TRACE: f32 = 0.1;

/// Scatter `count` blobs over a `width × height` field, in the layout `GridBuffer::upload()`
/// takes. Blobs wrap around the edges, just as the field does.
pub fn blobs(width: u32, height: u32, rng: &mut StdRng, count: u32) -> Vec<f32> {
    let mut cells = vec![0.0_f32; cell_count(width, height) * CHANNELS];
    let largest = (width.min(height) / 8).max(3);

    for _ in 0..count {
        let centre_x = i64::from(rng.random_range(0..width));
        let centre_y = i64::from(rng.random_range(0..height));
        let radius = rng.random_range(2..=largest);
        let amplitude: f32 = rng.random_range(0.5..1.0);

        let reach = i64::from(radius);
        #[expect(
            clippy::as_conversions,
            clippy::cast_precision_loss,
            reason = "Radii are small enough to be exact in an `f32`"
        )]
        let scale = radius as f32;
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                #[expect(
                    clippy::as_conversions,
                    clippy::cast_precision_loss,
                    reason = "Offsets are small enough to be exact in an `f32`"
                )]
                let distance = ((dx * dx + dy * dy) as f32).sqrt() / scale;
                if distance >= 1.0 {
                    continue;
                }

                let falloff = distance.mul_add(-distance, 1.0);
                let index = wrapped_index(centre_x + dx, centre_y + dy, width, height) * CHANNELS;
                if let Some(cell) = cells.get_mut(index..index + 2) {
                    cell[0] = amplitude.mul_add(falloff, cell[0]).min(1.0);
                    cell[1] = (cell[0] * MATTER_TRACE).min(1.0);
                }
            }
        }
    }

    cells
}

#[cfg(test)]
mod test {
    use super::*;

    fn seeded(seed: u64) -> Vec<f32> {
        blobs(32, 32, &mut StdRng::seed_from_u64(seed), 6)
    }

    #[test]
    fn same_seed_same_field() {
        assert_eq!(seeded(3), seeded(3));
        assert_ne!(seeded(3), seeded(4));
    }

    #[test]
    fn fields_are_in_range() {
        let cells = seeded(0);
        assert_eq!(cells.len(), 32 * 32 * CHANNELS);
        assert!(cells.iter().all(|value| (0.0..=1.0).contains(value)));
        assert!(cells.chunks_exact(CHANNELS).any(|cell| cell[0] > 0.0));
        assert!(cells
            .chunks_exact(CHANNELS)
            .all(|cell| cell[2] == 0.0 && cell[3] == 0.0));
    }

    #[test]
    fn no_blobs_no_energy() {
        let cells = blobs(8, 8, &mut StdRng::seed_from_u64(0), 0);
        assert!(cells.iter().all(|&value| value == 0.0));
    }

    #[test]
    fn fields_fit_the_engine_buffers() {
        let engine =
            cellfield::Engine::new(5, 3, cellfield::ExecutionContext::Host).unwrap();
        let mut buffer = engine.create_buffer().unwrap();
        let cells = blobs(5, 3, &mut StdRng::seed_from_u64(2), 4);
        assert_eq!(cells.len(), buffer.len());
        buffer.upload(&cells).unwrap();
    }

    #[test]
    fn tiny_fields_still_seed() {
        let cells = blobs(1, 1, &mut StdRng::seed_from_u64(1), 2);
        assert_eq!(cells.len(), CHANNELS);
        assert!(cells[0] > 0.0);
    }
}
