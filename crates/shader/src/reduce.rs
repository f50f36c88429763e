//! The 2×2 block mean that every reduction pass runs.
//!
//! Each pass halves both grid dimensions, rounding up, until a single cell remains. Only channel
//! 0 is read. Pass outputs keep the four-channel cell layout so that every pass can read its
//! predecessor the same way, but only channel 0 of an output is ever written to.

/// Output size of a pass along one dimension: `ceil(size / 2)`, never below 1.
///
/// An odd input's last row or column gets a block of its own, which the clamp in [`block_mean`]
/// fills by duplicating that edge.
#[must_use]
#[inline]
pub const fn pass_size(size: u32) -> u32 {
    if size > 1 {
        size.div_ceil(2)
    } else {
        1
    }
}

/// The output dimensions of every pass needed to bring a `width`×`height` grid down to 1×1.
/// Empty for a grid that is already 1×1.
#[must_use]
pub fn pass_sizes(width: u32, height: u32) -> Vec<(u32, u32)> {
    let mut sizes = Vec::new();
    let (mut current_width, mut current_height) = (width, height);
    while current_width > 1 || current_height > 1 {
        current_width = pass_size(current_width);
        current_height = pass_size(current_height);
        sizes.push((current_width, current_height));
    }
    sizes
}

/// The mean of the 2×2 block that feeds output cell `(x, y)`.
///
/// `fetch` reads channel 0 of the input cell at a row-major index. The block spans
/// `(2x, 2y)..=(2x + 1, 2y + 1)` and is clamped to the input's edges.
#[must_use]
#[inline]
pub fn block_mean(fetch: impl Fn(usize) -> f32, x: u32, y: u32, width: u32, height: u32) -> f32 {
    let left = i64::from(x) * 2;
    let top = i64::from(y) * 2;
    let at = |dx: i64, dy: i64| {
        fetch(crate::sampling::clamped_index(
            left + dx,
            top + dy,
            width,
            height,
        ))
    };
    // Summed in the same order as the WGSL below.
    let sum = at(0, 0) + at(1, 0) + at(0, 1) + at(1, 1);
    sum * 0.25
}

/// The WGSL twin of [`block_mean`], dispatched once per output cell of a pass.
pub const REDUCE_WGSL: &str = r"
struct Pass {
    input_width: u32,
    input_height: u32,
    output_width: u32,
    output_height: u32,
}

@group(0) @binding(0) var<uniform> pass_info: Pass;
@group(0) @binding(1) var<storage, read> source: array<vec4<f32>>;
@group(0) @binding(2) var<storage, read_write> destination: array<vec4<f32>>;

fn clamped(x: u32, y: u32) -> f32 {
    let clamped_x = min(x, pass_info.input_width - 1u);
    let clamped_y = min(y, pass_info.input_height - 1u);
    return source[clamped_y * pass_info.input_width + clamped_x].x;
}

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= pass_info.output_width || id.y >= pass_info.output_height) {
        return;
    }
    let left = id.x * 2u;
    let top = id.y * 2u;
    let sum = clamped(left, top) + clamped(left + 1u, top) + clamped(left, top + 1u) + clamped(left + 1u, top + 1u);
    destination[id.y * pass_info.output_width + id.x] = vec4<f32>(sum * 0.25, 0.0, 0.0, 0.0);
}
";

#[expect(clippy::float_cmp, reason = "They're just tests")]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn halves_to_one() {
        assert_eq!(pass_sizes(4, 4), [(2, 2), (1, 1)]);
        assert_eq!(pass_sizes(8, 2), [(4, 1), (2, 1), (1, 1)]);
        assert_eq!(pass_sizes(2, 1), [(1, 1)]);
        assert!(pass_sizes(1, 1).is_empty());
    }

    #[test]
    fn odd_sizes_round_up() {
        assert_eq!(pass_size(3), 2);
        assert_eq!(pass_size(5), 3);
        assert_eq!(pass_size(1), 1);
        assert_eq!(pass_sizes(3, 3), [(2, 2), (1, 1)]);
        assert_eq!(pass_sizes(5, 1), [(3, 1), (2, 1), (1, 1)]);
    }

    #[test]
    fn checkerboard_block_is_half() {
        #[rustfmt::skip]
        let cells = [
            1.0, 0.0,
            0.0, 1.0,
        ];
        assert_eq!(block_mean(|index| cells[index], 0, 0, 2, 2), 0.5);
    }

    #[test]
    fn single_row_duplicates_the_edge() {
        // The row below a 1-high input is clamped back onto the only row there is.
        let cells = [2.0, 4.0];
        assert_eq!(block_mean(|index| cells[index], 0, 0, 2, 1), 3.0);
    }

    #[test]
    fn clamped_edge_differs_from_wrapped_edge() {
        // A 3-wide row: the block for output x = 1 starts on the last column.
        let cells = [8.0, 0.0, 1.0];
        let clamped = block_mean(|index| cells[index], 1, 0, 3, 1);
        assert_eq!(clamped, 1.0);
        let wrapped = {
            let at = |x: i64| cells[crate::sampling::wrapped_index(x, 0, 3, 1)];
            (at(2) + at(3) + at(2) + at(3)) * 0.25
        };
        assert_eq!(wrapped, 4.5);
    }
}
