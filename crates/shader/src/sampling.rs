//! How kernels address cells that lie outside the grid.
//!
//! Stepping treats the grid as a torus: reading one column past the right edge reads the first
//! column, so patterns can leave one side and reappear on the other. Reduction clamps instead, as
//! averaging across the seam would mix opposite edges into the same statistic.

/// Wrap a coordinate onto `0..size`. `size` must not be zero.
#[must_use]
#[inline]
pub fn wrap(coordinate: i64, size: u32) -> u32 {
    #[expect(
        clippy::as_conversions,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "`rem_euclid` keeps the value within `0..size`"
    )]
    {
        coordinate.rem_euclid(i64::from(size)) as u32
    }
}

/// Clamp a coordinate onto `0..size`. `size` must not be zero.
#[must_use]
#[inline]
pub fn clamp(coordinate: i64, size: u32) -> u32 {
    #[expect(
        clippy::as_conversions,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "The value is clamped to `0..size`"
    )]
    {
        coordinate.clamp(0, i64::from(size) - 1) as u32
    }
}

/// Row-major index of an in-bounds cell.
#[must_use]
#[inline]
pub fn index(x: u32, y: u32, width: u32) -> usize {
    #[expect(
        clippy::as_conversions,
        reason = "Grids are allocated in host memory, so their indices always fit a `usize`"
    )]
    {
        (y as usize) * (width as usize) + (x as usize)
    }
}

/// Index of the cell at `(x, y)` on a toroidal grid.
#[must_use]
#[inline]
pub fn wrapped_index(x: i64, y: i64, width: u32, height: u32) -> usize {
    index(wrap(x, width), wrap(y, height), width)
}

/// Index of the cell at `(x, y)` with coordinates clamped to the grid's edges.
#[must_use]
#[inline]
pub fn clamped_index(x: i64, y: i64, width: u32, height: u32) -> usize {
    index(clamp(x, width), clamp(y, height), width)
}

/// The WGSL twin of [`wrapped_index`]. Expects a `grid` uniform with `width` and `height` fields.
pub const WRAP_WGSL: &str = r"
fn wrap_index(x: i32, y: i32) -> u32 {
    let width = i32(grid.width);
    let height = i32(grid.height);
    let wrapped_x = ((x % width) + width) % width;
    let wrapped_y = ((y % height) + height) % height;
    return u32(wrapped_y * width + wrapped_x);
}
";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wraps_both_directions() {
        assert_eq!(wrap(-1, 4), 3);
        assert_eq!(wrap(4, 4), 0);
        assert_eq!(wrap(-9, 4), 3);
        assert_eq!(wrap(2, 4), 2);
    }

    #[test]
    fn clamps_both_directions() {
        assert_eq!(clamp(-1, 4), 0);
        assert_eq!(clamp(4, 4), 3);
        assert_eq!(clamp(100, 1), 0);
    }

    #[test]
    fn wrap_and_clamp_disagree_on_an_asymmetric_edge() {
        let row = [1.0_f32, 0.0, 0.0, 5.0];
        let wrapped = row[wrapped_index(4, 0, 4, 1)];
        let clamped = row[clamped_index(4, 0, 4, 1)];
        assert!((wrapped - 1.0).abs() < f32::EPSILON);
        assert!((clamped - 5.0).abs() < f32::EPSILON);

        let wrapped = row[wrapped_index(-1, 0, 4, 1)];
        let clamped = row[clamped_index(-1, 0, 4, 1)];
        assert!((wrapped - 5.0).abs() < f32::EPSILON);
        assert!((clamped - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn row_major_indices() {
        assert_eq!(wrapped_index(1, 2, 3, 3), 7);
        assert_eq!(wrapped_index(-1, -1, 3, 3), 8);
    }
}
