//! Snapshots of a field channel as PNG images.
use color_eyre::{eyre::ContextCompat as _, Result};

/// Save one channel of a field as a grayscale heatmap. Values are clamped to `0.0..=1.0`, so
/// snapshots of different runs share a scale.
pub fn save(data: &[f32], width: u32, height: u32, path: &std::path::Path) -> Result<()> {
    let pixels: Vec<u8> = data
        .iter()
        .map(|&value| {
            let scaled = (value.clamp(0.0, 1.0) * 255.0).round();
            #[expect(
                clippy::as_conversions,
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                reason = "We've already guaranteed all the values are within the correct range"
            )]
            {
                scaled as u8
            }
        })
        .collect();

    let count = pixels.len();
    let png: image::GrayImage = image::GrayImage::from_vec(width, height, pixels).context(
        format!("Dimensions ({width}x{height}) don't match the amount of data ({count})."),
    )?;

    png.save(path)?;
    tracing::info!("Saved snapshot to {}", path.display());

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn saves_a_clamped_heatmap() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("field.png");
        save(&[-1.0, 0.0, 0.5, 2.0], 2, 2, &path).unwrap();

        let image = image::open(&path).unwrap().into_luma8();
        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(image.into_raw(), [0, 0, 128, 255]);
    }

    #[test]
    fn refuses_mismatched_dimensions() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("field.png");
        assert!(save(&[0.0; 3], 2, 2, &path).is_err());
    }
}
