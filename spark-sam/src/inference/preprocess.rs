use crate::error::PreprocessError;
use crate::utils::image::{ImageF32, ImageU8};
use crate::utils::tensor::source_coords;
use rayon::prelude::*;

/// Per-channel RGB statistics of the training data, on the 0..255 scale.
pub const PIXEL_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
pub const PIXEL_STD: [f32; 3] = [58.395, 57.12, 57.375];

/// Extent of a `width x height` image once its longer side is scaled to `target`.
pub fn resized_extent(width: usize, height: usize, target: usize) -> (usize, usize) {
    let scale = target as f32 / width.max(height) as f32;
    let side = |n: usize| ((n as f32 * scale + 0.5) as usize).clamp(1, target);
    (side(width), side(height))
}

/// Scales the longer side to `target`, zero-pads to a `target x target`
/// square and normalizes each channel.
///
/// The resized image occupies the top-left corner; the padding stays 0 after
/// normalization.
pub fn preprocess(image: &ImageU8, target: usize) -> Result<ImageF32, PreprocessError> {
    let (nx, ny) = (image.width, image.height);
    if nx == 0 || ny == 0 || target == 0 {
        return Err(PreprocessError::EmptyImage {
            width: nx,
            height: ny,
        });
    }
    if image.data.len() != nx * ny * 3 {
        return Err(PreprocessError::ChannelMismatch {
            width: nx,
            height: ny,
            expected: nx * ny * 3,
            actual: image.data.len(),
        });
    }

    let (nx_new, ny_new) = resized_extent(nx, ny, target);
    let scale = nx.max(ny) as f32 / target as f32;
    let src = &image.data;

    let mut result = ImageF32::zeros(target, target);
    result
        .data_mut()
        .par_chunks_mut(target * 3)
        .take(ny_new)
        .enumerate()
        .for_each(|(y, row)| {
            let (y0, y1, dy) = source_coords(y, scale, ny);

            for x in 0..nx_new {
                let (x0, x1, dx) = source_coords(x, scale, nx);

                for c in 0..3 {
                    let at = |px: usize, py: usize| src[3 * (py * nx + px) + c] as f32;
                    let v = at(x0, y0) * (1.0 - dx) * (1.0 - dy)
                        + at(x1, y0) * dx * (1.0 - dy)
                        + at(x0, y1) * (1.0 - dx) * dy
                        + at(x1, y1) * dx * dy;
                    let v = v.round().clamp(0.0, 255.0);
                    row[3 * x + c] = (v - PIXEL_MEAN[c]) / PIXEL_STD[c];
                }
            }
        });

    Ok(result)
}
