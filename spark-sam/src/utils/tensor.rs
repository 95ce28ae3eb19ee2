use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, Axis};

/// Bilinear resize with half-pixel centres (`align_corners = false`), clamped
/// at the borders.
pub fn bilinear_resize(input: ArrayView2<f32>, new_shape: (usize, usize)) -> Array2<f32> {
    let (old_height, old_width) = input.dim();
    let (new_height, new_width) = new_shape;
    let mut output = Array2::<f32>::zeros((new_height, new_width));
    if old_height == 0 || old_width == 0 {
        return output;
    }

    let scale_y = old_height as f32 / new_height as f32;
    let scale_x = old_width as f32 / new_width as f32;

    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let (y0, y1, dy) = source_coords(i, scale_y, old_height);
            for (j, value) in row.iter_mut().enumerate() {
                let (x0, x1, dx) = source_coords(j, scale_x, old_width);

                let p00 = input[[y0, x0]];
                let p01 = input[[y0, x1]];
                let p10 = input[[y1, x0]];
                let p11 = input[[y1, x1]];

                let top = p00 * (1.0 - dx) + p01 * dx;
                let bottom = p10 * (1.0 - dx) + p11 * dx;
                *value = top * (1.0 - dy) + bottom * dy;
            }
        });

    output
}

/// Half-pixel source position of output `index`, clamped to the input: the two
/// neighbouring samples and the weight of the second.
pub(crate) fn source_coords(index: usize, scale: f32, len: usize) -> (usize, usize, f32) {
    let src = ((index as f32 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (src.floor() as usize).min(len - 1);
    let i1 = (i0 + 1).min(len - 1);
    (i0, i1, src - i0 as f32)
}
