use super::preprocess::resized_extent;
use crate::model::SamModel;
use crate::utils::point::Point;
use anyhow::{ensure, Result};
use ndarray::parallel::prelude::*;
use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayViewMut1, Axis};
use std::f32::consts::PI;

/// Sparse point tokens plus the dense "no mask" embedding.
#[derive(Debug, Clone)]
pub struct PromptEmbedding {
    /// `[2, C]`: the clicked point and the padding point.
    pub sparse: Array2<f32>,
    /// `[C]`, added to every image embedding cell.
    pub dense: Array1<f32>,
}

/// Maps a point in original image pixels to the model's input frame.
///
/// Points outside the image are clamped onto its border first.
pub fn transform_point(point: Point<f32>, width: usize, height: usize, img_size: usize) -> Point<f32> {
    let point = point.clamp_to(width as f32, height as f32);
    let (nx_new, ny_new) = resized_extent(width, height, img_size);
    Point::new(
        point.x * (nx_new as f32 / width as f32) + 0.5,
        point.y * (ny_new as f32 / height as f32) + 0.5,
    )
}

/// Random Fourier features of a point in `[0, 1]^2`.
fn fourier_features(gaussian: ArrayView2<f32>, x: f32, y: f32, mut out: ArrayViewMut1<f32>) {
    let half = gaussian.ncols();
    let (cx, cy) = (2.0 * x - 1.0, 2.0 * y - 1.0);
    for j in 0..half {
        let v = 2.0 * PI * (cx * gaussian[[0, j]] + cy * gaussian[[1, j]]);
        out[j] = v.sin();
        out[half + j] = v.cos();
    }
}

/// Positional encoding of every cell centre of a `grid x grid` embedding,
/// `[grid, grid, 2 * gaussian.ncols()]`.
pub fn dense_positional_encoding(gaussian: ArrayView2<f32>, grid: usize) -> Array3<f32> {
    let mut pe = Array3::<f32>::zeros((grid, grid, 2 * gaussian.ncols()));
    pe.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let y = (i as f32 + 0.5) / grid as f32;
            for j in 0..grid {
                let x = (j as f32 + 0.5) / grid as f32;
                fourier_features(gaussian, x, y, row.slice_mut(s![j, ..]));
            }
        });
    pe
}

/// Embeds one positive click at `point` (original image pixels).
pub fn encode_point(model: &SamModel, point: Point<f32>, width: usize, height: usize) -> Result<PromptEmbedding> {
    ensure!(point.is_finite(), "prompt point ({}, {}) is not finite", point.x, point.y);
    ensure!(width > 0 && height > 0, "image size {width}x{height} is degenerate");

    let hparams = &model.hparams;
    let enc = &model.enc_prompt;
    let img_size = hparams.n_img_size as f32;
    let n_out = hparams.n_enc_out_chans;

    let gaussian = model.weight(enc.pe).view().into_dimensionality()?;
    let p = transform_point(point, width, height, hparams.n_img_size);

    let mut sparse = Array2::<f32>::zeros((2, n_out));
    fourier_features(gaussian, p.x / img_size, p.y / img_size, sparse.row_mut(0));

    // label 1: foreground point
    let positive = model.weight(enc.pt_embd[1]).view().into_shape_with_order(n_out)?;
    sparse.row_mut(0).zip_mut_with(&positive, |v, e| *v += e);
    // label -1: padding point, its positional encoding is discarded
    let not_a_point = model.weight(enc.not_a_pt_embd_w).view().into_shape_with_order(n_out)?;
    sparse.row_mut(1).assign(&not_a_point);

    let dense = model
        .weight(enc.no_mask_embd_w)
        .view()
        .into_shape_with_order(n_out)?
        .to_owned();

    Ok(PromptEmbedding { sparse, dense })
}
