use super::preprocess::resized_extent;
use crate::error::SamError;
use crate::model::hparams::Hyperparameters;
use crate::utils::tensor::bilinear_resize;
use bitvec::prelude::*;
use log::debug;
use ndarray::{s, Array2, ArrayView1, ArrayView2, ArrayView3};
use rayon::prelude::*;
use std::cmp::Ordering;

/// Thresholds and output values applied to raw decoder masks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostprocessParams {
    /// Side of the square model input the low resolution masks cover.
    pub img_size: usize,
    pub mask_threshold: f32,
    pub iou_threshold: f32,
    pub stability_score_threshold: f32,
    pub stability_score_offset: f32,
    pub mask_on_value: u8,
    pub mask_off_value: u8,
}

impl PostprocessParams {
    pub fn from_hparams(hparams: &Hyperparameters) -> Self {
        PostprocessParams {
            img_size: hparams.n_img_size,
            mask_threshold: hparams.mask_threshold,
            iou_threshold: hparams.iou_threshold,
            stability_score_threshold: hparams.stability_score_threshold,
            stability_score_offset: hparams.stability_score_offset,
            mask_on_value: 255,
            mask_off_value: 0,
        }
    }
}

/// One binarized mask at original image resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskResult {
    /// Mask token that produced this mask.
    pub index: usize,
    pub iou_score: f32,
    pub stability_score: f32,
    pub width: usize,
    pub height: usize,
    /// Row-major, `mask_on_value` inside the mask and `mask_off_value` outside.
    pub pixels: Vec<u8>,
    /// Row-major, set inside the mask.
    pub mask: BitVec,
}

impl MaskResult {
    pub fn score(&self) -> f32 {
        self.iou_score + self.stability_score
    }

    pub fn contains(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height && self.mask[y * self.width + x]
    }

    pub fn area(&self) -> usize {
        self.mask.count_ones()
    }
}

/// Share of the pixels above `threshold - offset` that stay above
/// `threshold + offset`. 0.0 when nothing is above the lower threshold.
pub fn stability_score(logits: ArrayView2<f32>, threshold: f32, offset: f32) -> f32 {
    let (intersections, unions) = logits.iter().fold((0usize, 0usize), |(i, u), &v| {
        (i + (v > threshold + offset) as usize, u + (v > threshold - offset) as usize)
    });
    if unions == 0 {
        0.0
    } else {
        intersections as f32 / unions as f32
    }
}

/// Upsamples a low resolution logit map to the padded model input, crops the
/// padding away and resizes to `height x width`.
pub fn upscale_logits(low_res: ArrayView2<f32>, img_size: usize, width: usize, height: usize) -> Array2<f32> {
    let padded = bilinear_resize(low_res, (img_size, img_size));
    let (nx_new, ny_new) = resized_extent(width, height, img_size);
    let cropped = padded.slice(s![..ny_new, ..nx_new]);
    bilinear_resize(cropped, (height, width))
}

struct Candidate {
    index: usize,
    iou_score: f32,
    stability_score: f32,
    logits: Array2<f32>,
}

impl Candidate {
    fn score(&self) -> f32 {
        self.iou_score + self.stability_score
    }

    /// Higher combined score first, then lower token index.
    fn rank(&self, other: &Self) -> Ordering {
        other
            .score()
            .total_cmp(&self.score())
            .then(self.index.cmp(&other.index))
    }
}

/// Turns the selected decoder candidates into ranked binary masks at
/// `width x height`.
///
/// Candidates under the IoU or stability threshold are dropped unless that
/// would drop all of them, in which case the best one is kept.
pub fn postprocess(
    params: &PostprocessParams,
    low_res_masks: ArrayView3<f32>,
    iou_predictions: ArrayView1<f32>,
    candidates: &[usize],
    width: usize,
    height: usize,
) -> Result<Vec<MaskResult>, SamError> {
    let n_tokens = low_res_masks.len_of(ndarray::Axis(0));
    if let Some(&bad) = candidates.iter().find(|&&i| i >= n_tokens || i >= iou_predictions.len()) {
        return Err(SamError::Decode(anyhow::anyhow!(
            "candidate {bad} out of range for {n_tokens} masks"
        )));
    }

    let mut scored = candidates
        .par_iter()
        .map(|&index| {
            let logits = upscale_logits(low_res_masks.slice(s![index, .., ..]), params.img_size, width, height);
            let stability_score = stability_score(
                logits.view(),
                params.mask_threshold,
                params.stability_score_offset,
            );
            Candidate {
                index,
                iou_score: iou_predictions[index],
                stability_score,
                logits,
            }
        })
        .filter(|c| c.iou_score.is_finite() && c.stability_score.is_finite())
        .collect::<Vec<_>>();
    if scored.is_empty() {
        return Err(SamError::EmptyResult);
    }
    scored.sort_by(Candidate::rank);

    let passes = |c: &Candidate| {
        c.iou_score >= params.iou_threshold && c.stability_score >= params.stability_score_threshold
    };
    if scored.iter().any(passes) {
        scored.retain(passes);
    } else {
        debug!(
            "no mask passes iou >= {} and stability >= {}, keeping the best of {}",
            params.iou_threshold,
            params.stability_score_threshold,
            scored.len()
        );
        scored.truncate(1);
    }

    Ok(scored
        .into_par_iter()
        .map(|c| binarize(params, c, width, height))
        .collect())
}

fn binarize(params: &PostprocessParams, candidate: Candidate, width: usize, height: usize) -> MaskResult {
    let mask = candidate
        .logits
        .iter()
        .map(|&v| v > params.mask_threshold)
        .collect::<BitVec>();
    let pixels = mask
        .iter()
        .map(|bit| if *bit { params.mask_on_value } else { params.mask_off_value })
        .collect();

    MaskResult {
        index: candidate.index,
        iou_score: candidate.iou_score,
        stability_score: candidate.stability_score,
        width,
        height,
        pixels,
        mask,
    }
}
