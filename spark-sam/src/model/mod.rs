pub mod hparams;
pub mod layers;
pub mod loader;
pub mod weights;

use crate::error::LoadError;
use crate::inference::prompt_encoder::dense_positional_encoding;
use hparams::Hyperparameters;
use layers::{ImageEncoderWeights, MaskDecoderWeights, PromptEncoderWeights};
use log::{debug, info};
use ndarray::{Array3, ArrayD, Ix2};
use std::path::Path;
use std::time::Instant;
use weights::{WeightId, WeightStore};

/// Loaded SAM model: hyperparameters, the flat weight store and the typed
/// records that bind layer slots to stored tensors.
#[derive(Debug)]
pub struct SamModel {
    pub hparams: Hyperparameters,
    pub weights: WeightStore,

    pub enc_img: ImageEncoderWeights,
    pub enc_prompt: PromptEncoderWeights,
    pub dec: MaskDecoderWeights,

    /// Dense positional encoding of the embedding grid, `[G, G, n_enc_out_chans]`.
    image_pe: Array3<f32>,
}

impl SamModel {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let start = Instant::now();
        let (hparams, weights) = loader::read_model_file(path.as_ref())?;
        let model = Self::from_parts(hparams, weights)?;

        info!(
            "loaded SAM model from {:?}: {} tensors, {:.1} MB, {:?}",
            path.as_ref(),
            model.weights.len(),
            model.weights.n_elements() as f64 * 4.0 / (1024.0 * 1024.0),
            start.elapsed()
        );
        Ok(model)
    }

    /// Binds every architecture tensor; unknown tensors in the store are ignored.
    pub fn from_parts(hparams: Hyperparameters, weights: WeightStore) -> Result<Self, LoadError> {
        hparams.validate()?;
        debug!("hparams: {hparams:?}");

        let enc_img = ImageEncoderWeights::bind(&weights, &hparams)?;
        let enc_prompt = PromptEncoderWeights::bind(&weights, &hparams)?;
        let dec = MaskDecoderWeights::bind(&weights, &hparams)?;

        let gaussian = weights
            .get(enc_prompt.pe)
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| LoadError::ShapeMismatch {
                name: weights.name(enc_prompt.pe).to_string(),
                expected: vec![2, hparams.n_enc_out_chans / 2],
                actual: weights.get(enc_prompt.pe).shape().to_vec(),
            })?;
        let image_pe = dense_positional_encoding(gaussian, hparams.n_img_embd());

        Ok(SamModel {
            hparams,
            weights,
            enc_img,
            enc_prompt,
            dec,
            image_pe,
        })
    }

    pub fn weight(&self, id: WeightId) -> &ArrayD<f32> {
        self.weights.get(id)
    }

    pub fn image_pe(&self) -> &Array3<f32> {
        &self.image_pe
    }
}
