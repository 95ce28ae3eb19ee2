use super::state::{ImageEmbedding, InferenceState};
use crate::config::SessionConfig;
use crate::error::{Result, SamError};
use crate::inference::postprocess::{postprocess, MaskResult};
use crate::inference::{image_encoder, mask_decoder, preprocess, prompt_encoder};
use crate::model::SamModel;
use crate::utils::image::ImageU8;
use crate::utils::point::Point;
use log::{debug, info};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait SamImageInference {
    /// Encodes `image` and caches the embedding for the following prompts.
    fn encode_image(&self, image: &ImageU8) -> Result<Duration>;
    /// Segments the object under `point`, given in original image pixels.
    fn compute_masks(&self, point: Point<f32>) -> Result<MaskOutput>;
}

/// Ranked masks of one prompt, best first.
#[derive(Debug, Clone)]
pub struct MaskOutput {
    pub masks: Vec<MaskResult>,
    pub elapsed: Duration,
}

impl MaskOutput {
    pub fn best(&self) -> Option<&MaskResult> {
        self.masks.first()
    }
}

/// A loaded model plus one image's worth of inference state.
///
/// Calls on one session are serialized by its state lock. Sessions created
/// from the same `Arc<SamModel>` are independent of each other.
pub struct SamSession {
    model: Arc<SamModel>,
    state: Mutex<InferenceState>,
    pool: ThreadPool,
    config: SessionConfig,
}

impl SamSession {
    pub fn load(path: impl AsRef<Path>, n_threads: usize) -> Result<Self> {
        Self::load_with_config(path, SessionConfig::with_threads(n_threads))
    }

    pub fn load_with_config(path: impl AsRef<Path>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let model = SamModel::load(path)?;
        Self::from_model(Arc::new(model), config)
    }

    pub fn from_model(model: Arc<SamModel>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.n_threads)
            .thread_name(|i| format!("spark-sam-{i}"))
            .build()?;
        debug!("session created with {} worker threads", config.n_threads);

        Ok(SamSession {
            model,
            state: Mutex::new(InferenceState::new()),
            pool,
            config,
        })
    }

    pub fn model(&self) -> &Arc<SamModel> {
        &self.model
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Checksum of the cached image embedding, if an image has been encoded.
    pub fn embedding_checksum(&self) -> Option<u64> {
        self.state.lock().embedding().map(ImageEmbedding::checksum)
    }

    /// Runs `f` with the session's state locked.
    pub fn with_state<R>(&self, f: impl FnOnce(&InferenceState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Drops the model reference, the cached embedding and the scratch arena.
    pub fn release(self) {
        let state = self.state.into_inner();
        info!(
            "releasing SAM session ({} bytes of scratch)",
            state.scratch().capacity_bytes()
        );
    }
}

impl SamImageInference for SamSession {
    fn encode_image(&self, image: &ImageU8) -> Result<Duration> {
        let start = Instant::now();
        let hparams = &self.model.hparams;
        let input = preprocess::preprocess(image, hparams.n_img_size)?;

        let mut state = self.state.lock();
        let state = &mut *state;
        let data = image_encoder::encode(&self.model, &input, &mut state.scratch, &self.pool);
        state.scratch.clear();
        let data = data.map_err(SamError::Encode)?;

        state.replace_embedding(ImageEmbedding {
            data,
            width: image.width,
            height: image.height,
        });

        let elapsed = start.elapsed();
        info!(
            "encoded {}x{} image in {:?}",
            image.width, image.height, elapsed
        );
        Ok(elapsed)
    }

    fn compute_masks(&self, point: Point<f32>) -> Result<MaskOutput> {
        let start = Instant::now();
        let model = &self.model;

        let mut state = self.state.lock();
        let state = &mut *state;
        let embedding = state.embedding.as_ref().ok_or(SamError::NoImage)?;
        let (width, height) = (embedding.width, embedding.height);

        let decoded = prompt_encoder::encode_point(model, point, width, height).and_then(|prompt| {
            let decoded = mask_decoder::decode(model, &embedding.data, &prompt, &mut state.scratch, &self.pool);
            state.scratch.clear();
            decoded
        });
        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                state.clear_prompt();
                return Err(SamError::Decode(e));
            }
        };
        let low_res_masks = state.low_res_masks.insert(decoded.low_res_masks);
        let iou_predictions = state.iou_predictions.insert(decoded.iou_predictions);

        let candidates = mask_decoder::candidate_indices(
            model.hparams.n_mask_tokens,
            self.config.multimask_output,
        );
        let params = self.config.postprocess_params(&model.hparams);
        let masks = self.pool.install(|| {
            postprocess(
                &params,
                low_res_masks.view(),
                iou_predictions.view(),
                &candidates,
                width,
                height,
            )
        })?;

        let elapsed = start.elapsed();
        info!(
            "computed {} masks for point ({:.1}, {:.1}) in {:?}",
            masks.len(),
            point.x,
            point.y,
            elapsed
        );
        Ok(MaskOutput { masks, elapsed })
    }
}
