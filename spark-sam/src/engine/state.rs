use crate::graph::ScratchBuffer;
use ndarray::{Array1, Array3};
use std::hash::{DefaultHasher, Hash, Hasher};

/// Encoder output for one image, kept until the next image is encoded.
#[derive(Debug, Clone)]
pub struct ImageEmbedding {
    /// `[G, G, n_enc_out_chans]`.
    pub data: Array3<f32>,
    /// Size of the original image in pixels.
    pub width: usize,
    pub height: usize,
}

impl ImageEmbedding {
    /// Hash of the exact bit pattern of the embedding values.
    pub fn checksum(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.data.shape().hash(&mut hasher);
        self.data.iter().for_each(|v| v.to_bits().hash(&mut hasher));
        hasher.finish()
    }
}

/// Everything one session mutates: the cached embedding, the raw decoder
/// output of the last prompt and the graph scratch arena.
#[derive(Debug, Default)]
pub struct InferenceState {
    pub(crate) embedding: Option<ImageEmbedding>,
    pub(crate) low_res_masks: Option<Array3<f32>>,
    pub(crate) iou_predictions: Option<Array1<f32>>,
    pub(crate) scratch: ScratchBuffer,
}

impl InferenceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn embedding(&self) -> Option<&ImageEmbedding> {
        self.embedding.as_ref()
    }

    pub fn low_res_masks(&self) -> Option<&Array3<f32>> {
        self.low_res_masks.as_ref()
    }

    pub fn iou_predictions(&self) -> Option<&Array1<f32>> {
        self.iou_predictions.as_ref()
    }

    pub fn scratch(&self) -> &ScratchBuffer {
        &self.scratch
    }

    /// Installs a new embedding; the previous prompt's output no longer applies.
    pub(crate) fn replace_embedding(&mut self, embedding: ImageEmbedding) {
        self.embedding = Some(embedding);
        self.clear_prompt();
    }

    pub(crate) fn clear_prompt(&mut self) {
        self.low_res_masks = None;
        self.iou_predictions = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_tracks_every_value() {
        let mut embedding = ImageEmbedding {
            data: Array3::from_shape_fn((2, 2, 3), |(y, x, c)| (y * 6 + x * 3 + c) as f32),
            width: 10,
            height: 10,
        };
        let before = embedding.checksum();
        assert_eq!(before, embedding.clone().checksum());

        embedding.data[[1, 1, 2]] += 0.5;
        assert_ne!(before, embedding.checksum());
    }

    #[test]
    fn new_embedding_drops_prompt_output() {
        let mut state = InferenceState::new();
        state.low_res_masks = Some(Array3::zeros((1, 4, 4)));
        state.iou_predictions = Some(Array1::zeros(1));
        state.replace_embedding(ImageEmbedding {
            data: Array3::zeros((1, 1, 8)),
            width: 1,
            height: 1,
        });
        assert!(state.embedding().is_some());
        assert!(state.low_res_masks().is_none());
        assert!(state.iou_predictions().is_none());
    }
}
