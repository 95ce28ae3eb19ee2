use crate::error::LoadError;
use log::warn;

/// Model hyperparameters, read once from the weight file.
///
/// Defaults describe ViT-B SAM.
#[derive(Debug, Clone, PartialEq)]
pub struct Hyperparameters {
    pub n_enc_state: usize,
    pub n_enc_layer: usize,
    pub n_enc_head: usize,
    pub n_enc_out_chans: usize,
    pub n_pt_embd: usize,
    pub n_dec_layer: usize,
    pub n_dec_heads: usize,
    pub n_mask_tokens: usize,
    pub n_img_size: usize,
    pub n_patch_size: usize,
    pub n_window_size: usize,
    /// Storage type the file was converted with. Informational: every tensor
    /// record carries its own dtype, which is what the loader honours.
    pub ftype: i32,

    pub mask_threshold: f32,
    pub iou_threshold: f32,
    pub stability_score_threshold: f32,
    pub stability_score_offset: f32,
    pub eps: f32,
    pub eps_decoder_transformer: f32,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            n_enc_state: 768,
            n_enc_layer: 12,
            n_enc_head: 12,
            n_enc_out_chans: 256,
            n_pt_embd: 4,
            n_dec_layer: 2,
            n_dec_heads: 8,
            n_mask_tokens: 4,
            n_img_size: 1024,
            n_patch_size: 16,
            n_window_size: 14,
            ftype: 1,
            mask_threshold: 0.0,
            // PyTorch uses 0.88 and 0.95
            iou_threshold: 0.85,
            stability_score_threshold: 0.90,
            stability_score_offset: 1.0,
            eps: 1e-6,
            eps_decoder_transformer: 1e-5,
        }
    }
}

impl Hyperparameters {
    pub fn n_enc_head_dim(&self) -> usize {
        self.n_enc_state / self.n_enc_head
    }

    /// Side of the square patch grid produced by the encoder.
    pub fn n_img_embd(&self) -> usize {
        self.n_img_size / self.n_patch_size
    }

    /// Side of the low resolution mask logits (two 2x upscaling stages).
    pub fn n_low_res_mask(&self) -> usize {
        self.n_img_embd() * 4
    }

    pub fn global_attn_indices(&self) -> &'static [usize] {
        global_attn_indices(self.n_enc_state)
    }

    pub fn is_global_attn(&self, layer: usize) -> bool {
        is_global_attention_layer(self.n_enc_state, layer)
    }

    pub(crate) fn validate(&self) -> Result<(), LoadError> {
        let positive = [
            ("n_enc_state", self.n_enc_state),
            ("n_enc_layer", self.n_enc_layer),
            ("n_enc_head", self.n_enc_head),
            ("n_enc_out_chans", self.n_enc_out_chans),
            ("n_dec_layer", self.n_dec_layer),
            ("n_dec_heads", self.n_dec_heads),
            ("n_mask_tokens", self.n_mask_tokens),
            ("n_img_size", self.n_img_size),
            ("n_patch_size", self.n_patch_size),
            ("n_window_size", self.n_window_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(LoadError::InvalidHparams(format!("{name} must be positive")));
        }
        if self.n_pt_embd < 2 {
            return Err(LoadError::InvalidHparams(format!(
                "n_pt_embd = {} leaves no positive point embedding",
                self.n_pt_embd
            )));
        }
        if self.n_enc_state % self.n_enc_head != 0 {
            return Err(LoadError::InvalidHparams(format!(
                "n_enc_state = {} is not divisible by n_enc_head = {}",
                self.n_enc_state, self.n_enc_head
            )));
        }
        if self.n_img_size % self.n_patch_size != 0 {
            return Err(LoadError::InvalidHparams(format!(
                "n_img_size = {} is not divisible by n_patch_size = {}",
                self.n_img_size, self.n_patch_size
            )));
        }
        if self.n_enc_out_chans % 8 != 0 {
            return Err(LoadError::InvalidHparams(format!(
                "n_enc_out_chans = {} is not divisible by 8",
                self.n_enc_out_chans
            )));
        }
        let thresholds = [
            self.mask_threshold,
            self.iou_threshold,
            self.stability_score_threshold,
            self.stability_score_offset,
            self.eps,
            self.eps_decoder_transformer,
        ];
        if thresholds.iter().any(|v| !v.is_finite()) {
            return Err(LoadError::InvalidHparams(
                "thresholds and epsilons must be finite".to_string(),
            ));
        }
        if self.global_attn_indices().is_empty() {
            warn!(
                "unsupported n_enc_state = {}, every encoder layer uses windowed attention",
                self.n_enc_state
            );
        }

        Ok(())
    }
}

/// Encoder layers that attend over the whole patch grid, keyed by encoder width
/// (ViT-B, ViT-L, ViT-H).
pub fn global_attn_indices(n_enc_state: usize) -> &'static [usize] {
    match n_enc_state {
        768 => &[2, 5, 8, 11],
        1024 => &[5, 11, 17, 23],
        1280 => &[7, 15, 23, 31],
        _ => &[],
    }
}

pub fn is_global_attention_layer(n_enc_state: usize, layer: usize) -> bool {
    global_attn_indices(n_enc_state).contains(&layer)
}
