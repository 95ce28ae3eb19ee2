use super::hparams::Hyperparameters;
use super::weights::{WeightId, WeightStore, ANY};
use crate::error::LoadError;

#[derive(Debug, Clone)]
pub struct EncoderLayer {
    pub norm1_w: WeightId,
    pub norm1_b: WeightId,

    pub rel_pos_w: WeightId,
    pub rel_pos_h: WeightId,

    pub qkv_w: WeightId,
    pub qkv_b: WeightId,

    pub proj_w: WeightId,
    pub proj_b: WeightId,

    pub norm2_w: WeightId,
    pub norm2_b: WeightId,

    pub mlp_lin1_w: WeightId,
    pub mlp_lin1_b: WeightId,

    pub mlp_lin2_w: WeightId,
    pub mlp_lin2_b: WeightId,
}

#[derive(Debug, Clone)]
pub struct ImageEncoderWeights {
    pub pe: WeightId,

    pub proj_w: WeightId,
    pub proj_b: WeightId,

    pub neck_conv_0: WeightId,
    pub neck_norm_0_w: WeightId,
    pub neck_norm_0_b: WeightId,
    pub neck_conv_1: WeightId,
    pub neck_norm_1_w: WeightId,
    pub neck_norm_1_b: WeightId,

    pub layers: Vec<EncoderLayer>,
}

#[derive(Debug, Clone)]
pub struct PromptEncoderWeights {
    /// Random Fourier feature matrix, `[2, n_enc_out_chans / 2]`.
    pub pe: WeightId,

    pub not_a_pt_embd_w: WeightId,
    pub pt_embd: Vec<WeightId>,

    pub no_mask_embd_w: WeightId,
}

#[derive(Debug, Clone)]
pub struct AttentionWeights {
    pub q_w: WeightId,
    pub q_b: WeightId,

    pub k_w: WeightId,
    pub k_b: WeightId,

    pub v_w: WeightId,
    pub v_b: WeightId,

    pub out_w: WeightId,
    pub out_b: WeightId,
}

#[derive(Debug, Clone)]
pub struct TwoWayLayer {
    pub self_attn: AttentionWeights,

    pub norm1_w: WeightId,
    pub norm1_b: WeightId,

    pub cross_attn_token_to_img: AttentionWeights,

    pub norm2_w: WeightId,
    pub norm2_b: WeightId,

    pub mlp_lin1_w: WeightId,
    pub mlp_lin1_b: WeightId,

    pub mlp_lin2_w: WeightId,
    pub mlp_lin2_b: WeightId,

    pub norm3_w: WeightId,
    pub norm3_b: WeightId,

    pub norm4_w: WeightId,
    pub norm4_b: WeightId,

    pub cross_attn_img_to_token: AttentionWeights,
}

/// Fully connected stack with ReLU between layers.
#[derive(Debug, Clone)]
pub struct MlpWeights {
    pub layers: Vec<(WeightId, WeightId)>,
}

#[derive(Debug, Clone)]
pub struct MaskDecoderWeights {
    pub transformer_layers: Vec<TwoWayLayer>,

    pub final_attn_token_to_img: AttentionWeights,

    pub norm_final_w: WeightId,
    pub norm_final_b: WeightId,

    pub output_upscaling_0_w: WeightId,
    pub output_upscaling_0_b: WeightId,

    pub output_upscaling_1_w: WeightId,
    pub output_upscaling_1_b: WeightId,

    pub output_upscaling_3_w: WeightId,
    pub output_upscaling_3_b: WeightId,

    pub output_hypernet_mlps: Vec<MlpWeights>,

    pub iou_prediction_head: MlpWeights,

    pub iou_token_w: WeightId,
    pub mask_tokens_w: WeightId,
}

impl ImageEncoderWeights {
    pub(crate) fn bind(store: &WeightStore, hparams: &Hyperparameters) -> Result<Self, LoadError> {
        let n_enc_state = hparams.n_enc_state;
        let n_out = hparams.n_enc_out_chans;
        let n_img_embd = hparams.n_img_embd();
        let n_patch = hparams.n_patch_size;
        let head_dim = hparams.n_enc_head_dim();

        let layers = (0..hparams.n_enc_layer)
            .map(|i| {
                let prefix = format!("image_encoder.blocks.{i}");
                let attn_size = if hparams.is_global_attn(i) {
                    n_img_embd
                } else {
                    hparams.n_window_size
                };
                let n_rel = 2 * attn_size - 1;

                Ok(EncoderLayer {
                    norm1_w: store.bind(&format!("{prefix}.norm1.weight"), &[n_enc_state])?,
                    norm1_b: store.bind(&format!("{prefix}.norm1.bias"), &[n_enc_state])?,
                    rel_pos_w: store.bind(&format!("{prefix}.attn.rel_pos_w"), &[n_rel, head_dim])?,
                    rel_pos_h: store.bind(&format!("{prefix}.attn.rel_pos_h"), &[n_rel, head_dim])?,
                    qkv_w: store.bind(
                        &format!("{prefix}.attn.qkv.weight"),
                        &[3 * n_enc_state, n_enc_state],
                    )?,
                    qkv_b: store.bind(&format!("{prefix}.attn.qkv.bias"), &[3 * n_enc_state])?,
                    proj_w: store.bind(
                        &format!("{prefix}.attn.proj.weight"),
                        &[n_enc_state, n_enc_state],
                    )?,
                    proj_b: store.bind(&format!("{prefix}.attn.proj.bias"), &[n_enc_state])?,
                    norm2_w: store.bind(&format!("{prefix}.norm2.weight"), &[n_enc_state])?,
                    norm2_b: store.bind(&format!("{prefix}.norm2.bias"), &[n_enc_state])?,
                    mlp_lin1_w: store.bind(&format!("{prefix}.mlp.lin1.weight"), &[ANY, n_enc_state])?,
                    mlp_lin1_b: store.bind(&format!("{prefix}.mlp.lin1.bias"), &[ANY])?,
                    mlp_lin2_w: store.bind(&format!("{prefix}.mlp.lin2.weight"), &[n_enc_state, ANY])?,
                    mlp_lin2_b: store.bind(&format!("{prefix}.mlp.lin2.bias"), &[n_enc_state])?,
                })
            })
            .collect::<Result<Vec<_>, LoadError>>()?;

        Ok(ImageEncoderWeights {
            pe: store.bind(
                "image_encoder.pos_embed",
                &[1, n_img_embd, n_img_embd, n_enc_state],
            )?,
            proj_w: store.bind(
                "image_encoder.patch_embed.proj.weight",
                &[n_enc_state, 3, n_patch, n_patch],
            )?,
            proj_b: store.bind("image_encoder.patch_embed.proj.bias", &[n_enc_state])?,
            neck_conv_0: store.bind("image_encoder.neck.0.weight", &[n_out, n_enc_state, 1, 1])?,
            neck_norm_0_w: store.bind("image_encoder.neck.1.weight", &[n_out])?,
            neck_norm_0_b: store.bind("image_encoder.neck.1.bias", &[n_out])?,
            neck_conv_1: store.bind("image_encoder.neck.2.weight", &[n_out, n_out, 3, 3])?,
            neck_norm_1_w: store.bind("image_encoder.neck.3.weight", &[n_out])?,
            neck_norm_1_b: store.bind("image_encoder.neck.3.bias", &[n_out])?,
            layers,
        })
    }
}

impl PromptEncoderWeights {
    pub(crate) fn bind(store: &WeightStore, hparams: &Hyperparameters) -> Result<Self, LoadError> {
        let n_out = hparams.n_enc_out_chans;

        let pt_embd = (0..hparams.n_pt_embd)
            .map(|i| store.bind(&format!("prompt_encoder.point_embeddings.{i}.weight"), &[1, n_out]))
            .collect::<Result<Vec<_>, LoadError>>()?;

        Ok(PromptEncoderWeights {
            pe: store.bind(
                "prompt_encoder.pe_layer.positional_encoding_gaussian_matrix",
                &[2, n_out / 2],
            )?,
            not_a_pt_embd_w: store.bind("prompt_encoder.not_a_point_embed.weight", &[1, n_out])?,
            pt_embd,
            no_mask_embd_w: store.bind("prompt_encoder.no_mask_embed.weight", &[1, n_out])?,
        })
    }
}

impl AttentionWeights {
    fn bind(store: &WeightStore, prefix: &str, n_embd: usize) -> Result<Self, LoadError> {
        Ok(AttentionWeights {
            q_w: store.bind(&format!("{prefix}.q_proj.weight"), &[ANY, n_embd])?,
            q_b: store.bind(&format!("{prefix}.q_proj.bias"), &[ANY])?,
            k_w: store.bind(&format!("{prefix}.k_proj.weight"), &[ANY, n_embd])?,
            k_b: store.bind(&format!("{prefix}.k_proj.bias"), &[ANY])?,
            v_w: store.bind(&format!("{prefix}.v_proj.weight"), &[ANY, n_embd])?,
            v_b: store.bind(&format!("{prefix}.v_proj.bias"), &[ANY])?,
            out_w: store.bind(&format!("{prefix}.out_proj.weight"), &[n_embd, ANY])?,
            out_b: store.bind(&format!("{prefix}.out_proj.bias"), &[n_embd])?,
        })
    }
}

impl MlpWeights {
    fn bind(store: &WeightStore, prefix: &str, shapes: &[[usize; 2]]) -> Result<Self, LoadError> {
        let layers = shapes
            .iter()
            .enumerate()
            .map(|(i, shape)| {
                Ok((
                    store.bind(&format!("{prefix}.layers.{i}.weight"), shape)?,
                    store.bind(&format!("{prefix}.layers.{i}.bias"), &[shape[0]])?,
                ))
            })
            .collect::<Result<Vec<_>, LoadError>>()?;

        Ok(MlpWeights { layers })
    }
}

impl MaskDecoderWeights {
    pub(crate) fn bind(store: &WeightStore, hparams: &Hyperparameters) -> Result<Self, LoadError> {
        let n_out = hparams.n_enc_out_chans;
        let n_tokens = hparams.n_mask_tokens;
        let norm = |name: &str| store.bind(name, &[n_out]);

        let transformer_layers = (0..hparams.n_dec_layer)
            .map(|i| {
                let prefix = format!("mask_decoder.transformer.layers.{i}");
                Ok(TwoWayLayer {
                    self_attn: AttentionWeights::bind(store, &format!("{prefix}.self_attn"), n_out)?,
                    norm1_w: norm(&format!("{prefix}.norm1.weight"))?,
                    norm1_b: norm(&format!("{prefix}.norm1.bias"))?,
                    cross_attn_token_to_img: AttentionWeights::bind(
                        store,
                        &format!("{prefix}.cross_attn_token_to_image"),
                        n_out,
                    )?,
                    norm2_w: norm(&format!("{prefix}.norm2.weight"))?,
                    norm2_b: norm(&format!("{prefix}.norm2.bias"))?,
                    mlp_lin1_w: store.bind(&format!("{prefix}.mlp.lin1.weight"), &[ANY, n_out])?,
                    mlp_lin1_b: store.bind(&format!("{prefix}.mlp.lin1.bias"), &[ANY])?,
                    mlp_lin2_w: store.bind(&format!("{prefix}.mlp.lin2.weight"), &[n_out, ANY])?,
                    mlp_lin2_b: norm(&format!("{prefix}.mlp.lin2.bias"))?,
                    norm3_w: norm(&format!("{prefix}.norm3.weight"))?,
                    norm3_b: norm(&format!("{prefix}.norm3.bias"))?,
                    norm4_w: norm(&format!("{prefix}.norm4.weight"))?,
                    norm4_b: norm(&format!("{prefix}.norm4.bias"))?,
                    cross_attn_img_to_token: AttentionWeights::bind(
                        store,
                        &format!("{prefix}.cross_attn_image_to_token"),
                        n_out,
                    )?,
                })
            })
            .collect::<Result<Vec<_>, LoadError>>()?;

        let output_hypernet_mlps = (0..n_tokens)
            .map(|i| {
                MlpWeights::bind(
                    store,
                    &format!("mask_decoder.output_hypernetworks_mlps.{i}"),
                    &[[n_out, n_out], [n_out, n_out], [n_out / 8, n_out]],
                )
            })
            .collect::<Result<Vec<_>, LoadError>>()?;

        Ok(MaskDecoderWeights {
            transformer_layers,
            final_attn_token_to_img: AttentionWeights::bind(
                store,
                "mask_decoder.transformer.final_attn_token_to_image",
                n_out,
            )?,
            norm_final_w: norm("mask_decoder.transformer.norm_final_attn.weight")?,
            norm_final_b: norm("mask_decoder.transformer.norm_final_attn.bias")?,
            output_upscaling_0_w: store.bind(
                "mask_decoder.output_upscaling.0.weight",
                &[n_out, n_out / 4, 2, 2],
            )?,
            output_upscaling_0_b: store.bind("mask_decoder.output_upscaling.0.bias", &[n_out / 4])?,
            output_upscaling_1_w: store.bind("mask_decoder.output_upscaling.1.weight", &[n_out / 4])?,
            output_upscaling_1_b: store.bind("mask_decoder.output_upscaling.1.bias", &[n_out / 4])?,
            output_upscaling_3_w: store.bind(
                "mask_decoder.output_upscaling.3.weight",
                &[n_out / 4, n_out / 8, 2, 2],
            )?,
            output_upscaling_3_b: store.bind("mask_decoder.output_upscaling.3.bias", &[n_out / 8])?,
            output_hypernet_mlps,
            iou_prediction_head: MlpWeights::bind(
                store,
                "mask_decoder.iou_prediction_head",
                &[[ANY, n_out], [ANY, ANY], [n_tokens, ANY]],
            )?,
            iou_token_w: store.bind("mask_decoder.iou_token.weight", &[1, n_out])?,
            mask_tokens_w: store.bind("mask_decoder.mask_tokens.weight", &[n_tokens, n_out])?,
        })
    }
}
