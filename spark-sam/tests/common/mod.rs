#![allow(dead_code)]

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spark_sam::model::loader::ModelWriter;
use spark_sam::{Hyperparameters, ImageU8};
use std::path::PathBuf;
use tempfile::TempDir;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Width 32, every encoder layer windowed, 4x4 embedding grid.
pub fn tiny_hparams() -> Hyperparameters {
    Hyperparameters {
        n_enc_state: 32,
        n_enc_layer: 2,
        n_enc_head: 2,
        n_enc_out_chans: 16,
        n_pt_embd: 4,
        n_dec_layer: 2,
        n_dec_heads: 2,
        n_mask_tokens: 4,
        n_img_size: 32,
        n_patch_size: 8,
        n_window_size: 2,
        ftype: 0,
        ..Hyperparameters::default()
    }
}

/// ViT-B width with three layers, so layer 2 attends globally.
pub fn global_hparams() -> Hyperparameters {
    Hyperparameters {
        n_enc_state: 768,
        n_enc_layer: 3,
        n_enc_head: 12,
        n_enc_out_chans: 16,
        n_img_size: 64,
        n_patch_size: 16,
        n_window_size: 3,
        ftype: 0,
        ..tiny_hparams()
    }
}

struct Init {
    rng: StdRng,
}

impl Init {
    /// Uniform in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
    fn dense(&mut self, shape: &[usize], fan_in: usize) -> ArrayD<f32> {
        let bound = 1.0 / (fan_in as f32).sqrt();
        self.uniform(shape, bound)
    }

    fn uniform(&mut self, shape: &[usize], bound: f32) -> ArrayD<f32> {
        ArrayD::from_shape_simple_fn(IxDyn(shape), || self.rng.gen_range(-bound..=bound))
    }
}

fn ones(shape: &[usize]) -> ArrayD<f32> {
    ArrayD::ones(IxDyn(shape))
}

fn zeros(shape: &[usize]) -> ArrayD<f32> {
    ArrayD::zeros(IxDyn(shape))
}

fn add_attention(writer: &mut ModelWriter, init: &mut Init, prefix: &str, dim: usize, internal: usize) {
    for proj in ["q_proj", "k_proj", "v_proj"] {
        writer.add(format!("{prefix}.{proj}.weight"), init.dense(&[internal, dim], dim));
        writer.add(format!("{prefix}.{proj}.bias"), init.dense(&[internal], dim));
    }
    writer.add(format!("{prefix}.out_proj.weight"), init.dense(&[dim, internal], internal));
    writer.add(format!("{prefix}.out_proj.bias"), init.dense(&[dim], internal));
}

fn add_norm(writer: &mut ModelWriter, prefix: &str, dim: usize) {
    writer.add(format!("{prefix}.weight"), ones(&[dim]));
    writer.add(format!("{prefix}.bias"), zeros(&[dim]));
}

fn add_mlp(writer: &mut ModelWriter, init: &mut Init, prefix: &str, dims: &[usize]) {
    for (i, pair) in dims.windows(2).enumerate() {
        let (fan_in, fan_out) = (pair[0], pair[1]);
        writer.add(format!("{prefix}.layers.{i}.weight"), init.dense(&[fan_out, fan_in], fan_in));
        writer.add(format!("{prefix}.layers.{i}.bias"), init.dense(&[fan_out], fan_in));
    }
}

/// Random weights with every tensor the architecture binds.
pub fn model_writer(hparams: &Hyperparameters, seed: u64) -> ModelWriter {
    let mut init = Init {
        rng: StdRng::seed_from_u64(seed),
    };
    let mut writer = ModelWriter::new(hparams.clone());

    let c = hparams.n_enc_state;
    let o = hparams.n_enc_out_chans;
    let g = hparams.n_img_embd();
    let p = hparams.n_patch_size;
    let head_dim = hparams.n_enc_head_dim();
    let mlp_dim = 2 * c.min(64);

    writer.add("image_encoder.pos_embed", init.uniform(&[1, g, g, c], 0.02));
    writer.add(
        "image_encoder.patch_embed.proj.weight",
        init.dense(&[c, 3, p, p], 3 * p * p),
    );
    writer.add("image_encoder.patch_embed.proj.bias", init.dense(&[c], 3 * p * p));
    for i in 0..hparams.n_enc_layer {
        let prefix = format!("image_encoder.blocks.{i}");
        let attn_size = if hparams.is_global_attn(i) {
            g
        } else {
            hparams.n_window_size
        };
        add_norm(&mut writer, &format!("{prefix}.norm1"), c);
        writer.add(
            format!("{prefix}.attn.rel_pos_h"),
            init.uniform(&[2 * attn_size - 1, head_dim], 0.1),
        );
        writer.add(
            format!("{prefix}.attn.rel_pos_w"),
            init.uniform(&[2 * attn_size - 1, head_dim], 0.1),
        );
        writer.add(format!("{prefix}.attn.qkv.weight"), init.dense(&[3 * c, c], c));
        writer.add(format!("{prefix}.attn.qkv.bias"), init.dense(&[3 * c], c));
        writer.add(format!("{prefix}.attn.proj.weight"), init.dense(&[c, c], c));
        writer.add(format!("{prefix}.attn.proj.bias"), init.dense(&[c], c));
        add_norm(&mut writer, &format!("{prefix}.norm2"), c);
        writer.add(format!("{prefix}.mlp.lin1.weight"), init.dense(&[mlp_dim, c], c));
        writer.add(format!("{prefix}.mlp.lin1.bias"), init.dense(&[mlp_dim], c));
        writer.add(format!("{prefix}.mlp.lin2.weight"), init.dense(&[c, mlp_dim], mlp_dim));
        writer.add(format!("{prefix}.mlp.lin2.bias"), init.dense(&[c], mlp_dim));
    }
    writer.add("image_encoder.neck.0.weight", init.dense(&[o, c, 1, 1], c));
    add_norm(&mut writer, "image_encoder.neck.1", o);
    writer.add("image_encoder.neck.2.weight", init.dense(&[o, o, 3, 3], 9 * o));
    add_norm(&mut writer, "image_encoder.neck.3", o);

    writer.add(
        "prompt_encoder.pe_layer.positional_encoding_gaussian_matrix",
        init.uniform(&[2, o / 2], 1.0),
    );
    writer.add("prompt_encoder.not_a_point_embed.weight", init.uniform(&[1, o], 1.0));
    for i in 0..hparams.n_pt_embd {
        writer.add(
            format!("prompt_encoder.point_embeddings.{i}.weight"),
            init.uniform(&[1, o], 1.0),
        );
    }
    writer.add("prompt_encoder.no_mask_embed.weight", init.uniform(&[1, o], 0.1));

    for i in 0..hparams.n_dec_layer {
        let prefix = format!("mask_decoder.transformer.layers.{i}");
        add_attention(&mut writer, &mut init, &format!("{prefix}.self_attn"), o, o);
        add_norm(&mut writer, &format!("{prefix}.norm1"), o);
        add_attention(&mut writer, &mut init, &format!("{prefix}.cross_attn_token_to_image"), o, o / 2);
        add_norm(&mut writer, &format!("{prefix}.norm2"), o);
        writer.add(format!("{prefix}.mlp.lin1.weight"), init.dense(&[4 * o, o], o));
        writer.add(format!("{prefix}.mlp.lin1.bias"), init.dense(&[4 * o], o));
        writer.add(format!("{prefix}.mlp.lin2.weight"), init.dense(&[o, 4 * o], 4 * o));
        writer.add(format!("{prefix}.mlp.lin2.bias"), init.dense(&[o], 4 * o));
        add_norm(&mut writer, &format!("{prefix}.norm3"), o);
        add_norm(&mut writer, &format!("{prefix}.norm4"), o);
        add_attention(&mut writer, &mut init, &format!("{prefix}.cross_attn_image_to_token"), o, o / 2);
    }
    add_attention(
        &mut writer,
        &mut init,
        "mask_decoder.transformer.final_attn_token_to_image",
        o,
        o / 2,
    );
    add_norm(&mut writer, "mask_decoder.transformer.norm_final_attn", o);

    writer.add("mask_decoder.output_upscaling.0.weight", init.dense(&[o, o / 4, 2, 2], o));
    writer.add("mask_decoder.output_upscaling.0.bias", init.dense(&[o / 4], o));
    add_norm(&mut writer, "mask_decoder.output_upscaling.1", o / 4);
    writer.add(
        "mask_decoder.output_upscaling.3.weight",
        init.dense(&[o / 4, o / 8, 2, 2], o / 4),
    );
    writer.add("mask_decoder.output_upscaling.3.bias", init.dense(&[o / 8], o / 4));

    let n_tokens = hparams.n_mask_tokens;
    for t in 0..n_tokens {
        add_mlp(
            &mut writer,
            &mut init,
            &format!("mask_decoder.output_hypernetworks_mlps.{t}"),
            &[o, o, o, o / 8],
        );
    }
    add_mlp(
        &mut writer,
        &mut init,
        "mask_decoder.iou_prediction_head",
        &[o, 2 * o, 2 * o, n_tokens],
    );
    writer.add("mask_decoder.iou_token.weight", init.uniform(&[1, o], 1.0));
    writer.add("mask_decoder.mask_tokens.weight", init.uniform(&[n_tokens, o], 1.0));

    writer
}

/// Saves `writer` into a fresh temporary directory.
pub fn save(writer: &ModelWriter) -> anyhow::Result<(TempDir, PathBuf)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("sam.bin");
    writer.save(&path)?;
    Ok((dir, path))
}

/// Solid background with a contrasting square of side `side` at `(x0, y0)`.
pub fn square_image(width: usize, height: usize, x0: usize, y0: usize, side: usize) -> ImageU8 {
    let mut image = ImageU8::filled(width, height, [30, 60, 90]);
    for y in y0..(y0 + side).min(height) {
        for x in x0..(x0 + side).min(width) {
            image.put_pixel(x, y, [230, 200, 20]);
        }
    }
    image
}
