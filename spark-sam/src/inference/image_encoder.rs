use crate::graph::planner::plan_and_execute;
use crate::graph::{Graph, ScratchBuffer, TensorId};
use crate::model::hparams::Hyperparameters;
use crate::model::layers::EncoderLayer;
use crate::model::weights::{WeightId, WeightStore};
use crate::model::SamModel;
use crate::utils::image::ImageF32;
use anyhow::{ensure, Context, Result};
use log::debug;
use ndarray::{Array3, Ix3};
use rayon::ThreadPool;

pub(crate) fn weight<'a>(graph: &mut Graph<'a>, weights: &'a WeightStore, id: WeightId) -> Result<TensorId> {
    graph
        .weight(weights.get(id))
        .with_context(|| format!("binding {}", weights.name(id)))
}

/// Runs the ViT encoder on a preprocessed image and returns the image
/// embedding, `[G, G, n_enc_out_chans]`.
pub fn encode(
    model: &SamModel,
    image: &ImageF32,
    scratch: &mut ScratchBuffer,
    pool: &ThreadPool,
) -> Result<Array3<f32>> {
    let outputs = plan_and_execute(scratch, pool, |graph| {
        let embedding = build_image_encoder(graph, model, image)?;
        graph.mark_output(embedding);
        Ok(())
    })?;

    let embedding = outputs
        .into_iter()
        .next()
        .context("encoder graph produced no output")?
        .into_dimensionality::<Ix3>()?;
    Ok(embedding)
}

pub(crate) fn build_image_encoder<'a>(
    graph: &mut Graph<'a>,
    model: &'a SamModel,
    image: &'a ImageF32,
) -> Result<TensorId> {
    let hparams = &model.hparams;
    let weights = &model.weights;
    let enc = &model.enc_img;

    let n_img = hparams.n_img_size;
    let n_patch = hparams.n_patch_size;
    let n_grid = hparams.n_img_embd();
    let n_state = hparams.n_enc_state;
    ensure!(
        image.width() == n_img && image.height() == n_img,
        "encoder expects a {n_img}x{n_img} image, got {}x{}",
        image.width(),
        image.height()
    );

    // patch embedding: a stride-P convolution expressed as im2col + matmul
    let pixels = graph.input(&[n_img, n_img, 3], move |buf| {
        buf.copy_from_slice(image.data())
    });
    let patches = graph.im2col(pixels, (n_patch, n_patch), n_patch, 0)?;
    let proj_w = weight(graph, weights, enc.proj_w)?;
    let proj_w = graph.reshape(proj_w, &[n_state, 3 * n_patch * n_patch])?;
    let proj_b = weight(graph, weights, enc.proj_b)?;
    let cur = graph.linear(patches, proj_w, proj_b)?;
    let cur = graph.reshape(cur, &[n_grid, n_grid, n_state])?;

    let pos_embed = weight(graph, weights, enc.pe)?;
    let pos_embed = graph.reshape(pos_embed, &[n_grid, n_grid, n_state])?;
    let mut inp = graph.add(cur, pos_embed)?;

    for (il, layer) in enc.layers.iter().enumerate() {
        inp = encoder_block(graph, hparams, weights, layer, inp, hparams.is_global_attn(il))
            .with_context(|| format!("encoder block {il}"))?;
    }

    let out = neck(graph, model, inp)?;
    debug!("image encoder graph: {} nodes", graph.len());
    Ok(out)
}

/// One transformer block over a `[G, G, C]` grid: attention with decomposed
/// relative position bias, windowed unless `global`, then the MLP.
pub(crate) fn encoder_block<'a>(
    graph: &mut Graph<'a>,
    hparams: &Hyperparameters,
    weights: &'a WeightStore,
    layer: &EncoderLayer,
    input: TensorId,
    global: bool,
) -> Result<TensorId> {
    let n_state = hparams.n_enc_state;
    let n_head = hparams.n_enc_head;
    let head_dim = hparams.n_enc_head_dim();

    let grid = graph.shape(input).to_vec();
    ensure!(
        grid.len() == 3 && grid[2] == n_state,
        "encoder block expects [H, W, {n_state}], got {grid:?}"
    );
    let (gh, gw) = (grid[0], grid[1]);

    let w = |graph: &mut Graph<'a>, id: WeightId| weight(graph, weights, id);

    let norm1_w = w(graph, layer.norm1_w)?;
    let norm1_b = w(graph, layer.norm1_b)?;
    let cur = graph.layer_norm(input, norm1_w, norm1_b, hparams.eps)?;

    let (cur, size) = if global {
        ensure!(gh == gw, "global attention over a non-square grid {gh}x{gw}");
        (graph.reshape(cur, &[1, gh, gw, n_state])?, gh)
    } else {
        let window = hparams.n_window_size;
        (graph.win_part(cur, window)?, window)
    };
    let n_batch = graph.shape(cur)[0];
    let n_tokens = size * size;
    let n_bh = n_batch * n_head;

    let qkv_w = w(graph, layer.qkv_w)?;
    let qkv_b = w(graph, layer.qkv_b)?;
    let x = graph.reshape(cur, &[n_batch * n_tokens, n_state])?;
    let qkv = graph.linear(x, qkv_w, qkv_b)?;
    let qkv = graph.reshape(qkv, &[n_batch, n_tokens, 3, n_head, head_dim])?;
    let qkv = graph.permute(qkv, &[2, 0, 3, 1, 4])?;

    let mut split = |i: usize| -> Result<TensorId> {
        let part = graph.slice(qkv, 0, i, 1)?;
        graph.reshape(part, &[n_bh, n_tokens, head_dim])
    };
    let (q, k, v) = (split(0)?, split(1)?, split(2)?);

    let q_scaled = graph.scale(q, 1.0 / (head_dim as f32).sqrt());
    let attn = graph.matmul(q_scaled, k, true)?;

    // relative position terms use the unscaled queries
    let rel_pos_h = w(graph, layer.rel_pos_h)?;
    let rel_pos_w = w(graph, layer.rel_pos_w)?;
    let r_h = graph.get_rel_pos(rel_pos_h, size)?;
    let r_w = graph.get_rel_pos(rel_pos_w, size)?;
    let r_q = graph.reshape(q, &[n_bh, size, size, head_dim])?;

    let q_rows = graph.permute(r_q, &[1, 0, 2, 3])?;
    let q_rows = graph.reshape(q_rows, &[size, n_bh * size, head_dim])?;
    let rel_h = graph.matmul(q_rows, r_h, true)?;
    let rel_h = graph.reshape(rel_h, &[size, n_bh, size, size])?;
    let rel_h = graph.permute(rel_h, &[1, 0, 2, 3])?;

    let q_cols = graph.permute(r_q, &[2, 0, 1, 3])?;
    let q_cols = graph.reshape(q_cols, &[size, n_bh * size, head_dim])?;
    let rel_w = graph.matmul(q_cols, r_w, true)?;
    let rel_w = graph.reshape(rel_w, &[size, n_bh, size, size])?;
    let rel_w = graph.permute(rel_w, &[1, 2, 0, 3])?;

    let attn = graph.add_rel_pos(attn, rel_h, rel_w)?;
    let attn = graph.softmax(attn);

    let out = graph.matmul(attn, v, false)?;
    let out = graph.reshape(out, &[n_batch, n_head, size, size, head_dim])?;
    let out = graph.permute(out, &[0, 2, 3, 1, 4])?;
    let out = graph.reshape(out, &[n_batch * n_tokens, n_state])?;

    let proj_w = w(graph, layer.proj_w)?;
    let proj_b = w(graph, layer.proj_b)?;
    let out = graph.linear(out, proj_w, proj_b)?;

    let out = if global {
        graph.reshape(out, &[gh, gw, n_state])?
    } else {
        let out = graph.reshape(out, &[n_batch, size, size, n_state])?;
        graph.win_unpart(out, size, gh, gw)?
    };
    let inp = graph.add(out, input)?;

    let norm2_w = w(graph, layer.norm2_w)?;
    let norm2_b = w(graph, layer.norm2_b)?;
    let cur = graph.layer_norm(inp, norm2_w, norm2_b, hparams.eps)?;
    let cur = graph.reshape(cur, &[gh * gw, n_state])?;

    let lin1_w = w(graph, layer.mlp_lin1_w)?;
    let lin1_b = w(graph, layer.mlp_lin1_b)?;
    let cur = graph.linear(cur, lin1_w, lin1_b)?;
    let cur = graph.gelu(cur);

    let lin2_w = w(graph, layer.mlp_lin2_w)?;
    let lin2_b = w(graph, layer.mlp_lin2_b)?;
    let cur = graph.linear(cur, lin2_w, lin2_b)?;
    let cur = graph.reshape(cur, &[gh, gw, n_state])?;

    graph.add(cur, inp)
}

/// conv1x1 -> LayerNorm2d -> conv3x3 -> LayerNorm2d down to `n_enc_out_chans`.
fn neck<'a>(graph: &mut Graph<'a>, model: &'a SamModel, input: TensorId) -> Result<TensorId> {
    let hparams = &model.hparams;
    let weights = &model.weights;
    let enc = &model.enc_img;
    let n_grid = hparams.n_img_embd();
    let n_state = hparams.n_enc_state;
    let n_out = hparams.n_enc_out_chans;

    let x = graph.reshape(input, &[n_grid * n_grid, n_state])?;
    let conv0 = weight(graph, weights, enc.neck_conv_0)?;
    let conv0 = graph.reshape(conv0, &[n_out, n_state])?;
    let cur = graph.matmul(x, conv0, true)?;

    let norm0_w = weight(graph, weights, enc.neck_norm_0_w)?;
    let norm0_b = weight(graph, weights, enc.neck_norm_0_b)?;
    let cur = graph.layer_norm(cur, norm0_w, norm0_b, hparams.eps)?;
    let cur = graph.reshape(cur, &[n_grid, n_grid, n_out])?;

    let cols = graph.im2col(cur, (3, 3), 1, 1)?;
    let conv1 = weight(graph, weights, enc.neck_conv_1)?;
    let conv1 = graph.reshape(conv1, &[n_out, n_out * 9])?;
    let cur = graph.matmul(cols, conv1, true)?;

    let norm1_w = weight(graph, weights, enc.neck_norm_1_w)?;
    let norm1_b = weight(graph, weights, enc.neck_norm_1_b)?;
    let cur = graph.layer_norm(cur, norm1_w, norm1_b, hparams.eps)?;
    graph.reshape(cur, &[n_grid, n_grid, n_out])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ScratchBuffer;
    use ndarray::{ArrayD, IxDyn};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rayon::ThreadPoolBuilder;

    fn random(rng: &mut StdRng, shape: &[usize]) -> ArrayD<f32> {
        let len: usize = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..len).map(|_| rng.gen_range(-0.2..0.2)).collect())
            .unwrap()
    }

    /// Store holding a single encoder block, bound by hand.
    fn single_block(hparams: &Hyperparameters, size: usize) -> (WeightStore, EncoderLayer) {
        let mut rng = StdRng::seed_from_u64(7);
        let c = hparams.n_enc_state;
        let hd = hparams.n_enc_head_dim();
        let mut store = WeightStore::new();
        let mut add = |name: &str, shape: &[usize]| store.insert(name, random(&mut rng, shape));

        let layer = EncoderLayer {
            norm1_w: add("norm1.weight", &[c]),
            norm1_b: add("norm1.bias", &[c]),
            rel_pos_w: add("rel_pos_w", &[2 * size - 1, hd]),
            rel_pos_h: add("rel_pos_h", &[2 * size - 1, hd]),
            qkv_w: add("qkv.weight", &[3 * c, c]),
            qkv_b: add("qkv.bias", &[3 * c]),
            proj_w: add("proj.weight", &[c, c]),
            proj_b: add("proj.bias", &[c]),
            norm2_w: add("norm2.weight", &[c]),
            norm2_b: add("norm2.bias", &[c]),
            mlp_lin1_w: add("lin1.weight", &[4 * c, c]),
            mlp_lin1_b: add("lin1.bias", &[4 * c]),
            mlp_lin2_w: add("lin2.weight", &[c, 4 * c]),
            mlp_lin2_b: add("lin2.bias", &[c]),
        };
        (store, layer)
    }

    fn run_block(hparams: &Hyperparameters, store: &WeightStore, layer: &EncoderLayer, global: bool) -> ArrayD<f32> {
        let grid = hparams.n_img_embd();
        let mut rng = StdRng::seed_from_u64(11);
        let input = random(&mut rng, &[grid, grid, hparams.n_enc_state]);
        let pool = ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let mut scratch = ScratchBuffer::new();

        let outputs = plan_and_execute(&mut scratch, &pool, |graph| {
            let x = graph.input(input.shape(), |buf| {
                buf.copy_from_slice(input.as_slice().unwrap())
            });
            let out = encoder_block(graph, hparams, store, layer, x, global)?;
            graph.mark_output(out);
            Ok(())
        })
        .unwrap();
        outputs.into_iter().next().unwrap()
    }

    fn tiny_hparams(window: usize) -> Hyperparameters {
        Hyperparameters {
            n_enc_state: 16,
            n_enc_head: 2,
            n_img_size: 64,
            n_patch_size: 16,
            n_window_size: window,
            ..Hyperparameters::default()
        }
    }

    #[test]
    fn single_window_matches_global_attention() {
        // one 4x4 window covers the 4x4 grid exactly
        let hparams = tiny_hparams(4);
        let (store, layer) = single_block(&hparams, 4);

        let windowed = run_block(&hparams, &store, &layer, false);
        let global = run_block(&hparams, &store, &layer, true);
        assert_eq!(windowed.shape(), &[4, 4, 16]);
        for (a, b) in windowed.iter().zip(global.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} != {b}");
        }
    }

    #[test]
    fn padded_windows_keep_grid_shape() {
        let hparams = tiny_hparams(3);
        let (store, layer) = single_block(&hparams, 3);
        let out = run_block(&hparams, &store, &layer, false);
        assert_eq!(out.shape(), &[4, 4, 16]);
        assert!(out.iter().all(|v| v.is_finite()));
    }
}
