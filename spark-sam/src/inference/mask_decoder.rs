use super::image_encoder::weight;
use super::prompt_encoder::PromptEmbedding;
use crate::graph::planner::plan_and_execute;
use crate::graph::{Graph, ScratchBuffer, TensorId};
use crate::model::layers::{AttentionWeights, MlpWeights, TwoWayLayer};
use crate::model::weights::{WeightId, WeightStore};
use crate::model::SamModel;
use anyhow::{ensure, Context, Result};
use log::debug;
use ndarray::{Array1, Array3, Ix1, Ix3};
use rayon::ThreadPool;

/// Raw decoder output for every mask token.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `[n_mask_tokens, 4G, 4G]` mask logits.
    pub low_res_masks: Array3<f32>,
    /// `[n_mask_tokens]` predicted IoU per mask token.
    pub iou_predictions: Array1<f32>,
}

/// Mask tokens handed to postprocessing. Token 0 is the single-mask output;
/// the others are the multimask alternatives.
pub fn candidate_indices(n_mask_tokens: usize, multimask_output: bool) -> Vec<usize> {
    if multimask_output && n_mask_tokens > 1 {
        (1..n_mask_tokens).collect()
    } else {
        vec![0]
    }
}

/// Fuses the prompt with the cached image embedding and predicts mask logits.
/// `embedding` is only read.
pub fn decode(
    model: &SamModel,
    embedding: &Array3<f32>,
    prompt: &PromptEmbedding,
    scratch: &mut ScratchBuffer,
    pool: &ThreadPool,
) -> Result<DecoderOutput> {
    let mut outputs = plan_and_execute(scratch, pool, |graph| {
        let (masks, iou) = build_mask_decoder(graph, model, embedding, prompt)?;
        graph.mark_output(masks);
        graph.mark_output(iou);
        Ok(())
    })?
    .into_iter();

    let low_res_masks = outputs
        .next()
        .context("decoder graph produced no masks")?
        .into_dimensionality::<Ix3>()?;
    let iou_predictions = outputs
        .next()
        .context("decoder graph produced no IoU predictions")?
        .into_dimensionality::<Ix1>()?;

    Ok(DecoderOutput {
        low_res_masks,
        iou_predictions,
    })
}

pub(crate) fn build_mask_decoder<'a>(
    graph: &mut Graph<'a>,
    model: &'a SamModel,
    embedding: &'a Array3<f32>,
    prompt: &'a PromptEmbedding,
) -> Result<(TensorId, TensorId)> {
    let hparams = &model.hparams;
    let weights = &model.weights;
    let dec = &model.dec;

    let n_grid = hparams.n_img_embd();
    let n_out = hparams.n_enc_out_chans;
    let n_tokens = hparams.n_mask_tokens;
    let n_heads = hparams.n_dec_heads;
    let eps = hparams.eps_decoder_transformer;
    ensure!(
        embedding.dim() == (n_grid, n_grid, n_out),
        "image embedding has shape {:?}, expected [{n_grid}, {n_grid}, {n_out}]",
        embedding.shape()
    );
    let w = |graph: &mut Graph<'a>, id: WeightId| weight(graph, weights, id);

    // tokens: [iou, mask_0 .. mask_{T-1}, point, padding]
    let sparse = graph.input(&[prompt.sparse.nrows(), n_out], move |buf| {
        buf.iter_mut()
            .zip(prompt.sparse.iter())
            .for_each(|(b, v)| *b = *v)
    });
    let dense = graph.input(&[n_out], move |buf| {
        buf.iter_mut()
            .zip(prompt.dense.iter())
            .for_each(|(b, v)| *b = *v)
    });
    let iou_token = w(graph, dec.iou_token_w)?;
    let mask_tokens = w(graph, dec.mask_tokens_w)?;
    let tokens = graph.concat(&[iou_token, mask_tokens, sparse], 0)?;

    // the cached embedding enters as external data and is never written
    let image = graph.external(
        embedding
            .as_slice()
            .context("image embedding is not contiguous")?,
        &[n_grid * n_grid, n_out],
    )?;
    let src = graph.add(image, dense)?;
    let pos_src = graph.external(
        model
            .image_pe()
            .as_slice()
            .context("image positional encoding is not contiguous")?,
        &[n_grid * n_grid, n_out],
    )?;

    // two-way transformer
    let mut queries = tokens;
    let mut keys = src;
    for (il, layer) in dec.transformer_layers.iter().enumerate() {
        (queries, keys) = two_way_block(graph, weights, layer, n_heads, eps, queries, keys, tokens, pos_src, il == 0)
            .with_context(|| format!("two-way block {il}"))?;
    }

    let q = graph.add(queries, tokens)?;
    let k = graph.add(keys, pos_src)?;
    let attn_out = attention(graph, weights, &dec.final_attn_token_to_img, n_heads, q, k, keys)?;
    let queries = graph.add(queries, attn_out)?;
    let norm_w = w(graph, dec.norm_final_w)?;
    let norm_b = w(graph, dec.norm_final_b)?;
    let queries = graph.layer_norm(queries, norm_w, norm_b, eps)?;

    // upscale the image stream 4x with two stride-2 transposed convolutions
    let keys = graph.reshape(keys, &[n_grid, n_grid, n_out])?;
    let up = conv_transpose_2x2(graph, weights, keys, dec.output_upscaling_0_w, dec.output_upscaling_0_b)?;
    let norm_w = w(graph, dec.output_upscaling_1_w)?;
    let norm_b = w(graph, dec.output_upscaling_1_b)?;
    let up = graph.layer_norm(up, norm_w, norm_b, hparams.eps)?;
    let up = graph.gelu(up);
    let up = conv_transpose_2x2(graph, weights, up, dec.output_upscaling_3_w, dec.output_upscaling_3_b)?;
    let up = graph.gelu(up);

    let n_low_res = hparams.n_low_res_mask();
    let n_hyper = n_out / 8;
    let up = graph.reshape(up, &[n_low_res * n_low_res, n_hyper])?;

    let hyper = dec
        .output_hypernet_mlps
        .iter()
        .enumerate()
        .map(|(t, mlp_weights)| {
            let token = graph.slice(queries, 0, 1 + t, 1)?;
            mlp(graph, weights, mlp_weights, token)
        })
        .collect::<Result<Vec<_>>>()?;
    let hyper = graph.concat(&hyper, 0)?;
    let masks = graph.matmul(hyper, up, true)?;
    let masks = graph.reshape(masks, &[n_tokens, n_low_res, n_low_res])?;

    let iou_token_out = graph.slice(queries, 0, 0, 1)?;
    let iou = mlp(graph, weights, &dec.iou_prediction_head, iou_token_out)?;
    let iou = graph.reshape(iou, &[n_tokens])?;

    debug!("mask decoder graph: {} nodes", graph.len());
    Ok((masks, iou))
}

/// Self attention, token-to-image attention, MLP and image-to-token attention.
/// Returns the updated `(queries, keys)`.
#[allow(clippy::too_many_arguments)]
fn two_way_block<'a>(
    graph: &mut Graph<'a>,
    weights: &'a WeightStore,
    layer: &TwoWayLayer,
    n_heads: usize,
    eps: f32,
    queries: TensorId,
    keys: TensorId,
    query_pe: TensorId,
    key_pe: TensorId,
    skip_first_layer_pe: bool,
) -> Result<(TensorId, TensorId)> {
    let w = |graph: &mut Graph<'a>, id: WeightId| weight(graph, weights, id);

    let queries = if skip_first_layer_pe {
        attention(graph, weights, &layer.self_attn, n_heads, queries, queries, queries)?
    } else {
        let q = graph.add(queries, query_pe)?;
        let attn_out = attention(graph, weights, &layer.self_attn, n_heads, q, q, queries)?;
        graph.add(queries, attn_out)?
    };
    let norm1_w = w(graph, layer.norm1_w)?;
    let norm1_b = w(graph, layer.norm1_b)?;
    let queries = graph.layer_norm(queries, norm1_w, norm1_b, eps)?;

    let q = graph.add(queries, query_pe)?;
    let k = graph.add(keys, key_pe)?;
    let attn_out = attention(graph, weights, &layer.cross_attn_token_to_img, n_heads, q, k, keys)?;
    let queries = graph.add(queries, attn_out)?;
    let norm2_w = w(graph, layer.norm2_w)?;
    let norm2_b = w(graph, layer.norm2_b)?;
    let queries = graph.layer_norm(queries, norm2_w, norm2_b, eps)?;

    let lin1_w = w(graph, layer.mlp_lin1_w)?;
    let lin1_b = w(graph, layer.mlp_lin1_b)?;
    let mlp_out = graph.linear(queries, lin1_w, lin1_b)?;
    let mlp_out = graph.relu(mlp_out);
    let lin2_w = w(graph, layer.mlp_lin2_w)?;
    let lin2_b = w(graph, layer.mlp_lin2_b)?;
    let mlp_out = graph.linear(mlp_out, lin2_w, lin2_b)?;
    let queries = graph.add(queries, mlp_out)?;
    let norm3_w = w(graph, layer.norm3_w)?;
    let norm3_b = w(graph, layer.norm3_b)?;
    let queries = graph.layer_norm(queries, norm3_w, norm3_b, eps)?;

    let q = graph.add(queries, query_pe)?;
    let k = graph.add(keys, key_pe)?;
    let attn_out = attention(graph, weights, &layer.cross_attn_img_to_token, n_heads, k, q, queries)?;
    let keys = graph.add(keys, attn_out)?;
    let norm4_w = w(graph, layer.norm4_w)?;
    let norm4_b = w(graph, layer.norm4_b)?;
    let keys = graph.layer_norm(keys, norm4_w, norm4_b, eps)?;

    Ok((queries, keys))
}

/// Multi-head attention with separate q/k/v projections, `[N, C]` in and out.
fn attention<'a>(
    graph: &mut Graph<'a>,
    weights: &'a WeightStore,
    attn: &AttentionWeights,
    n_heads: usize,
    q: TensorId,
    k: TensorId,
    v: TensorId,
) -> Result<TensorId> {
    let mut project = |x: TensorId, w_id: WeightId, b_id: WeightId| -> Result<TensorId> {
        let w = weight(graph, weights, w_id)?;
        let b = weight(graph, weights, b_id)?;
        let x = graph.linear(x, w, b)?;

        let [n, dim] = graph.shape(x) else {
            anyhow::bail!("attention projection is not a matrix");
        };
        let (n, dim) = (*n, *dim);
        ensure!(dim % n_heads == 0, "{dim} channels do not split into {n_heads} heads");
        let x = graph.reshape(x, &[n, n_heads, dim / n_heads])?;
        graph.permute(x, &[1, 0, 2])
    };
    let q = project(q, attn.q_w, attn.q_b)?;
    let k = project(k, attn.k_w, attn.k_b)?;
    let v = project(v, attn.v_w, attn.v_b)?;

    let head_dim = graph.shape(q)[2];
    let n_q = graph.shape(q)[1];

    let scores = graph.matmul(q, k, true)?;
    let scores = graph.scale(scores, 1.0 / (head_dim as f32).sqrt());
    let scores = graph.softmax(scores);

    let out = graph.matmul(scores, v, false)?;
    let out = graph.permute(out, &[1, 0, 2])?;
    let out = graph.reshape(out, &[n_q, n_heads * head_dim])?;

    let out_w = weight(graph, weights, attn.out_w)?;
    let out_b = weight(graph, weights, attn.out_b)?;
    graph.linear(out, out_w, out_b)
}

/// Fully connected stack, ReLU between layers but not after the last.
fn mlp<'a>(graph: &mut Graph<'a>, weights: &'a WeightStore, mlp: &MlpWeights, x: TensorId) -> Result<TensorId> {
    let mut x = x;
    for (i, &(w_id, b_id)) in mlp.layers.iter().enumerate() {
        let w = weight(graph, weights, w_id)?;
        let b = weight(graph, weights, b_id)?;
        x = graph.linear(x, w, b)?;
        if i + 1 < mlp.layers.len() {
            x = graph.relu(x);
        }
    }
    Ok(x)
}

/// Kernel 2, stride 2 transposed convolution on a `[H, W, C_in]` grid with a
/// `[C_in, C_out, 2, 2]` kernel, giving `[2H, 2W, C_out]`.
fn conv_transpose_2x2<'a>(
    graph: &mut Graph<'a>,
    weights: &'a WeightStore,
    x: TensorId,
    kernel: WeightId,
    bias: WeightId,
) -> Result<TensorId> {
    let shape = graph.shape(x).to_vec();
    ensure!(shape.len() == 3, "transposed convolution expects [H, W, C], got {shape:?}");
    let (h, w, c_in) = (shape[0], shape[1], shape[2]);

    let kernel = weight(graph, weights, kernel)?;
    let c_out = graph.shape(kernel)[1];
    let kernel = graph.reshape(kernel, &[c_in, c_out * 4])?;

    let x = graph.reshape(x, &[h * w, c_in])?;
    let y = graph.matmul(x, kernel, false)?;
    let y = graph.reshape(y, &[h, w, c_out, 2, 2])?;
    // (y, x, c, dy, dx) -> (y, dy, x, dx, c)
    let y = graph.permute(y, &[0, 3, 1, 4, 2])?;
    let y = graph.reshape(y, &[2 * h, 2 * w, c_out])?;

    let bias = weight(graph, weights, bias)?;
    graph.add(y, bias)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Mode;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn multimask_skips_the_single_mask_token() {
        assert_eq!(candidate_indices(4, true), vec![1, 2, 3]);
        assert_eq!(candidate_indices(4, false), vec![0]);
        assert_eq!(candidate_indices(1, true), vec![0]);
    }

    #[test]
    fn conv_transpose_scatters_each_cell_into_a_2x2_block() {
        let mut store = WeightStore::new();
        // c_in = 1, c_out = 2, kernel values encode (c, dy, dx)
        let kernel = store.insert(
            "kernel",
            ArrayD::from_shape_vec(IxDyn(&[1, 2, 2, 2]), vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0])
                .unwrap(),
        );
        let bias = store.insert("bias", ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.5, -0.5]).unwrap());
        let input = [1.0f32, 2.0];

        let mut graph = Graph::new(Mode::Compute);
        let x = graph.external(&input, &[1, 2, 1]).unwrap();
        let y = conv_transpose_2x2(&mut graph, &store, x, kernel, bias).unwrap();
        assert_eq!(graph.shape(y), &[2, 4, 2]);
        graph.mark_output(y);

        let plan = crate::graph::allocator::plan(&graph, None).unwrap();
        let mut arena = vec![0.0; plan.peak];
        crate::graph::executor::execute(&mut graph, &plan, &mut arena).unwrap();
        let out = crate::graph::executor::read_outputs(&graph, &plan, &arena)
            .unwrap()
            .remove(0)
            .into_dimensionality::<Ix3>()
            .unwrap();

        // output pixel (dy, 2 * x + dx) channel c = input[x] * kernel[c, dy, dx] + bias[c]
        assert_eq!(out[[0, 0, 0]], 1.0 * 1.0 + 0.5);
        assert_eq!(out[[1, 1, 1]], 1.0 * 40.0 - 0.5);
        assert_eq!(out[[0, 3, 0]], 2.0 * 2.0 + 0.5);
        assert_eq!(out[[1, 2, 1]], 2.0 * 30.0 - 0.5);
    }
}
