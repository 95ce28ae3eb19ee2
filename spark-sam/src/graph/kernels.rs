//! CPU kernels over contiguous f32 slices. Shapes are validated when the graph
//! is built; the kernels only assert what they index.

use anyhow::{Context, Result};
use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewD, ArrayViewMut2, ArrayViewMutD, IxDyn, Zip};
use rayon::prelude::*;

/// `out += rhs`, where `rhs` repeats over the leading elements of `out`.
pub(crate) fn add_assign(out: &mut [f32], rhs: &[f32]) {
    if rhs.len() == out.len() {
        out.par_iter_mut().zip(rhs.par_iter()).for_each(|(o, r)| *o += r);
    } else {
        out.par_chunks_mut(rhs.len()).for_each(|chunk| {
            chunk.iter_mut().zip(rhs).for_each(|(o, r)| *o += r);
        });
    }
}

pub(crate) fn scale(out: &mut [f32], factor: f32) {
    out.par_iter_mut().for_each(|v| *v *= factor);
}

pub(crate) fn softmax_rows(out: &mut [f32], row: usize) {
    out.par_chunks_mut(row).for_each(|values| {
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in values.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        let inv = 1.0 / sum;
        values.iter_mut().for_each(|v| *v *= inv);
    });
}

pub(crate) fn layer_norm_rows(out: &mut [f32], weight: &[f32], bias: &[f32], eps: f32) {
    let n = weight.len();
    out.par_chunks_mut(n).for_each(|values| {
        let mean = values.iter().sum::<f32>() / n as f32;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
        let inv_std = 1.0 / (var + eps).sqrt();
        for ((v, w), b) in values.iter_mut().zip(weight).zip(bias) {
            *v = (*v - mean) * inv_std * w + b;
        }
    });
}

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEF_A: f32 = 0.044_715;

/// Tanh approximation of GELU.
pub(crate) fn gelu(out: &mut [f32]) {
    out.par_iter_mut().for_each(|v| {
        let x = *v;
        *v = 0.5 * x * (1.0 + (SQRT_2_OVER_PI * x * (1.0 + GELU_COEF_A * x * x)).tanh());
    });
}

pub(crate) fn relu(out: &mut [f32]) {
    out.par_iter_mut().for_each(|v| *v = v.max(0.0));
}

/// Batched GEMM. `lhs` is `[batch, m, k]`; `rhs` holds one matrix or one per
/// batch, `[k, n]` or `[n, k]` when `transpose_rhs`.
pub(crate) fn matmul(
    lhs: &[f32],
    rhs: &[f32],
    out: &mut [f32],
    (m, k, n): (usize, usize, usize),
    transpose_rhs: bool,
) -> Result<()> {
    let rhs_batched = rhs.len() != k * n;
    out.par_chunks_mut(m * n)
        .enumerate()
        .try_for_each(|(batch, out)| -> Result<()> {
            let a = ArrayView2::from_shape((m, k), &lhs[batch * m * k..(batch + 1) * m * k])?;
            let b = if rhs_batched {
                &rhs[batch * k * n..(batch + 1) * k * n]
            } else {
                rhs
            };
            let b = if transpose_rhs {
                ArrayView2::from_shape((n, k), b)?.reversed_axes()
            } else {
                ArrayView2::from_shape((k, n), b)?
            };
            let mut c = ArrayViewMut2::from_shape((m, n), out)?;
            general_mat_mul(1.0, &a, &b, 0.0, &mut c);
            Ok(())
        })
}

pub(crate) fn permute(src: &[f32], shape: &[usize], axes: &[usize], out: &mut [f32]) -> Result<()> {
    let src = ArrayViewD::from_shape(IxDyn(shape), src)?.permuted_axes(IxDyn(axes));
    let mut out = ArrayViewMutD::from_shape(IxDyn(src.shape()), out)?;
    Zip::from(&mut out).and(&src).par_for_each(|o, &s| *o = s);
    Ok(())
}

pub(crate) fn im2col(
    src: &[f32],
    (h, w, c): (usize, usize, usize),
    (kh, kw): (usize, usize),
    stride: usize,
    padding: usize,
    out: &mut [f32],
) {
    let out_w = (w + 2 * padding - kw) / stride + 1;
    out.par_chunks_mut(c * kh * kw)
        .enumerate()
        .for_each(|(index, row)| {
            let (oy, ox) = (index / out_w, index % out_w);
            for ci in 0..c {
                for ky in 0..kh {
                    for kx in 0..kw {
                        let y = (oy * stride + ky) as isize - padding as isize;
                        let x = (ox * stride + kx) as isize - padding as isize;
                        row[(ci * kh + ky) * kw + kx] =
                            if y < 0 || x < 0 || y >= h as isize || x >= w as isize {
                                0.0
                            } else {
                                src[(y as usize * w + x as usize) * c + ci]
                            };
                    }
                }
            }
        });
}

pub(crate) fn win_part(src: &[f32], (h, w, c): (usize, usize, usize), window: usize, out: &mut [f32]) {
    let n_wx = w.div_ceil(window);
    out.par_chunks_mut(window * window * c)
        .enumerate()
        .for_each(|(index, patch)| {
            let (wy, wx) = (index / n_wx, index % n_wx);
            for py in 0..window {
                for px in 0..window {
                    let (y, x) = (wy * window + py, wx * window + px);
                    let dst = &mut patch[(py * window + px) * c..(py * window + px + 1) * c];
                    if y < h && x < w {
                        dst.copy_from_slice(&src[(y * w + x) * c..(y * w + x + 1) * c]);
                    } else {
                        dst.fill(0.0);
                    }
                }
            }
        });
}

pub(crate) fn win_unpart(src: &[f32], (h, w, c): (usize, usize, usize), window: usize, out: &mut [f32]) {
    let n_wx = w.div_ceil(window);
    out[..h * w * c]
        .par_chunks_mut(w * c)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..w {
                let patch = (y / window) * n_wx + x / window;
                let at = ((patch * window + y % window) * window + x % window) * c;
                row[x * c..(x + 1) * c].copy_from_slice(&src[at..at + c]);
            }
        });
}

/// `out[q, k] = table[q - k + size - 1]`.
pub(crate) fn get_rel_pos(table: &[f32], size: usize, channels: usize, out: &mut [f32]) {
    out.par_chunks_mut(channels)
        .enumerate()
        .for_each(|(index, dst)| {
            let (q, k) = (index / size, index % size);
            let at = (q + size - 1 - k) * channels;
            dst.copy_from_slice(&table[at..at + channels]);
        });
}

/// Rows of `out` are `(batch, qy, qx)`, columns `(ky, kx)`.
pub(crate) fn add_rel_pos(out: &mut [f32], rel_h: &[f32], rel_w: &[f32], kh: usize, kw: usize) {
    out.par_chunks_mut(kh * kw)
        .enumerate()
        .for_each(|(row, attn)| {
            let rh = &rel_h[row * kh..(row + 1) * kh];
            let rw = &rel_w[row * kw..(row + 1) * kw];
            for (ky, h) in rh.iter().enumerate() {
                for (kx, w) in rw.iter().enumerate() {
                    attn[ky * kw + kx] += h + w;
                }
            }
        });
}

/// Joins `parts` along `axis`; `inner` is the per-part extent from `axis` on.
pub(crate) fn concat(parts: &[(&[f32], usize)], outer: usize, out: &mut [f32]) {
    let row: usize = parts.iter().map(|(_, inner)| inner).sum();
    out.par_chunks_mut(row).take(outer).enumerate().for_each(|(o, dst)| {
        let mut at = 0;
        for (src, inner) in parts {
            dst[at..at + inner].copy_from_slice(&src[o * inner..(o + 1) * inner]);
            at += inner;
        }
    });
}

pub(crate) fn slice(
    src: &[f32],
    shape: &[usize],
    axis: usize,
    start: usize,
    len: usize,
    out: &mut [f32],
) -> Result<()> {
    let extent = *shape.get(axis).context("slice axis out of range")?;
    let inner: usize = shape[axis + 1..].iter().product();
    out.par_chunks_mut(len * inner)
        .enumerate()
        .for_each(|(o, dst)| {
            let at = (o * extent + start) * inner;
            dst.copy_from_slice(&src[at..at + len * inner]);
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-4)
    }

    #[test]
    fn matmul_matches_naive() {
        let (batch, m, k, n) = (3, 4, 5, 6);
        let lhs = random(batch * m * k, 1);
        let rhs = random(batch * n * k, 2);
        let mut out = vec![0.0; batch * m * n];
        matmul(&lhs, &rhs, &mut out, (m, k, n), true).unwrap();

        let mut expected = vec![0.0; batch * m * n];
        for b in 0..batch {
            for i in 0..m {
                for j in 0..n {
                    expected[(b * m + i) * n + j] = (0..k)
                        .map(|p| lhs[(b * m + i) * k + p] * rhs[(b * n + j) * k + p])
                        .sum();
                }
            }
        }
        assert!(close(&out, &expected));
    }

    #[test]
    fn matmul_broadcasts_single_rhs() {
        let lhs = random(2 * 3 * 4, 3);
        let rhs = random(4 * 5, 4);
        let mut out = vec![0.0; 2 * 3 * 5];
        matmul(&lhs, &rhs, &mut out, (3, 4, 5), false).unwrap();

        let b = Array2::from_shape_vec((4, 5), rhs).unwrap();
        for batch in 0..2 {
            let a = Array2::from_shape_vec((3, 4), lhs[batch * 12..(batch + 1) * 12].to_vec()).unwrap();
            assert!(close(&out[batch * 15..(batch + 1) * 15], a.dot(&b).as_slice().unwrap()));
        }
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut values = vec![1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0];
        softmax_rows(&mut values, 3);
        assert!((values[..3].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(values[2] > values[1] && values[1] > values[0]);
        assert!(close(&values[3..], &[1.0 / 3.0; 3]));
    }

    #[test]
    fn layer_norm_normalizes_each_row() {
        let mut values = vec![1.0, 2.0, 3.0, 4.0, -5.0, 5.0, -5.0, 5.0];
        layer_norm_rows(&mut values, &[1.0; 4], &[0.5; 4], 1e-6);
        for row in values.chunks(4) {
            let mean = row.iter().sum::<f32>() / 4.0;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!((mean - 0.5).abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn gelu_reference_points() {
        let mut values = vec![0.0, 1.0, -1.0, 10.0];
        gelu(&mut values);
        assert!(close(&values, &[0.0, 0.841_192, -0.158_808, 10.0]));
    }

    #[test]
    fn im2col_convolution_matches_direct() {
        let (h, w, c, co) = (5, 4, 2, 3);
        let src = random(h * w * c, 5);
        let kernel = random(co * c * 9, 6);

        let mut cols = vec![0.0; h * w * c * 9];
        im2col(&src, (h, w, c), (3, 3), 1, 1, &mut cols);
        let mut out = vec![0.0; h * w * co];
        matmul(&cols, &kernel, &mut out, (h * w, c * 9, co), true).unwrap();

        let input = Array3::from_shape_vec((h, w, c), src).unwrap();
        for y in 0..h {
            for x in 0..w {
                for o in 0..co {
                    let mut acc = 0.0;
                    for ci in 0..c {
                        for ky in 0..3 {
                            for kx in 0..3 {
                                let (sy, sx) = (y as isize + ky as isize - 1, x as isize + kx as isize - 1);
                                if sy < 0 || sx < 0 || sy >= h as isize || sx >= w as isize {
                                    continue;
                                }
                                acc += input[[sy as usize, sx as usize, ci]]
                                    * kernel[((o * c + ci) * 3 + ky) * 3 + kx];
                            }
                        }
                    }
                    assert!((out[(y * w + x) * co + o] - acc).abs() < 1e-4);
                }
            }
        }
    }

    #[test]
    fn window_partition_round_trips_with_zero_padding() {
        let (h, w, c, window) = (5, 7, 3, 3);
        let src = random(h * w * c, 7);
        let n_windows = h.div_ceil(window) * w.div_ceil(window);

        let mut parts = vec![f32::NAN; n_windows * window * window * c];
        win_part(&src, (h, w, c), window, &mut parts);
        // bottom right window only holds pixel (3..5, 6)
        let last = &parts[(n_windows - 1) * window * window * c..];
        assert_eq!(&last[..c], &src[(3 * w + 6) * c..(3 * w + 7) * c]);
        assert!(last[c..2 * c].iter().all(|&v| v == 0.0));

        let mut back = vec![0.0; h * w * c];
        win_unpart(&parts, (h, w, c), window, &mut back);
        assert_eq!(back, src);
    }

    #[test]
    fn relative_positions_index_by_offset() {
        let (size, channels) = (3, 2);
        let table: Vec<f32> = (0..(2 * size - 1) * channels).map(|v| v as f32).collect();
        let mut out = vec![0.0; size * size * channels];
        get_rel_pos(&table, size, channels, &mut out);

        // q = 2, k = 0 sits at offset 4; q = 0, k = 2 at offset 0
        assert_eq!(&out[(2 * size) * channels..(2 * size + 1) * channels], &[8.0, 9.0]);
        assert_eq!(&out[2 * channels..3 * channels], &[0.0, 1.0]);
        // the diagonal is offset size - 1
        assert_eq!(&out[(size + 1) * channels..(size + 2) * channels], &[4.0, 5.0]);
    }

    #[test]
    fn rel_pos_terms_add_per_key_cell() {
        let (kh, kw) = (2, 3);
        let mut attn = vec![0.0; 2 * kh * kw];
        let rel_h = vec![1.0, 2.0, 10.0, 20.0];
        let rel_w = vec![0.1, 0.2, 0.3, 0.0, 0.0, 0.0];
        add_rel_pos(&mut attn, &rel_h, &rel_w, kh, kw);
        assert!(close(&attn[..6], &[1.1, 1.2, 1.3, 2.1, 2.2, 2.3]));
        assert!(close(&attn[6..], &[10.0, 10.0, 10.0, 20.0, 20.0, 20.0]));
    }

    #[test]
    fn permute_concat_and_slice() {
        let src: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let mut t = vec![0.0; 6];
        permute(&src, &[2, 3], &[1, 0], &mut t).unwrap();
        assert_eq!(t, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);

        let other = vec![9.0, 9.0];
        let mut joined = vec![0.0; 8];
        concat(&[(src.as_slice(), 3), (other.as_slice(), 1)], 2, &mut joined);
        assert_eq!(joined, vec![0.0, 1.0, 2.0, 9.0, 3.0, 4.0, 5.0, 9.0]);

        let mut column = vec![0.0; 2];
        slice(&src, &[2, 3], 1, 1, 1, &mut column).unwrap();
        assert_eq!(column, vec![1.0, 4.0]);
    }
}
