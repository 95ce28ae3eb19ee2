use super::{Graph, Mode, Op, TensorId};
use anyhow::{ensure, Context, Result};
use ndarray::ArrayD;

impl<'a> Graph<'a> {
    /// Arena tensor filled by `fill` right before execution. The closure is
    /// dropped unevaluated when the graph is only measured.
    pub fn input(
        &mut self,
        shape: &[usize],
        fill: impl FnOnce(&mut [f32]) + Send + 'a,
    ) -> TensorId {
        let fill = match self.mode {
            Mode::Measure => None,
            Mode::Compute => Some(Box::new(fill) as super::Fill<'a>),
        };
        self.push(Op::Input(fill), shape.to_vec())
    }

    pub fn external(&mut self, data: &'a [f32], shape: &[usize]) -> Result<TensorId> {
        ensure!(
            data.len() == shape.iter().product::<usize>(),
            "external tensor holds {} values, shape {:?} needs {}",
            data.len(),
            shape,
            shape.iter().product::<usize>()
        );
        Ok(self.push(Op::External(data), shape.to_vec()))
    }

    pub fn weight(&mut self, tensor: &'a ArrayD<f32>) -> Result<TensorId> {
        let data = tensor
            .as_slice()
            .context("weight tensor is not contiguous")?;
        self.external(data, tensor.shape())
    }

    pub fn reshape(&mut self, src: TensorId, shape: &[usize]) -> Result<TensorId> {
        let from = self.shape(src);
        ensure!(
            from.iter().product::<usize>() == shape.iter().product::<usize>(),
            "cannot reshape {from:?} into {shape:?}"
        );
        Ok(self.push(Op::Reshape(src), shape.to_vec()))
    }

    /// Output axis `i` is input axis `axes[i]`.
    pub fn permute(&mut self, src: TensorId, axes: &[usize]) -> Result<TensorId> {
        let from = self.shape(src).to_vec();
        let mut seen = vec![false; from.len()];
        ensure!(
            axes.len() == from.len()
                && axes
                    .iter()
                    .all(|&a| a < from.len() && !std::mem::replace(&mut seen[a], true)),
            "{axes:?} is not a permutation of the axes of {from:?}"
        );
        let shape = axes.iter().map(|&a| from[a]).collect();
        Ok(self.push(Op::Permute(src, axes.to_vec()), shape))
    }

    /// Batched `lhs[.., m, k] x rhs[.., k, n]`, or `rhs[.., n, k]` transposed.
    /// The batch of `rhs` equals that of `lhs` or is a single matrix.
    pub fn matmul(&mut self, lhs: TensorId, rhs: TensorId, transpose_rhs: bool) -> Result<TensorId> {
        let a = self.shape(lhs).to_vec();
        let b = self.shape(rhs).to_vec();
        ensure!(
            a.len() >= 2 && b.len() >= 2,
            "mul_mat needs matrices, got {a:?} and {b:?}"
        );

        let (m, k) = (a[a.len() - 2], a[a.len() - 1]);
        let (kb, n) = if transpose_rhs {
            (b[b.len() - 1], b[b.len() - 2])
        } else {
            (b[b.len() - 2], b[b.len() - 1])
        };
        ensure!(k == kb, "mul_mat inner dimensions differ: {a:?} x {b:?} (transpose {transpose_rhs})");

        let batch_a: usize = a[..a.len() - 2].iter().product();
        let batch_b: usize = b[..b.len() - 2].iter().product();
        ensure!(
            batch_b == 1 || batch_b == batch_a,
            "mul_mat batch {batch_b} of {b:?} does not match {batch_a} of {a:?}"
        );

        let mut shape = a[..a.len() - 2].to_vec();
        shape.extend([m, n]);
        Ok(self.push(
            Op::MatMul {
                lhs,
                rhs,
                transpose_rhs,
            },
            shape,
        ))
    }

    pub fn add(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId> {
        let a = self.shape(lhs).to_vec();
        let b = self.shape(rhs);
        ensure!(
            b.len() <= a.len() && a.ends_with(b),
            "cannot broadcast {b:?} onto {a:?}"
        );
        Ok(self.push(Op::Add(lhs, rhs), a))
    }

    pub fn scale(&mut self, src: TensorId, factor: f32) -> TensorId {
        let shape = self.shape(src).to_vec();
        self.push(Op::Scale(src, factor), shape)
    }

    pub fn softmax(&mut self, src: TensorId) -> TensorId {
        let shape = self.shape(src).to_vec();
        self.push(Op::Softmax(src), shape)
    }

    /// Normalizes over the last axis, then applies `weight` and `bias`.
    pub fn layer_norm(
        &mut self,
        src: TensorId,
        weight: TensorId,
        bias: TensorId,
        eps: f32,
    ) -> Result<TensorId> {
        let shape = self.shape(src).to_vec();
        let channels = *shape.last().context("norm of a scalar")?;
        ensure!(
            self.shape(weight) == [channels] && self.shape(bias) == [channels],
            "norm over {channels} channels got weight {:?} and bias {:?}",
            self.shape(weight),
            self.shape(bias)
        );
        Ok(self.push(
            Op::LayerNorm {
                src,
                weight,
                bias,
                eps,
            },
            shape,
        ))
    }

    pub fn gelu(&mut self, src: TensorId) -> TensorId {
        let shape = self.shape(src).to_vec();
        self.push(Op::Gelu(src), shape)
    }

    pub fn relu(&mut self, src: TensorId) -> TensorId {
        let shape = self.shape(src).to_vec();
        self.push(Op::Relu(src), shape)
    }

    /// `[H, W, C]` into `[Ho * Wo, C * kh * kw]` patches, ordered `(c, ky, kx)`
    /// to match a `[out, in, kh, kw]` convolution kernel.
    pub fn im2col(
        &mut self,
        src: TensorId,
        kernel: (usize, usize),
        stride: usize,
        padding: usize,
    ) -> Result<TensorId> {
        let shape = self.shape(src).to_vec();
        ensure!(shape.len() == 3, "im2col expects [H, W, C], got {shape:?}");
        ensure!(stride > 0, "im2col stride must be positive");
        let (h, w, c) = (shape[0] + 2 * padding, shape[1] + 2 * padding, shape[2]);
        ensure!(
            h >= kernel.0 && w >= kernel.1,
            "kernel {kernel:?} larger than padded input {h}x{w}"
        );
        let out_h = (h - kernel.0) / stride + 1;
        let out_w = (w - kernel.1) / stride + 1;
        Ok(self.push(
            Op::Im2Col {
                src,
                kernel,
                stride,
                padding,
            },
            vec![out_h * out_w, c * kernel.0 * kernel.1],
        ))
    }

    /// Linear layer: `x[.., in] x weight[out, in]^T + bias[out]`.
    pub fn linear(&mut self, x: TensorId, weight: TensorId, bias: TensorId) -> Result<TensorId> {
        let out = self.matmul(x, weight, true)?;
        self.add(out, bias)
    }

    /// `[H, W, C]` into zero-padded `[n_windows, window, window, C]`.
    pub fn win_part(&mut self, src: TensorId, window: usize) -> Result<TensorId> {
        let shape = self.shape(src).to_vec();
        ensure!(shape.len() == 3, "win_part expects [H, W, C], got {shape:?}");
        ensure!(window > 0, "window size must be positive");
        let n_windows = shape[0].div_ceil(window) * shape[1].div_ceil(window);
        Ok(self.push(
            Op::WinPart { src, window },
            vec![n_windows, window, window, shape[2]],
        ))
    }

    /// Inverse of [`Graph::win_part`], cropping the padding back to `height x width`.
    pub fn win_unpart(
        &mut self,
        src: TensorId,
        window: usize,
        height: usize,
        width: usize,
    ) -> Result<TensorId> {
        let shape = self.shape(src).to_vec();
        ensure!(
            shape.len() == 4 && shape[1] == window && shape[2] == window,
            "win_unpart expects [n, {window}, {window}, C], got {shape:?}"
        );
        let n_windows = height.div_ceil(window) * width.div_ceil(window);
        ensure!(
            shape[0] == n_windows,
            "{} windows cannot cover {height}x{width}, need {n_windows}",
            shape[0]
        );
        Ok(self.push(Op::WinUnpart { src, window }, vec![height, width, shape[3]]))
    }

    /// Expands a `[2 * size - 1, C]` table into `[size, size, C]` indexed by
    /// `(query, key)` offset.
    pub fn get_rel_pos(&mut self, table: TensorId, size: usize) -> Result<TensorId> {
        let shape = self.shape(table).to_vec();
        ensure!(
            size > 0 && shape.len() == 2 && shape[0] == 2 * size - 1,
            "relative position table {shape:?} does not fit size {size}"
        );
        Ok(self.push(Op::GetRelPos { table, size }, vec![size, size, shape[1]]))
    }

    /// `attn[B, h * w, kh * kw] += rel_h[B, h, w, kh] + rel_w[B, h, w, kw]`.
    pub fn add_rel_pos(&mut self, attn: TensorId, rel_h: TensorId, rel_w: TensorId) -> Result<TensorId> {
        let a = self.shape(attn).to_vec();
        let rh = self.shape(rel_h);
        let rw = self.shape(rel_w);
        ensure!(
            rh.len() == 4 && rw.len() == 4 && rh[..3] == rw[..3],
            "relative position terms {rh:?} and {rw:?} disagree"
        );
        ensure!(
            a == [rh[0], rh[1] * rh[2], rh[3] * rw[3]],
            "attention {a:?} does not match relative position terms {rh:?} and {rw:?}"
        );
        Ok(self.push(Op::AddRelPos { attn, rel_h, rel_w }, a))
    }

    pub fn concat(&mut self, parts: &[TensorId], axis: usize) -> Result<TensorId> {
        let first = self
            .shape(*parts.first().context("concat of nothing")?)
            .to_vec();
        ensure!(axis < first.len(), "concat axis {axis} out of range for {first:?}");

        let mut shape = first.clone();
        shape[axis] = 0;
        for &part in parts {
            let s = self.shape(part);
            ensure!(
                s.len() == first.len()
                    && s.iter()
                        .zip(&first)
                        .enumerate()
                        .all(|(i, (a, b))| i == axis || a == b),
                "cannot concat {s:?} with {first:?} along axis {axis}"
            );
            shape[axis] += s[axis];
        }
        Ok(self.push(
            Op::Concat {
                parts: parts.to_vec(),
                axis,
            },
            shape,
        ))
    }

    pub fn slice(&mut self, src: TensorId, axis: usize, start: usize, len: usize) -> Result<TensorId> {
        let mut shape = self.shape(src).to_vec();
        ensure!(
            axis < shape.len() && start + len <= shape[axis],
            "slice {start}..{} along axis {axis} out of range for {shape:?}",
            start + len
        );
        shape[axis] = len;
        Ok(self.push(Op::Slice { src, axis, start }, shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_errors_are_reported() {
        let mut graph = Graph::new(Mode::Measure);
        let a = graph.input(&[2, 3], |_| {});
        let b = graph.input(&[4, 3], |_| {});

        assert!(graph.matmul(a, b, false).is_err());
        let product = graph.matmul(a, b, true).unwrap();
        assert_eq!(graph.shape(product), &[2, 4]);
        assert!(graph.add(a, b).is_err());
        assert!(graph.reshape(a, &[5]).is_err());
        assert!(graph.permute(a, &[0, 0]).is_err());
        assert!(graph.slice(a, 1, 2, 2).is_err());
        assert!(graph.concat(&[a, b], 1).is_err());
        let joined = graph.concat(&[a, b], 0).unwrap();
        assert_eq!(graph.shape(joined), &[6, 3]);
    }

    #[test]
    fn windowing_shapes_include_padding() {
        let mut graph = Graph::new(Mode::Measure);
        let x = graph.input(&[5, 4, 8], |_| {});
        let parts = graph.win_part(x, 3).unwrap();
        assert_eq!(graph.shape(parts), &[4, 3, 3, 8]);
        let back = graph.win_unpart(parts, 3, 5, 4).unwrap();
        assert_eq!(graph.shape(back), &[5, 4, 8]);
        assert!(graph.win_unpart(parts, 3, 7, 7).is_err());
    }

    #[test]
    fn measure_mode_never_runs_input_closures() {
        let mut graph = Graph::new(Mode::Measure);
        graph.input(&[4], |_| panic!("input evaluated while measuring"));
        assert!(matches!(graph.nodes[0].op, Op::Input(None)));
    }
}
