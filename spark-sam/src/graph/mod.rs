//! Static tensor graphs with planned arena memory.
//!
//! A graph is built twice from the same closure: once in [`Mode::Measure`] to
//! find the peak arena size, then in [`Mode::Compute`] against a buffer of
//! exactly that size. All tensors are contiguous, row-major f32 with the
//! channel axis last.

pub(crate) mod allocator;
pub(crate) mod executor;
pub(crate) mod kernels;
mod ops;
pub(crate) mod planner;

pub use planner::ScratchBuffer;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(usize);

impl TensorId {
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Shapes only; input data is never produced.
    Measure,
    Compute,
}

pub(crate) type Fill<'a> = Box<dyn FnOnce(&mut [f32]) + Send + 'a>;

pub(crate) enum Op<'a> {
    /// Arena tensor filled by a host closure; `None` in measure mode.
    Input(Option<Fill<'a>>),
    /// Read-only data owned outside the arena (weights, cached embeddings).
    External(&'a [f32]),
    /// Same storage as the source, new shape.
    Reshape(TensorId),
    Permute(TensorId, Vec<usize>),
    MatMul {
        lhs: TensorId,
        rhs: TensorId,
        transpose_rhs: bool,
    },
    /// `rhs` broadcasts over the leading axes of `lhs`.
    Add(TensorId, TensorId),
    Scale(TensorId, f32),
    Softmax(TensorId),
    LayerNorm {
        src: TensorId,
        weight: TensorId,
        bias: TensorId,
        eps: f32,
    },
    Gelu(TensorId),
    Relu(TensorId),
    Im2Col {
        src: TensorId,
        kernel: (usize, usize),
        stride: usize,
        padding: usize,
    },
    WinPart {
        src: TensorId,
        window: usize,
    },
    WinUnpart {
        src: TensorId,
        window: usize,
    },
    GetRelPos {
        table: TensorId,
        size: usize,
    },
    AddRelPos {
        attn: TensorId,
        rel_h: TensorId,
        rel_w: TensorId,
    },
    Concat {
        parts: Vec<TensorId>,
        axis: usize,
    },
    Slice {
        src: TensorId,
        axis: usize,
        start: usize,
    },
}

impl Op<'_> {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Op::Input(_) => "input",
            Op::External(_) => "external",
            Op::Reshape(_) => "reshape",
            Op::Permute(..) => "permute",
            Op::MatMul { .. } => "mul_mat",
            Op::Add(..) => "add",
            Op::Scale(..) => "scale",
            Op::Softmax(_) => "soft_max",
            Op::LayerNorm { .. } => "norm",
            Op::Gelu(_) => "gelu",
            Op::Relu(_) => "relu",
            Op::Im2Col { .. } => "im2col",
            Op::WinPart { .. } => "win_part",
            Op::WinUnpart { .. } => "win_unpart",
            Op::GetRelPos { .. } => "get_rel_pos",
            Op::AddRelPos { .. } => "add_rel_pos",
            Op::Concat { .. } => "concat",
            Op::Slice { .. } => "slice",
        }
    }

    /// Tensors read by this op, in operand order.
    pub(crate) fn inputs(&self) -> Vec<TensorId> {
        match self {
            Op::Input(_) | Op::External(_) => Vec::new(),
            Op::Reshape(src)
            | Op::Permute(src, _)
            | Op::Scale(src, _)
            | Op::Softmax(src)
            | Op::Gelu(src)
            | Op::Relu(src)
            | Op::Im2Col { src, .. }
            | Op::WinPart { src, .. }
            | Op::WinUnpart { src, .. }
            | Op::Slice { src, .. } => vec![*src],
            Op::GetRelPos { table, .. } => vec![*table],
            Op::MatMul { lhs, rhs, .. } => vec![*lhs, *rhs],
            Op::Add(lhs, rhs) => vec![*lhs, *rhs],
            Op::LayerNorm {
                src, weight, bias, ..
            } => vec![*src, *weight, *bias],
            Op::AddRelPos { attn, rel_h, rel_w } => vec![*attn, *rel_h, *rel_w],
            Op::Concat { parts, .. } => parts.clone(),
        }
    }

    /// Ops whose kernel updates the first operand's values elementwise or row
    /// by row, so the result may take over that operand's storage.
    pub(crate) fn can_run_in_place(&self) -> bool {
        matches!(
            self,
            Op::Add(..)
                | Op::Scale(..)
                | Op::Softmax(_)
                | Op::LayerNorm { .. }
                | Op::Gelu(_)
                | Op::Relu(_)
                | Op::AddRelPos { .. }
        )
    }
}

pub(crate) struct Node<'a> {
    pub(crate) op: Op<'a>,
    pub(crate) shape: Vec<usize>,
}

impl Node<'_> {
    pub(crate) fn len(&self) -> usize {
        self.shape.iter().product()
    }
}

pub struct Graph<'a> {
    mode: Mode,
    pub(crate) nodes: Vec<Node<'a>>,
    outputs: Vec<TensorId>,
}

impl<'a> Graph<'a> {
    pub fn new(mode: Mode) -> Self {
        Graph {
            mode,
            nodes: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn shape(&self, id: TensorId) -> &[usize] {
        &self.nodes[id.0].shape
    }

    pub fn mark_output(&mut self, id: TensorId) {
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Storage owner of `id`: reshapes are followed back to their source.
    pub(crate) fn root(&self, mut id: TensorId) -> TensorId {
        while let Op::Reshape(src) = self.nodes[id.0].op {
            id = src;
        }
        id
    }

    /// Op names and shapes, used to check that two builds describe the same graph.
    pub fn signature(&self) -> Vec<(&'static str, Vec<usize>)> {
        self.nodes
            .iter()
            .map(|node| (node.op.name(), node.shape.clone()))
            .collect()
    }

    pub(crate) fn push(&mut self, op: Op<'a>, shape: Vec<usize>) -> TensorId {
        self.nodes.push(Node { op, shape });
        TensorId(self.nodes.len() - 1)
    }
}
