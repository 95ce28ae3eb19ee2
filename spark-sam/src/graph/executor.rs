use super::allocator::{Location, Plan};
use super::{kernels, Graph, Op, TensorId};
use crate::utils::ptr_wrapper::SafeVecPtr;
use anyhow::{bail, ensure, Context, Result};
use ndarray::{ArrayD, IxDyn};

/// Runs every node in order against `arena`. Must be called inside the
/// worker pool that should carry the kernels.
pub(crate) fn execute(graph: &mut Graph<'_>, plan: &Plan, arena: &mut [f32]) -> Result<()> {
    ensure!(
        arena.len() >= plan.peak && plan.locations.len() == graph.nodes.len(),
        "plan for {} nodes and {} slots does not fit graph of {} nodes and arena of {} slots",
        plan.locations.len(),
        plan.peak,
        graph.nodes.len(),
        arena.len()
    );
    let base = SafeVecPtr::new(arena.as_mut_ptr());

    for index in 0..graph.nodes.len() {
        let id = TensorId(index);
        let len = graph.nodes[index].len();
        if let Op::Input(fill) = &mut graph.nodes[index].op {
            let fill = fill
                .take()
                .context("input tensor has no data, was the graph built for measuring?")?;
            // SAFETY: the planner gave this node its own live range in the arena.
            let out = unsafe { output(plan, base, id, len)? };
            fill(out);
            continue;
        }

        // SAFETY: the planner never overlaps a node's output with the storage of
        // an operand that is still read, except for the first operand of an
        // in-place node, which is then never borrowed separately.
        unsafe { run_node(graph, plan, base, id) }
            .with_context(|| format!("node {index} ({})", graph.nodes[index].op.name()))?;
    }

    Ok(())
}

unsafe fn output<'t>(plan: &Plan, base: SafeVecPtr<f32>, id: TensorId, len: usize) -> Result<&'t mut [f32]> {
    match plan.location(id) {
        Location::Arena(offset) => Ok(base.slice_mut(offset, len)),
        Location::External => bail!("node {} has no arena storage", id.index()),
    }
}

unsafe fn tensor<'t>(
    graph: &'t Graph<'_>,
    plan: &Plan,
    base: SafeVecPtr<f32>,
    id: TensorId,
) -> Result<&'t [f32]> {
    let len = graph.nodes[id.index()].len();
    match (&graph.nodes[graph.root(id).index()].op, plan.location(id)) {
        (Op::External(data), _) => Ok(*data),
        (_, Location::Arena(offset)) => Ok(base.slice(offset, len)),
        (_, Location::External) => bail!("node {} has no storage", id.index()),
    }
}

/// Output of an in-place capable op, holding a copy of its first operand
/// unless the planner already placed it there.
unsafe fn seeded<'t>(
    graph: &Graph<'_>,
    plan: &Plan,
    base: SafeVecPtr<f32>,
    id: TensorId,
) -> Result<&'t mut [f32]> {
    let node = &graph.nodes[id.index()];
    let out = output(plan, base, id, node.len())?;
    if !plan.in_place[id.index()] {
        let first = *node.op.inputs().first().context("op without operands")?;
        out.copy_from_slice(tensor(graph, plan, base, first)?);
    }
    Ok(out)
}

unsafe fn run_node(graph: &Graph<'_>, plan: &Plan, base: SafeVecPtr<f32>, id: TensorId) -> Result<()> {
    let node = &graph.nodes[id.index()];
    let shape = move |t: TensorId| graph.nodes[t.index()].shape.as_slice();
    let read = move |t: TensorId| tensor(graph, plan, base, t);
    let seed = move || seeded(graph, plan, base, id);

    match &node.op {
        Op::Input(_) | Op::External(_) | Op::Reshape(_) => {}
        Op::Permute(src, axes) => {
            kernels::permute(read(*src)?, shape(*src), axes, output(plan, base, id, node.len())?)?
        }
        Op::MatMul {
            lhs,
            rhs,
            transpose_rhs,
        } => {
            let a = shape(*lhs);
            let (m, k) = (a[a.len() - 2], a[a.len() - 1]);
            let n = node.shape[node.shape.len() - 1];
            kernels::matmul(
                read(*lhs)?,
                read(*rhs)?,
                output(plan, base, id, node.len())?,
                (m, k, n),
                *transpose_rhs,
            )?;
        }
        Op::Add(_, rhs) => kernels::add_assign(seed()?, read(*rhs)?),
        Op::Scale(_, factor) => kernels::scale(seed()?, *factor),
        Op::Softmax(_) => {
            let row = *node.shape.last().context("soft_max of a scalar")?;
            kernels::softmax_rows(seed()?, row);
        }
        Op::LayerNorm {
            weight, bias, eps, ..
        } => kernels::layer_norm_rows(seed()?, read(*weight)?, read(*bias)?, *eps),
        Op::Gelu(_) => kernels::gelu(seed()?),
        Op::Relu(_) => kernels::relu(seed()?),
        Op::Im2Col {
            src,
            kernel,
            stride,
            padding,
        } => {
            let s = shape(*src);
            kernels::im2col(
                read(*src)?,
                (s[0], s[1], s[2]),
                *kernel,
                *stride,
                *padding,
                output(plan, base, id, node.len())?,
            );
        }
        Op::WinPart { src, window } => {
            let s = shape(*src);
            kernels::win_part(
                read(*src)?,
                (s[0], s[1], s[2]),
                *window,
                output(plan, base, id, node.len())?,
            );
        }
        Op::WinUnpart { src, window } => {
            let s = &node.shape;
            kernels::win_unpart(
                read(*src)?,
                (s[0], s[1], s[2]),
                *window,
                output(plan, base, id, node.len())?,
            );
        }
        Op::GetRelPos { table, size } => kernels::get_rel_pos(
            read(*table)?,
            *size,
            shape(*table)[1],
            output(plan, base, id, node.len())?,
        ),
        Op::AddRelPos { rel_h, rel_w, .. } => {
            let kh = shape(*rel_h)[3];
            let kw = shape(*rel_w)[3];
            kernels::add_rel_pos(seed()?, read(*rel_h)?, read(*rel_w)?, kh, kw);
        }
        Op::Concat { parts, axis } => {
            let outer: usize = node.shape[..*axis].iter().product();
            let sources = parts
                .iter()
                .map(|&part| Ok((read(part)?, shape(part)[*axis..].iter().product())))
                .collect::<Result<Vec<(&[f32], usize)>>>()?;
            kernels::concat(&sources, outer, output(plan, base, id, node.len())?);
        }
        Op::Slice { src, axis, start } => kernels::slice(
            read(*src)?,
            shape(*src),
            *axis,
            *start,
            node.shape[*axis],
            output(plan, base, id, node.len())?,
        )?,
    }

    Ok(())
}

/// Copies the marked outputs out of the arena, in marking order.
pub(crate) fn read_outputs(graph: &Graph<'_>, plan: &Plan, arena: &[f32]) -> Result<Vec<ArrayD<f32>>> {
    graph
        .outputs()
        .iter()
        .map(|&id| {
            let node = &graph.nodes[id.index()];
            let data = match (&graph.nodes[graph.root(id).index()].op, plan.location(id)) {
                (Op::External(data), _) => data.to_vec(),
                (_, Location::Arena(offset)) => arena
                    .get(offset..offset + node.len())
                    .context("output lies outside the arena")?
                    .to_vec(),
                (_, Location::External) => bail!("output {} has no storage", id.index()),
            };
            Ok(ArrayD::from_shape_vec(IxDyn(&node.shape), data)?)
        })
        .collect()
}
