use super::{Graph, Op, TensorId};
use anyhow::{bail, Result};
use log::debug;

/// Arena offsets are aligned to 64 bytes.
pub(crate) const ALIGNMENT: usize = 64 / std::mem::size_of::<f32>();

fn aligned(len: usize) -> usize {
    len.div_ceil(ALIGNMENT).max(1) * ALIGNMENT
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Block {
    offset: usize,
    size: usize,
}

/// Best-fit arena allocator over f32 slots.
///
/// Freed blocks are coalesced with their neighbours; a block that reaches the
/// top of the arena lowers the top instead of staying on the free list.
#[derive(Debug)]
pub(crate) struct TensorAllocator {
    free: Vec<Block>,
    top: usize,
    peak: usize,
    capacity: Option<usize>,
}

impl TensorAllocator {
    /// Tracks the peak only.
    pub(crate) fn measure() -> Self {
        TensorAllocator {
            free: Vec::new(),
            top: 0,
            peak: 0,
            capacity: None,
        }
    }

    /// Fails as soon as a plan would need more than `capacity` slots.
    pub(crate) fn exact(capacity: usize) -> Self {
        TensorAllocator {
            capacity: Some(capacity),
            ..Self::measure()
        }
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak
    }

    pub(crate) fn alloc(&mut self, len: usize) -> Result<usize> {
        let size = aligned(len);

        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, block)| block.size >= size)
            .min_by_key(|(_, block)| block.size)
            .map(|(index, _)| index);

        if let Some(index) = best {
            let block = self.free[index];
            if block.size == size {
                self.free.remove(index);
            } else {
                self.free[index] = Block {
                    offset: block.offset + size,
                    size: block.size - size,
                };
            }
            return Ok(block.offset);
        }

        let offset = self.top;
        let top = offset + size;
        if let Some(capacity) = self.capacity {
            if top > capacity {
                bail!("graph needs {top} arena slots, only {capacity} were reserved");
            }
        }
        self.top = top;
        self.peak = self.peak.max(top);
        Ok(offset)
    }

    pub(crate) fn free(&mut self, offset: usize, len: usize) {
        let mut block = Block {
            offset,
            size: aligned(len),
        };

        let at = self.free.partition_point(|b| b.offset < offset);
        if at < self.free.len() && block.offset + block.size == self.free[at].offset {
            block.size += self.free.remove(at).size;
        }
        if at > 0 {
            let prev = self.free[at - 1];
            if prev.offset + prev.size == block.offset {
                block = Block {
                    offset: prev.offset,
                    size: prev.size + block.size,
                };
                self.free.remove(at - 1);
            }
        }

        if block.offset + block.size == self.top {
            self.top = block.offset;
        } else {
            let at = self.free.partition_point(|b| b.offset < block.offset);
            self.free.insert(at, block);
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Location {
    External,
    Arena(usize),
}

/// Arena placement of every node of one graph.
#[derive(Debug)]
pub(crate) struct Plan {
    pub(crate) locations: Vec<Location>,
    /// Node result already sits in its first operand's storage.
    pub(crate) in_place: Vec<bool>,
    pub(crate) peak: usize,
}

impl Plan {
    pub(crate) fn location(&self, id: TensorId) -> Location {
        self.locations[id.index()]
    }
}

/// Assigns arena offsets by liveness. With `capacity` the plan fails instead
/// of growing past it.
pub(crate) fn plan(graph: &Graph<'_>, capacity: Option<usize>) -> Result<Plan> {
    let n = graph.nodes.len();
    let roots: Vec<TensorId> = (0..n).map(|i| graph.root(TensorId(i))).collect();

    let mut remaining = vec![0usize; n];
    for node in &graph.nodes {
        if matches!(node.op, Op::Reshape(_)) {
            continue;
        }
        for input in node.op.inputs() {
            remaining[roots[input.index()].index()] += 1;
        }
    }

    let mut is_output = vec![false; n];
    for &output in graph.outputs() {
        is_output[roots[output.index()].index()] = true;
    }

    let mut allocator = match capacity {
        Some(capacity) => TensorAllocator::exact(capacity),
        None => TensorAllocator::measure(),
    };
    let mut locations = vec![Location::External; n];
    let mut in_place = vec![false; n];
    // storage handed over to an in-place result must not be freed twice
    let mut handed_over = vec![false; n];

    for (index, node) in graph.nodes.iter().enumerate() {
        match &node.op {
            Op::External(_) => continue,
            Op::Reshape(_) => {
                locations[index] = locations[roots[index].index()];
                continue;
            }
            _ => {}
        }

        let inputs = node.op.inputs();
        let reuse = inputs.first().map(|&first| roots[first.index()]).filter(|root| {
            let r = root.index();
            node.op.can_run_in_place()
                && matches!(locations[r], Location::Arena(_))
                && !is_output[r]
                && remaining[r] == 1
                && graph.nodes[r].len() == node.len()
        });

        locations[index] = match reuse {
            Some(root) => {
                in_place[index] = true;
                handed_over[root.index()] = true;
                locations[root.index()]
            }
            None => Location::Arena(allocator.alloc(node.len())?),
        };

        for input in inputs {
            let r = roots[input.index()].index();
            remaining[r] -= 1;
            if remaining[r] == 0 && !is_output[r] && !handed_over[r] {
                if let Location::Arena(offset) = locations[r] {
                    allocator.free(offset, graph.nodes[r].len());
                }
            }
        }

        // results nobody reads
        if remaining[index] == 0 && !is_output[index] {
            if let Location::Arena(offset) = locations[index] {
                allocator.free(offset, node.len());
            }
        }
    }

    debug!(
        "planned {} nodes into {:.2} MB of scratch",
        n,
        (allocator.peak() * std::mem::size_of::<f32>()) as f64 / (1024.0 * 1024.0)
    );

    Ok(Plan {
        locations,
        in_place,
        peak: allocator.peak(),
    })
}
