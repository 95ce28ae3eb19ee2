use super::{allocator, executor, Graph, Mode};
use anyhow::{ensure, Context, Result};
use log::debug;
use ndarray::ArrayD;
use rayon::ThreadPool;

/// Session-owned arena for graph execution. It grows to the largest graph
/// seen so far and never shrinks.
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    data: Vec<f32>,
    used: usize,
}

impl ScratchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Bytes handed to the most recent graph.
    pub fn used_bytes(&self) -> usize {
        self.used * std::mem::size_of::<f32>()
    }

    /// Grows to at least `len` slots and returns the first `len`, zeroed.
    fn prepare(&mut self, len: usize) -> &mut [f32] {
        if self.data.len() < len {
            debug!(
                "growing scratch buffer from {} to {} bytes",
                self.capacity_bytes(),
                len * std::mem::size_of::<f32>()
            );
            self.data.resize(len, 0.0);
        }
        let previous = self.used;
        self.data[..previous.max(len)].fill(0.0);
        self.used = len;
        &mut self.data[..len]
    }

    /// Zeroes the region the last graph used.
    pub fn clear(&mut self) {
        self.data[..self.used].fill(0.0);
        self.used = 0;
    }
}

/// Builds the graph described by `build` twice, measuring first and then
/// computing against an arena of exactly the measured size, and returns the
/// graph outputs in the order they were marked.
pub(crate) fn plan_and_execute<'a, F>(
    scratch: &mut ScratchBuffer,
    pool: &ThreadPool,
    build: F,
) -> Result<Vec<ArrayD<f32>>>
where
    F: Fn(&mut Graph<'a>) -> Result<()>,
{
    let (peak, signature) = {
        let mut graph = Graph::new(Mode::Measure);
        build(&mut graph).context("failed to build graph for measuring")?;
        let plan = allocator::plan(&graph, None)?;
        (plan.peak, graph.signature())
    };

    let mut graph = Graph::new(Mode::Compute);
    build(&mut graph).context("failed to build graph for execution")?;
    ensure!(
        graph.signature() == signature,
        "graph changed between the measuring and the computing pass"
    );
    ensure!(!graph.outputs().is_empty(), "graph has no outputs");

    let plan = allocator::plan(&graph, Some(peak))?;
    debug!(
        "executing graph: {} nodes, {} outputs, {} bytes of scratch",
        graph.len(),
        graph.outputs().len(),
        peak * std::mem::size_of::<f32>()
    );

    let arena = scratch.prepare(peak);
    pool.install(|| executor::execute(&mut graph, &plan, &mut *arena))?;
    executor::read_outputs(&graph, &plan, arena)
}
