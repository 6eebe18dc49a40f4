//! Compiled-graph description and the execution driver.
//!
//! [`GraphSpec`] is the contract with the graph compiler: nodes with
//! kernels, input wiring, control dependencies and the ordered list of
//! graph outputs. [`GraphExecutor::launch`] turns that description into tensors,
//! arrows and actors; [`GraphExecutor::run`] then drives one pass at a
//! time, each under a fresh sequential number.
//!
//! Reference counts are derived here: an intermediate output carries one
//! count per consuming input slot plus one for its producer's own
//! release, so it is returned to the allocator exactly when the last
//! consumer is done. Graph outputs and parameters are unbounded; the
//! caller owns them.

use std::collections::HashMap;
use std::sync::Arc;

use device::{DeviceContext, KernelMod, TensorArena, TensorFormat, TensorHandle, UNBOUNDED_REF_COUNT};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::kernel_actor::KernelActor;
use crate::memory_actor::MemoryManagerActor;
use crate::messages::{Aid, OpData, OpMessage};
use crate::output_actor::{OutputActor, OutputSink};
use crate::pass::{GraphExecutionStrategy, PassContext};
use crate::registry::ActorRegistry;
use crate::{Result, RuntimeError};

/// One data edge: producer output slot to consumer input slot.
#[derive(Debug, Clone)]
pub struct DataArrow {
    pub from_output_index: usize,
    pub to: Aid,
    pub to_input_index: usize,
}

/// One ordering edge, no payload.
#[derive(Debug, Clone)]
pub struct ControlArrow {
    pub to: Aid,
}

/// One graph-output edge: producer output slot to a slot in the graph's
/// output vector.
#[derive(Debug, Clone)]
pub struct ResultArrow {
    pub from_output_index: usize,
    pub target_index: usize,
}

/// Where one input slot gets its tensor from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    /// Output `output` of node `node`.
    Node { node: usize, output: usize },
    /// Graph parameter, fed by the driver each pass.
    Parameter(usize),
}

/// An externally owned graph input.
#[derive(Debug, Clone, Copy)]
pub struct ParameterSpec {
    pub size: usize,
    pub format: TensorFormat,
}

/// One graph node as emitted by the compiler.
pub struct NodeSpec {
    pub name: String,
    pub kernel: Arc<dyn KernelMod>,
    /// Input slot wiring, in slot order.
    pub inputs: Vec<InputSource>,
    /// Indices of nodes that must finish before this one may launch.
    pub control_deps: Vec<usize>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, kernel: Arc<dyn KernelMod>) -> Self {
        Self {
            name: name.into(),
            kernel,
            inputs: Vec::new(),
            control_deps: Vec::new(),
        }
    }

    pub fn input_from(mut self, node: usize, output: usize) -> Self {
        self.inputs.push(InputSource::Node { node, output });
        self
    }

    pub fn input_parameter(mut self, parameter: usize) -> Self {
        self.inputs.push(InputSource::Parameter(parameter));
        self
    }

    pub fn control_dep(mut self, node: usize) -> Self {
        self.control_deps.push(node);
        self
    }
}

/// Whole-graph description handed over by the compiler.
#[derive(Default)]
pub struct GraphSpec {
    pub nodes: Vec<NodeSpec>,
    pub parameters: Vec<ParameterSpec>,
    /// Graph outputs in caller-visible order: (node, output slot).
    pub outputs: Vec<(usize, usize)>,
}

impl GraphSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parameter(&mut self, size: usize, format: TensorFormat) -> usize {
        self.parameters.push(ParameterSpec { size, format });
        self.parameters.len() - 1
    }

    pub fn node(&mut self, node: NodeSpec) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn output(&mut self, node: usize, output_index: usize) {
        self.outputs.push((node, output_index));
    }
}

/// Runs a launched graph, one pass per call.
pub struct GraphExecutor {
    strategy: GraphExecutionStrategy,
    registry: Arc<ActorRegistry>,
    arena: Arc<TensorArena>,
    parameter_tensors: Vec<TensorHandle>,
    /// Pipeline: parameter deliveries the driver makes each pass.
    parameter_feeds: Vec<(Aid, usize, usize)>,
    /// Pipeline: nodes with no fan-in at all, triggered by the driver.
    triggers: Vec<Aid>,
    expected_outputs: usize,
    sink: OutputSink,
    next_sequential: u64,
    /// Step: actors held directly, in topological order.
    step_actors: Vec<KernelActor>,
    /// Step: per actor, the resolved tensor for each input slot.
    step_inputs: Vec<Vec<TensorHandle>>,
}

impl GraphExecutor {
    /// Validate the graph description, materialize tensors and arrows, and (in
    /// pipeline mode) spawn the actor set on `registry`.
    ///
    /// One executor per registry: the memory-manager and output-collector
    /// names are fixed.
    pub fn launch(
        spec: GraphSpec,
        device: Arc<dyn DeviceContext>,
        registry: Arc<ActorRegistry>,
        strategy: GraphExecutionStrategy,
    ) -> Result<Self> {
        validate(&spec)?;
        let order = topological_order(&spec)?;
        let arena = Arc::new(TensorArena::new());

        // Parameters are caller-owned: unbounded count, resident for the
        // executor's whole life.
        let mut parameter_tensors = Vec::with_capacity(spec.parameters.len());
        for param in &spec.parameters {
            let t = arena.create(param.size, param.format, UNBOUNDED_REF_COUNT);
            device
                .allocate_memory(&arena, t, param.size)
                .map_err(RuntimeError::Device)?;
            parameter_tensors.push(t);
        }

        // Consumer counts per (node, output slot) and result targets.
        let mut consumers: HashMap<(usize, usize), usize> = HashMap::new();
        for node in &spec.nodes {
            for input in &node.inputs {
                if let InputSource::Node { node, output } = *input {
                    *consumers.entry((node, output)).or_insert(0) += 1;
                }
            }
        }
        let mut result_targets: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
        for (target_index, &(node, output)) in spec.outputs.iter().enumerate() {
            result_targets.entry((node, output)).or_default().push(target_index);
        }

        let mut node_outputs: Vec<Vec<TensorHandle>> = Vec::with_capacity(spec.nodes.len());
        let mut node_workspaces: Vec<Vec<TensorHandle>> = Vec::with_capacity(spec.nodes.len());
        for (i, node) in spec.nodes.iter().enumerate() {
            let output_sizes = node.kernel.output_size_list();
            let outputs = output_sizes
                .iter()
                .enumerate()
                .map(|(o, &size)| {
                    let count = if result_targets.contains_key(&(i, o)) {
                        UNBOUNDED_REF_COUNT
                    } else {
                        // Every consumer slot plus the producer's own
                        // post-launch release.
                        consumers.get(&(i, o)).copied().unwrap_or(0) + 1
                    };
                    arena.create(size, TensorFormat::Raw, count)
                })
                .collect();
            node_outputs.push(outputs);
            let workspaces = node
                .kernel
                .workspace_size_list()
                .iter()
                .map(|&size| arena.create(size, TensorFormat::Raw, 1))
                .collect();
            node_workspaces.push(workspaces);
        }

        let aids: Vec<Aid> = spec.nodes.iter().map(|n| Aid::local(n.name.clone())).collect();

        // Arrows, fan-in and driver feeds.
        let mut data_arrows: Vec<Vec<DataArrow>> = vec![Vec::new(); spec.nodes.len()];
        let mut control_arrows: Vec<Vec<ControlArrow>> = vec![Vec::new(); spec.nodes.len()];
        let mut parameter_feeds = Vec::new();
        let mut triggers = Vec::new();
        let mut controls_num = vec![0usize; spec.nodes.len()];
        for (j, node) in spec.nodes.iter().enumerate() {
            for (slot, input) in node.inputs.iter().enumerate() {
                match *input {
                    InputSource::Node { node: i, output } => data_arrows[i].push(DataArrow {
                        from_output_index: output,
                        to: aids[j].clone(),
                        to_input_index: slot,
                    }),
                    InputSource::Parameter(p) => parameter_feeds.push((aids[j].clone(), slot, p)),
                }
            }
            for &i in &node.control_deps {
                control_arrows[i].push(ControlArrow { to: aids[j].clone() });
                controls_num[j] += 1;
            }
            if node.inputs.is_empty() && node.control_deps.is_empty() {
                // Nothing upstream will ever wake this node.
                triggers.push(aids[j].clone());
                controls_num[j] += 1;
            }
        }

        let sink: OutputSink = Arc::new(Mutex::new(HashMap::new()));
        let expected_outputs = spec.outputs.len();

        let mut actors: HashMap<usize, KernelActor> = HashMap::new();
        for (i, node) in spec.nodes.iter().enumerate() {
            let actor = KernelActor::new(
                node.name.clone(),
                Arc::clone(&node.kernel),
                Arc::clone(&device),
                Arc::clone(&arena),
                Arc::clone(&registry),
            )
            .with_fan_in(node.inputs.len(), controls_num[i])
            .with_outputs(node_outputs[i].clone())
            .with_workspaces(node_workspaces[i].clone())
            .with_data_arrows(std::mem::take(&mut data_arrows[i]))
            .with_control_arrows(std::mem::take(&mut control_arrows[i]))
            .with_result_arrows(
                result_targets
                    .iter()
                    .filter(|((node, _), _)| *node == i)
                    .flat_map(|((_, output), targets)| {
                        targets.iter().map(|&target_index| ResultArrow {
                            from_output_index: *output,
                            target_index,
                        })
                    })
                    .collect(),
            );
            actors.insert(i, actor);
        }

        let mut step_actors = Vec::new();
        let mut step_inputs = Vec::new();
        match strategy {
            GraphExecutionStrategy::Pipeline => {
                registry.spawn(
                    MemoryManagerActor::new(
                        Arc::clone(&device),
                        Arc::clone(&arena),
                        Arc::clone(&registry),
                    ),
                    true,
                );
                registry.spawn(OutputActor::new(expected_outputs, Arc::clone(&sink)), true);
                for i in 0..spec.nodes.len() {
                    if let Some(actor) = actors.remove(&i) {
                        registry.spawn(actor, true);
                    }
                }
            }
            GraphExecutionStrategy::Step => {
                // Inputs are static handles; resolve them once.
                for &i in &order {
                    let resolved = spec.nodes[i]
                        .inputs
                        .iter()
                        .map(|input| match *input {
                            InputSource::Node { node, output } => node_outputs[node][output],
                            InputSource::Parameter(p) => parameter_tensors[p],
                        })
                        .collect();
                    step_inputs.push(resolved);
                    if let Some(actor) = actors.remove(&i) {
                        step_actors.push(actor);
                    }
                }
            }
        }

        info!(
            nodes = spec.nodes.len(),
            parameters = spec.parameters.len(),
            outputs = expected_outputs,
            ?strategy,
            "graph launched"
        );
        Ok(Self {
            strategy,
            registry,
            arena,
            parameter_tensors,
            parameter_feeds,
            triggers,
            expected_outputs,
            sink,
            next_sequential: 1,
            step_actors,
            step_inputs,
        })
    }

    /// Caller-owned input tensors, in parameter order.
    pub fn parameters(&self) -> &[TensorHandle] {
        &self.parameter_tensors
    }

    pub fn arena(&self) -> &Arc<TensorArena> {
        &self.arena
    }

    /// Run one pass and return the graph outputs in declared order.
    pub async fn run(&mut self) -> Result<Vec<TensorHandle>> {
        let seq = self.next_sequential;
        self.next_sequential += 1;
        let context = Arc::new(PassContext::new(seq, self.strategy));
        debug!(sequential_num = seq, strategy = ?self.strategy, "pass start");
        match self.strategy {
            GraphExecutionStrategy::Pipeline => self.run_pipeline(context).await,
            GraphExecutionStrategy::Step => self.run_step(&context),
        }
    }

    async fn run_pipeline(&mut self, context: Arc<PassContext>) -> Result<Vec<TensorHandle>> {
        for (aid, slot, p) in &self.parameter_feeds {
            self.registry.send(
                aid,
                OpMessage::RunOpData {
                    data: OpData {
                        index: *slot,
                        tensor: self.parameter_tensors[*p],
                    },
                    context: Arc::clone(&context),
                },
                false,
            )?;
        }
        for aid in &self.triggers {
            self.registry.send(
                aid,
                OpMessage::RunOpControl {
                    from: None,
                    context: Arc::clone(&context),
                },
                false,
            )?;
        }
        context.wait().await?;
        self.sink
            .lock()
            .remove(&context.sequential_num())
            .ok_or_else(|| {
                RuntimeError::configuration(format!(
                    "pass {} completed without outputs",
                    context.sequential_num()
                ))
            })
    }

    /// Walk the nodes in topological order on the calling thread.
    fn run_step(&mut self, context: &Arc<PassContext>) -> Result<Vec<TensorHandle>> {
        for (actor, inputs) in self.step_actors.iter_mut().zip(&self.step_inputs) {
            for (slot, &tensor) in inputs.iter().enumerate() {
                actor.push_input_tensor(slot, tensor)?;
            }
            actor.execute_step(context)?;
        }
        if let Some(err) = context.failure() {
            return Err(err.clone());
        }
        let mut outputs = vec![None; self.expected_outputs];
        for actor in &self.step_actors {
            for arrow in actor.result_arrows() {
                outputs[arrow.target_index] = Some(actor.output_tensors()[arrow.from_output_index]);
            }
        }
        context.set_success();
        outputs
            .into_iter()
            .enumerate()
            .map(|(i, t)| t.ok_or_else(|| RuntimeError::configuration(format!("output {i} never produced"))))
            .collect()
    }
}

fn validate(spec: &GraphSpec) -> Result<()> {
    if spec.outputs.is_empty() {
        return Err(RuntimeError::configuration("graph has no outputs"));
    }
    let mut names = HashMap::new();
    for (i, node) in spec.nodes.iter().enumerate() {
        if let Some(first) = names.insert(node.name.clone(), i) {
            return Err(RuntimeError::configuration(format!(
                "duplicate node name {} (nodes {first} and {i})",
                node.name
            )));
        }
        for input in &node.inputs {
            match *input {
                InputSource::Node { node: n, output } => {
                    let producer = spec.nodes.get(n).ok_or_else(|| {
                        RuntimeError::configuration(format!("node {i} reads from missing node {n}"))
                    })?;
                    if output >= producer.kernel.output_size_list().len() {
                        return Err(RuntimeError::configuration(format!(
                            "node {i} reads missing output {output} of node {n}"
                        )));
                    }
                }
                InputSource::Parameter(p) => {
                    if p >= spec.parameters.len() {
                        return Err(RuntimeError::configuration(format!(
                            "node {i} reads missing parameter {p}"
                        )));
                    }
                }
            }
        }
        for &dep in &node.control_deps {
            if dep >= spec.nodes.len() {
                return Err(RuntimeError::configuration(format!(
                    "node {i} depends on missing node {dep}"
                )));
            }
        }
    }
    for &(node, output) in &spec.outputs {
        let producer = spec
            .nodes
            .get(node)
            .ok_or_else(|| RuntimeError::configuration(format!("graph output from missing node {node}")))?;
        if output >= producer.kernel.output_size_list().len() {
            return Err(RuntimeError::configuration(format!(
                "graph output from missing output {output} of node {node}"
            )));
        }
    }
    Ok(())
}

/// Kahn's algorithm over data plus control edges; rejects cycles.
fn topological_order(spec: &GraphSpec) -> Result<Vec<usize>> {
    let n = spec.nodes.len();
    let mut indegree = vec![0usize; n];
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (j, node) in spec.nodes.iter().enumerate() {
        for input in &node.inputs {
            if let InputSource::Node { node: i, .. } = *input {
                edges[i].push(j);
                indegree[j] += 1;
            }
        }
        for &i in &node.control_deps {
            edges[i].push(j);
            indegree[j] += 1;
        }
    }
    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop() {
        order.push(i);
        for &j in &edges[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.push(j);
            }
        }
    }
    if order.len() != n {
        return Err(RuntimeError::configuration("kernel graph contains a cycle"));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::{HostDevice, StaticKernel};
    use tokio::runtime::Handle;

    fn chain_spec() -> GraphSpec {
        let mut spec = GraphSpec::new();
        let p = spec.parameter(64, TensorFormat::F32);
        let a = spec.node(NodeSpec::new("kernel-scale", Arc::new(StaticKernel::new("Scale-0", vec![64]))).input_parameter(p));
        let b = spec.node(NodeSpec::new("kernel-sum", Arc::new(StaticKernel::new("Sum-0", vec![32]))).input_from(a, 0));
        spec.output(b, 0);
        spec
    }

    #[tokio::test]
    async fn test_pipeline_chain_runs_twice() {
        let device = Arc::new(HostDevice::with_capacity(0, 1 << 16));
        let registry = ActorRegistry::new(Handle::current());
        let mut exec = GraphExecutor::launch(
            chain_spec(),
            device,
            registry.clone(),
            GraphExecutionStrategy::Pipeline,
        )
        .unwrap();

        let first = exec.run().await.unwrap();
        assert_eq!(first.len(), 1);
        let arena = exec.arena().clone();
        // Graph output stays resident, the intermediate went back.
        assert!(arena.ptr(first[0]).unwrap().is_some());

        let second = exec.run().await.unwrap();
        assert_eq!(second, first);
        registry.terminate_all().await;
    }

    #[tokio::test]
    async fn test_step_chain_produces_outputs() {
        let device = Arc::new(HostDevice::with_capacity(0, 1 << 16));
        let registry = ActorRegistry::new(Handle::current());
        let mut exec = GraphExecutor::launch(
            chain_spec(),
            device,
            registry.clone(),
            GraphExecutionStrategy::Step,
        )
        .unwrap();

        let outputs = exec.run().await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(exec.arena().ptr(outputs[0]).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_intermediate_is_freed_after_fan_out() {
        let device = Arc::new(HostDevice::with_capacity(0, 1 << 16));
        let registry = ActorRegistry::new(Handle::current());

        let mut spec = GraphSpec::new();
        let a = spec.node(NodeSpec::new("kernel-src", Arc::new(StaticKernel::new("Fill-0", vec![64]))));
        let b = spec.node(NodeSpec::new("kernel-left", Arc::new(StaticKernel::new("Relu-0", vec![32]))).input_from(a, 0));
        let c = spec.node(
            NodeSpec::new("kernel-right", Arc::new(StaticKernel::new("Neg-0", vec![32])))
                .input_from(a, 0)
                .control_dep(b),
        );
        spec.output(b, 0);
        spec.output(c, 0);

        let mut exec = GraphExecutor::launch(
            spec,
            device,
            registry.clone(),
            GraphExecutionStrategy::Pipeline,
        )
        .unwrap();
        let outputs = exec.run().await.unwrap();
        assert_eq!(outputs.len(), 2);
        let arena = exec.arena().clone();
        registry.terminate_all().await;

        // The fan-out tensor had two consumers plus its producer; all
        // three releases happened, so the buffer went back.
        let intermediates: Vec<TensorHandle> = (0..arena.len() as u32)
            .map(TensorHandle)
            .filter(|t| !outputs.contains(t))
            .collect();
        for t in intermediates {
            assert_eq!(arena.ptr(t).unwrap(), None, "{t} still resident");
        }
        for t in outputs {
            assert!(arena.ptr(t).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_step_intermediate_result_arrow_still_runs_downstream() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let device = Arc::new(HostDevice::with_capacity(0, 1 << 16));
        let registry = ActorRegistry::new(Handle::current());
        let tail_runs = Arc::new(AtomicUsize::new(0));
        let counter = tail_runs.clone();

        // The head node is both a graph output and the tail's producer.
        let mut spec = GraphSpec::new();
        let a = spec.node(NodeSpec::new("kernel-head", Arc::new(StaticKernel::new("Fill-0", vec![64]))));
        let b = spec.node(
            NodeSpec::new(
                "kernel-tail",
                Arc::new(StaticKernel::new("Relu-0", vec![32]).with_compute(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                })),
            )
            .input_from(a, 0),
        );
        spec.output(a, 0);
        spec.output(b, 0);

        let mut exec =
            GraphExecutor::launch(spec, device, registry, GraphExecutionStrategy::Step).unwrap();
        let outputs = exec.run().await.unwrap();
        assert_eq!(tail_runs.load(Ordering::SeqCst), 1);
        assert_eq!(outputs.len(), 2);
        for t in outputs {
            assert!(exec.arena().ptr(t).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_cycle_is_rejected() {
        let device = Arc::new(HostDevice::new(0));
        let registry = ActorRegistry::new(Handle::current());
        let mut spec = GraphSpec::new();
        spec.node(NodeSpec::new("kernel-a", Arc::new(StaticKernel::new("A-0", vec![8]))).input_from(1, 0));
        spec.node(NodeSpec::new("kernel-b", Arc::new(StaticKernel::new("B-0", vec![8]))).input_from(0, 0));
        spec.output(1, 0);

        let result = GraphExecutor::launch(spec, device, registry, GraphExecutionStrategy::Pipeline);
        assert!(matches!(result, Err(RuntimeError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_empty_outputs_and_duplicate_names_are_rejected() {
        let device = Arc::new(HostDevice::new(0));
        let registry = ActorRegistry::new(Handle::current());

        let spec = GraphSpec::new();
        assert!(GraphExecutor::launch(
            spec,
            device.clone(),
            registry.clone(),
            GraphExecutionStrategy::Pipeline
        )
        .is_err());

        let mut spec = GraphSpec::new();
        spec.node(NodeSpec::new("kernel-x", Arc::new(StaticKernel::new("X-0", vec![8]))));
        spec.node(NodeSpec::new("kernel-x", Arc::new(StaticKernel::new("X-1", vec![8]))));
        spec.output(0, 0);
        assert!(GraphExecutor::launch(spec, device, registry, GraphExecutionStrategy::Step).is_err());
    }
}
