//! Kernel actor: one graph node's execution state machine.
//!
//! A kernel actor buffers incoming data/control messages per sequential
//! number until its statically known fan-in is satisfied, then walks the
//! launch sequence:
//!
//! ```text
//! condition met ─▶ shape refresh ─▶ memory alloc ─▶ launch
//!                                                     │
//!              outputs ◀─ free memory ◀─ (debug ack) ◀┘
//! ```
//!
//! Memory is released *before* anything is sent downstream, so peak
//! device-memory pressure never includes buffers this node is done with.
//! Outputs leave in a fixed order: results to the collector, then data
//! arrows, then control arrows.
//!
//! In step mode the driver holds the actors directly and runs the same
//! sequence synchronously through [`KernelActor::execute_step`]; the
//! allocation and free hops happen inline instead of through the
//! memory-manager mailbox.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use device::{
    AddressSpan, DeviceContext, DeviceError, KernelLaunchInfo, KernelMod, TensorArena, TensorHandle,
};
use tracing::{debug, trace, warn};

use crate::actor::Actor;
use crate::graph::{ControlArrow, DataArrow, ResultArrow};
use crate::memory_actor::{allocate_memory_list, free_memory_list, MemoryManagerActor};
use crate::messages::{Aid, OpData, OpMessage};
use crate::output_actor::OutputActor;
use crate::pass::{GraphExecutionStrategy, PassContext};
use crate::registry::ActorRegistry;
use crate::{Result, RuntimeError};

/// Actor executing one kernel-graph node.
pub struct KernelActor {
    aid: Aid,
    kernel: Arc<dyn KernelMod>,
    device: Arc<dyn DeviceContext>,
    arena: Arc<TensorArena>,
    registry: Arc<ActorRegistry>,

    memory_manager: Aid,
    output_collector: Aid,
    /// Optional collaborator acknowledging each launch before outputs go.
    debug_target: Option<Aid>,

    /// Statically known fan-in: distinct data inputs and control signals
    /// required before this node may launch.
    inputs_num: usize,
    controls_num: usize,

    output_tensors: Vec<TensorHandle>,
    workspace_tensors: Vec<TensorHandle>,
    /// Step-mode input slots, set by the driver before `execute_step`.
    input_tensors: Vec<Option<TensorHandle>>,

    output_data_arrows: Vec<DataArrow>,
    output_control_arrows: Vec<ControlArrow>,
    result_arrows: Vec<ResultArrow>,

    /// Per-pass arrival bookkeeping, keyed by sequential number.
    input_op_datas: HashMap<u64, Vec<OpData>>,
    input_op_controls: HashMap<u64, usize>,
}

impl KernelActor {
    pub fn new(
        name: impl Into<String>,
        kernel: Arc<dyn KernelMod>,
        device: Arc<dyn DeviceContext>,
        arena: Arc<TensorArena>,
        registry: Arc<ActorRegistry>,
    ) -> Self {
        Self {
            aid: Aid::local(name),
            kernel,
            device,
            arena,
            registry,
            memory_manager: Aid::local(MemoryManagerActor::NAME),
            output_collector: Aid::local(OutputActor::NAME),
            debug_target: None,
            inputs_num: 0,
            controls_num: 0,
            output_tensors: Vec::new(),
            workspace_tensors: Vec::new(),
            input_tensors: Vec::new(),
            output_data_arrows: Vec::new(),
            output_control_arrows: Vec::new(),
            result_arrows: Vec::new(),
            input_op_datas: HashMap::new(),
            input_op_controls: HashMap::new(),
        }
    }

    pub fn with_fan_in(mut self, inputs_num: usize, controls_num: usize) -> Self {
        self.inputs_num = inputs_num;
        self.controls_num = controls_num;
        self.input_tensors = vec![None; inputs_num];
        self
    }

    pub fn with_outputs(mut self, output_tensors: Vec<TensorHandle>) -> Self {
        self.output_tensors = output_tensors;
        self
    }

    pub fn with_workspaces(mut self, workspace_tensors: Vec<TensorHandle>) -> Self {
        self.workspace_tensors = workspace_tensors;
        self
    }

    pub fn with_data_arrows(mut self, arrows: Vec<DataArrow>) -> Self {
        self.output_data_arrows = arrows;
        self
    }

    pub fn with_control_arrows(mut self, arrows: Vec<ControlArrow>) -> Self {
        self.output_control_arrows = arrows;
        self
    }

    pub fn with_result_arrows(mut self, arrows: Vec<ResultArrow>) -> Self {
        self.result_arrows = arrows;
        self
    }

    pub fn with_debug_target(mut self, target: Aid) -> Self {
        self.debug_target = Some(target);
        self
    }

    pub fn with_memory_manager(mut self, aid: Aid) -> Self {
        self.memory_manager = aid;
        self
    }

    pub fn with_output_collector(mut self, aid: Aid) -> Self {
        self.output_collector = aid;
        self
    }

    pub fn output_tensors(&self) -> &[TensorHandle] {
        &self.output_tensors
    }

    pub fn result_arrows(&self) -> &[ResultArrow] {
        &self.result_arrows
    }

    /// Place an already-resident tensor into one input slot. Step-mode
    /// companion of the data-arrow delivery path.
    pub fn push_input_tensor(&mut self, slot: usize, tensor: TensorHandle) -> Result<()> {
        let cell = self.input_tensors.get_mut(slot).ok_or_else(|| {
            RuntimeError::configuration(format!(
                "input slot {slot} out of range for {} ({} inputs)",
                self.aid, self.inputs_num
            ))
        })?;
        *cell = Some(tensor);
        Ok(())
    }

    /// Run the whole launch sequence synchronously, allocator calls
    /// inline. The driver feeds input slots first and reads outputs from
    /// [`Self::output_tensors`] afterwards.
    pub fn execute_step(&mut self, context: &Arc<PassContext>) -> Result<()> {
        if context.is_failed() {
            return Ok(());
        }
        let inputs: Vec<TensorHandle> = {
            let mut resolved = Vec::with_capacity(self.inputs_num);
            for (slot, cell) in self.input_tensors.iter().enumerate() {
                match cell {
                    Some(t) => resolved.push(*t),
                    None => {
                        let err = RuntimeError::configuration(format!(
                            "input slot {slot} of {} never filled",
                            self.aid
                        ));
                        context.set_failed(err.clone());
                        return Err(err);
                    }
                }
            }
            resolved
        };

        if let Err(e) = self.refresh_shapes() {
            context.set_failed(e.clone());
            return Err(e);
        }
        if let Err(e) = allocate_memory_list(self.device.as_ref(), self.arena.as_ref(), &self.alloc_list())
        {
            context.set_failed(e.clone());
            return Err(e);
        }
        let launched = self.launch(&inputs);
        // Memory goes back before any result is observable, step included.
        let free_list = self.free_list(&inputs);
        free_memory_list(self.device.as_ref(), self.arena.as_ref(), &free_list);
        if let Err(e) = launched {
            context.set_failed(e.clone());
            return Err(e);
        }
        self.send_output(context);
        Ok(())
    }

    fn alloc_list(&self) -> Vec<TensorHandle> {
        let mut list = self.output_tensors.clone();
        list.extend_from_slice(&self.workspace_tensors);
        list
    }

    fn free_list(&self, inputs: &[TensorHandle]) -> Vec<TensorHandle> {
        let mut list = inputs.to_vec();
        list.extend_from_slice(&self.output_tensors);
        list.extend_from_slice(&self.workspace_tensors);
        list
    }

    fn run_op_data(&mut self, data: OpData, context: Arc<PassContext>) -> Result<()> {
        let seq = context.sequential_num();
        trace!(actor = %self.aid, sequential_num = seq, slot = data.index, tensor = %data.tensor, "data input");
        self.input_op_datas.entry(seq).or_default().push(data);
        self.try_launch(seq, context)
    }

    fn run_op_control(&mut self, from: Option<Aid>, context: Arc<PassContext>) -> Result<()> {
        let seq = context.sequential_num();
        trace!(actor = %self.aid, sequential_num = seq, from = ?from.as_ref().map(Aid::name), "control input");
        *self.input_op_controls.entry(seq).or_insert(0) += 1;
        self.try_launch(seq, context)
    }

    /// Launch condition: every data slot and every control signal for this
    /// sequential number has arrived, in any order.
    fn launch_condition_met(&self, seq: u64) -> bool {
        let datas = self.input_op_datas.get(&seq).map_or(0, Vec::len);
        let controls = self.input_op_controls.get(&seq).copied().unwrap_or(0);
        datas == self.inputs_num && controls == self.controls_num
    }

    fn try_launch(&mut self, seq: u64, context: Arc<PassContext>) -> Result<()> {
        if !self.launch_condition_met(seq) {
            return Ok(());
        }
        if context.is_failed() {
            self.erase_input(seq);
            return Ok(());
        }
        debug!(actor = %self.aid, sequential_num = seq, "launch condition met");
        if let Err(e) = self.refresh_shapes() {
            context.set_failed(e);
            self.erase_input(seq);
            return Ok(());
        }
        self.send_memory_alloc_req(context)
    }

    /// Re-derive output/workspace byte sizes for dynamic-shape kernels so
    /// allocation sees current sizes.
    fn refresh_shapes(&self) -> Result<()> {
        if !self.kernel.is_dynamic_shape() {
            return Ok(());
        }
        self.kernel.update_shape().map_err(RuntimeError::Device)?;
        let output_sizes = self.kernel.output_size_list();
        let workspace_sizes = self.kernel.workspace_size_list();
        if output_sizes.len() != self.output_tensors.len()
            || workspace_sizes.len() != self.workspace_tensors.len()
        {
            return Err(RuntimeError::Device(DeviceError::LaunchInfoMismatch {
                kernel: self.kernel.name().to_string(),
                message: format!(
                    "size lists ({} outputs, {} workspaces) do not match tensors ({}, {})",
                    output_sizes.len(),
                    workspace_sizes.len(),
                    self.output_tensors.len(),
                    self.workspace_tensors.len()
                ),
            }));
        }
        for (&tensor, &size) in self.output_tensors.iter().zip(&output_sizes) {
            self.arena.set_size(tensor, size).map_err(RuntimeError::Device)?;
        }
        for (&tensor, &size) in self.workspace_tensors.iter().zip(&workspace_sizes) {
            self.arena.set_size(tensor, size).map_err(RuntimeError::Device)?;
        }
        Ok(())
    }

    fn send_memory_alloc_req(&mut self, context: Arc<PassContext>) -> Result<()> {
        self.registry.send(
            &self.memory_manager,
            OpMessage::AllocateRequest {
                handles: self.alloc_list(),
                reply_to: self.aid.clone(),
                context,
            },
            false,
        )
    }

    fn on_memory_alloc_finish(&mut self, context: Arc<PassContext>) -> Result<()> {
        let seq = context.sequential_num();
        if context.is_failed() {
            self.erase_input(seq);
            return Ok(());
        }
        let inputs = match self.resolve_inputs(seq) {
            Ok(inputs) => inputs,
            Err(e) => {
                context.set_failed(e);
                self.erase_input(seq);
                return Ok(());
            }
        };
        if let Err(e) = self.launch(&inputs) {
            // First failure wins; the pass resolves through the context,
            // not by crashing the actor.
            context.set_failed(e);
            self.erase_input(seq);
            return Ok(());
        }
        if let Some(debug_target) = self.debug_target.clone() {
            return self.registry.send(
                &debug_target,
                OpMessage::DebugReq {
                    kernel: self.kernel.name().to_string(),
                    reply_to: self.aid.clone(),
                    context,
                },
                false,
            );
        }
        self.post_launch(context)
    }

    /// Map a pass's buffered data messages onto input slots.
    fn resolve_inputs(&self, seq: u64) -> Result<Vec<TensorHandle>> {
        let mut slots: Vec<Option<TensorHandle>> = vec![None; self.inputs_num];
        if let Some(datas) = self.input_op_datas.get(&seq) {
            for data in datas {
                let cell = slots.get_mut(data.index).ok_or_else(|| {
                    RuntimeError::configuration(format!(
                        "input slot {} out of range for {} ({} inputs)",
                        data.index, self.aid, self.inputs_num
                    ))
                })?;
                if cell.replace(data.tensor).is_some() {
                    warn!(actor = %self.aid, sequential_num = seq, slot = data.index, "input slot delivered twice");
                }
            }
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(slot, cell)| {
                cell.ok_or_else(|| {
                    RuntimeError::configuration(format!(
                        "input slot {slot} of {} never filled",
                        self.aid
                    ))
                })
            })
            .collect()
    }

    /// Rebuild the launch descriptor from current pointers/sizes and run
    /// the kernel. The descriptor is transient by design: dynamic-shape
    /// kernels invalidate addresses and sizes between passes.
    fn launch(&self, inputs: &[TensorHandle]) -> Result<()> {
        let info = KernelLaunchInfo {
            inputs: self.spans(inputs)?,
            workspaces: self.spans(&self.workspace_tensors)?,
            outputs: self.spans(&self.output_tensors)?,
        };
        self.device
            .launch_kernel(self.kernel.as_ref(), &info)
            .map_err(RuntimeError::Device)
    }

    fn spans(&self, handles: &[TensorHandle]) -> Result<Vec<AddressSpan>> {
        handles
            .iter()
            .map(|&h| {
                let desc = self.arena.describe(h).map_err(RuntimeError::Device)?;
                if desc.size > 0 && desc.ptr.is_none() {
                    return Err(RuntimeError::Device(DeviceError::NotAllocated(h)));
                }
                Ok(AddressSpan {
                    addr: desc.ptr.unwrap_or(0),
                    size: desc.size,
                })
            })
            .collect()
    }

    /// Free first, then send: downstream must never observe this node's
    /// results while its transient memory is still held.
    fn post_launch(&mut self, context: Arc<PassContext>) -> Result<()> {
        let seq = context.sequential_num();
        let inputs = self.resolve_inputs(seq).unwrap_or_default();
        self.erase_input(seq);

        self.registry.send(
            &self.memory_manager,
            OpMessage::FreeRequest {
                handles: self.free_list(&inputs),
                context: Arc::clone(&context),
            },
            false,
        )?;
        self.send_output(&context);
        Ok(())
    }

    /// Drop a pass's arrival bookkeeping. Absent entries are logged and
    /// otherwise fine: a failed pass may erase before every producer
    /// delivered.
    fn erase_input(&mut self, seq: u64) {
        let had_datas = self.input_op_datas.remove(&seq).is_some();
        let had_controls = self.input_op_controls.remove(&seq).is_some();
        if !had_datas && !had_controls {
            debug!(actor = %self.aid, sequential_num = seq, "no arrival bookkeeping to erase");
        }
    }

    /// Emit outputs in the fixed order {results, data, controls}. A failed
    /// pass emits nothing. Step mode emits nothing either: the driver
    /// reads results from the actor and walks the graph itself.
    fn send_output(&self, context: &Arc<PassContext>) {
        if context.is_failed() {
            return;
        }
        if context.strategy() == GraphExecutionStrategy::Step {
            return;
        }
        for arrow in &self.result_arrows {
            let msg = OpMessage::CollectOutput {
                node: self.aid.clone(),
                output_index: arrow.from_output_index,
                target_index: arrow.target_index,
                tensor: self.output_tensors[arrow.from_output_index],
                context: Arc::clone(context),
            };
            if let Err(e) = self.registry.send(&self.output_collector, msg, false) {
                context.set_failed(e);
                return;
            }
        }
        for arrow in &self.output_data_arrows {
            let msg = OpMessage::RunOpData {
                data: OpData {
                    index: arrow.to_input_index,
                    tensor: self.output_tensors[arrow.from_output_index],
                },
                context: Arc::clone(context),
            };
            if let Err(e) = self.registry.send(&arrow.to, msg, false) {
                context.set_failed(e);
                return;
            }
        }
        for arrow in &self.output_control_arrows {
            let msg = OpMessage::RunOpControl {
                from: Some(self.aid.clone()),
                context: Arc::clone(context),
            };
            if let Err(e) = self.registry.send(&arrow.to, msg, true) {
                context.set_failed(e);
                return;
            }
        }
    }
}

#[async_trait]
impl Actor for KernelActor {
    fn aid(&self) -> &Aid {
        &self.aid
    }

    async fn handle(&mut self, msg: OpMessage) -> Result<()> {
        match msg {
            OpMessage::RunOpData { data, context } => self.run_op_data(data, context),
            OpMessage::RunOpControl { from, context } => self.run_op_control(from, context),
            OpMessage::RunOpControlWithInputTensor {
                from,
                tensors,
                context,
            } => {
                for (slot, tensor) in tensors.into_iter().enumerate() {
                    self.push_input_tensor(slot, tensor)?;
                }
                self.run_op_control(from, context)
            }
            OpMessage::MemoryAllocFinished { context } => self.on_memory_alloc_finish(context),
            OpMessage::DebugFinished { context } => self.post_launch(context),
            other => {
                warn!(actor = %self.aid, message = other.name(), "unexpected message");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output_actor::OutputSink;
    use device::{HostDevice, StaticKernel, TensorFormat, UNBOUNDED_REF_COUNT};
    use parking_lot::Mutex;
    use tokio::runtime::Handle;

    struct Fixture {
        device: Arc<HostDevice>,
        arena: Arc<TensorArena>,
        registry: Arc<ActorRegistry>,
        sink: OutputSink,
    }

    fn fixture() -> Fixture {
        let device = Arc::new(HostDevice::with_capacity(0, 1 << 16));
        let arena = Arc::new(TensorArena::new());
        let registry = ActorRegistry::new(Handle::current());
        let sink: OutputSink = Arc::new(Mutex::new(HashMap::new()));
        Fixture {
            device,
            arena,
            registry,
            sink,
        }
    }

    fn spawn_support(fx: &Fixture, expected_outputs: usize) {
        fx.registry.spawn(
            MemoryManagerActor::new(fx.device.clone(), fx.arena.clone(), fx.registry.clone()),
            true,
        );
        fx.registry
            .spawn(OutputActor::new(expected_outputs, fx.sink.clone()), true);
    }

    fn node(fx: &Fixture, name: &str, kernel: StaticKernel) -> KernelActor {
        KernelActor::new(
            name,
            Arc::new(kernel),
            fx.device.clone(),
            fx.arena.clone(),
            fx.registry.clone(),
        )
    }

    #[tokio::test]
    async fn test_source_node_runs_and_collects() {
        let fx = fixture();
        spawn_support(&fx, 1);
        let out = fx.arena.create(64, TensorFormat::F32, UNBOUNDED_REF_COUNT);
        let actor = node(&fx, "kernel-a", StaticKernel::new("Fill-0", vec![64]))
            .with_fan_in(0, 1)
            .with_outputs(vec![out])
            .with_result_arrows(vec![ResultArrow {
                from_output_index: 0,
                target_index: 0,
            }]);
        let aid = fx.registry.spawn(actor, true);

        let ctx = Arc::new(PassContext::new(1, GraphExecutionStrategy::Pipeline));
        fx.registry
            .send(
                &aid,
                OpMessage::RunOpControl {
                    from: None,
                    context: ctx.clone(),
                },
                false,
            )
            .unwrap();
        ctx.wait().await.unwrap();
        assert_eq!(fx.sink.lock().get(&1).cloned().unwrap(), vec![out]);
        // Result tensors are unbounded; memory stays resident for the caller.
        assert!(fx.arena.ptr(out).unwrap().is_some());
        fx.registry.terminate_all().await;
    }

    #[tokio::test]
    async fn test_arrival_order_does_not_matter() {
        let fx = fixture();
        spawn_support(&fx, 1);
        let in0 = fx.arena.create(32, TensorFormat::F32, UNBOUNDED_REF_COUNT);
        let in1 = fx.arena.create(32, TensorFormat::F32, UNBOUNDED_REF_COUNT);
        fx.device.allocate_memory(&fx.arena, in0, 32).unwrap();
        fx.device.allocate_memory(&fx.arena, in1, 32).unwrap();
        let out = fx.arena.create(32, TensorFormat::F32, UNBOUNDED_REF_COUNT);
        let actor = node(&fx, "kernel-add", StaticKernel::new("Add-0", vec![32]))
            .with_fan_in(2, 1)
            .with_outputs(vec![out])
            .with_result_arrows(vec![ResultArrow {
                from_output_index: 0,
                target_index: 0,
            }]);
        let aid = fx.registry.spawn(actor, true);

        let ctx = Arc::new(PassContext::new(4, GraphExecutionStrategy::Pipeline));
        // Control first, then the data inputs in reverse slot order.
        fx.registry
            .send(
                &aid,
                OpMessage::RunOpControl {
                    from: None,
                    context: ctx.clone(),
                },
                false,
            )
            .unwrap();
        for slot in [1usize, 0] {
            fx.registry
                .send(
                    &aid,
                    OpMessage::RunOpData {
                        data: OpData {
                            index: slot,
                            tensor: if slot == 0 { in0 } else { in1 },
                        },
                        context: ctx.clone(),
                    },
                    false,
                )
                .unwrap();
        }
        ctx.wait().await.unwrap();
        assert_eq!(fx.sink.lock().get(&4).cloned().unwrap(), vec![out]);
        fx.registry.terminate_all().await;
    }

    #[tokio::test]
    async fn test_launch_failure_fails_pass_once_and_sends_nothing() {
        let fx = fixture();
        spawn_support(&fx, 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        struct Downstream {
            aid: Aid,
            seen: Arc<Mutex<Vec<&'static str>>>,
        }
        #[async_trait]
        impl Actor for Downstream {
            fn aid(&self) -> &Aid {
                &self.aid
            }
            async fn handle(&mut self, msg: OpMessage) -> Result<()> {
                self.seen.lock().push(msg.name());
                Ok(())
            }
        }
        let downstream = fx.registry.spawn(
            Downstream {
                aid: Aid::local("kernel-downstream"),
                seen: seen.clone(),
            },
            true,
        );

        let out = fx.arena.create(16, TensorFormat::F32, 1);
        let actor = node(
            &fx,
            "kernel-bad",
            StaticKernel::new("Bad-0", vec![16]).with_compute(|_| false),
        )
        .with_fan_in(0, 1)
        .with_outputs(vec![out])
        .with_data_arrows(vec![DataArrow {
            from_output_index: 0,
            to: downstream,
            to_input_index: 0,
        }]);
        let aid = fx.registry.spawn(actor, true);

        let ctx = Arc::new(PassContext::new(9, GraphExecutionStrategy::Pipeline));
        fx.registry
            .send(
                &aid,
                OpMessage::RunOpControl {
                    from: None,
                    context: ctx.clone(),
                },
                false,
            )
            .unwrap();
        let err = ctx.wait().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Device(DeviceError::LaunchFailed { .. })));
        fx.registry.terminate_all().await;
        assert!(seen.lock().is_empty());
        assert!(fx.sink.lock().is_empty());
    }

    #[tokio::test]
    async fn test_free_request_precedes_every_output() {
        // One spy actor stands in for the memory manager, the collector
        // and the downstream consumers, so the order of everything this
        // node emits is observable in a single mailbox.
        let fx = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        struct Spy {
            aid: Aid,
            registry: Arc<ActorRegistry>,
            seen: Arc<Mutex<Vec<&'static str>>>,
        }
        #[async_trait]
        impl Actor for Spy {
            fn aid(&self) -> &Aid {
                &self.aid
            }
            async fn handle(&mut self, msg: OpMessage) -> Result<()> {
                self.seen.lock().push(msg.name());
                if let OpMessage::AllocateRequest {
                    reply_to, context, ..
                } = msg
                {
                    self.registry
                        .send(&reply_to, OpMessage::MemoryAllocFinished { context }, false)?;
                }
                Ok(())
            }
        }
        let spy = fx.registry.spawn(
            Spy {
                aid: Aid::local("spy"),
                registry: fx.registry.clone(),
                seen: seen.clone(),
            },
            true,
        );

        // The spy acknowledges allocation without doing it, so the output
        // must already be resident for the launch to go through.
        let out = fx.arena.create(16, TensorFormat::F32, UNBOUNDED_REF_COUNT);
        fx.device.allocate_memory(&fx.arena, out, 16).unwrap();
        let actor = node(&fx, "kernel-spied", StaticKernel::new("Relu-0", vec![16]))
            .with_fan_in(0, 1)
            .with_outputs(vec![out])
            .with_memory_manager(spy.clone())
            .with_output_collector(spy.clone())
            .with_result_arrows(vec![ResultArrow {
                from_output_index: 0,
                target_index: 0,
            }])
            .with_data_arrows(vec![DataArrow {
                from_output_index: 0,
                to: spy.clone(),
                to_input_index: 0,
            }])
            .with_control_arrows(vec![ControlArrow { to: spy.clone() }]);
        let aid = fx.registry.spawn(actor, true);

        let ctx = Arc::new(PassContext::new(2, GraphExecutionStrategy::Pipeline));
        fx.registry
            .send(
                &aid,
                OpMessage::RunOpControl {
                    from: None,
                    context: ctx,
                },
                false,
            )
            .unwrap();
        // The reply hop through the spy is asynchronous; wait for the
        // full emission before tearing the actors down.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while seen.lock().len() < 5 && std::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        fx.registry.terminate_all().await;

        assert_eq!(
            seen.lock().as_slice(),
            [
                "AllocateRequest",
                "FreeRequest",
                "CollectOutput",
                "RunOpData",
                "RunOpControl"
            ]
        );
    }

    #[tokio::test]
    async fn test_outputs_wait_for_debug_ack() {
        let fx = fixture();
        spawn_support(&fx, 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        struct DebugSpy {
            aid: Aid,
            registry: Arc<ActorRegistry>,
            seen: Arc<Mutex<Vec<&'static str>>>,
        }
        #[async_trait]
        impl Actor for DebugSpy {
            fn aid(&self) -> &Aid {
                &self.aid
            }
            async fn handle(&mut self, msg: OpMessage) -> Result<()> {
                self.seen.lock().push(msg.name());
                if let OpMessage::DebugReq {
                    reply_to, context, ..
                } = msg
                {
                    self.registry
                        .send(&reply_to, OpMessage::DebugFinished { context }, false)?;
                }
                Ok(())
            }
        }
        let spy = fx.registry.spawn(
            DebugSpy {
                aid: Aid::local("debug-spy"),
                registry: fx.registry.clone(),
                seen: seen.clone(),
            },
            true,
        );

        let out = fx.arena.create(16, TensorFormat::F32, UNBOUNDED_REF_COUNT);
        let actor = node(&fx, "kernel-traced", StaticKernel::new("Tanh-0", vec![16]))
            .with_fan_in(0, 1)
            .with_outputs(vec![out])
            .with_debug_target(spy.clone())
            .with_output_collector(spy)
            .with_result_arrows(vec![ResultArrow {
                from_output_index: 0,
                target_index: 0,
            }]);
        let aid = fx.registry.spawn(actor, true);

        let ctx = Arc::new(PassContext::new(5, GraphExecutionStrategy::Pipeline));
        fx.registry
            .send(
                &aid,
                OpMessage::RunOpControl {
                    from: None,
                    context: ctx,
                },
                false,
            )
            .unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while seen.lock().len() < 2 && std::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        fx.registry.terminate_all().await;

        // The result only leaves after the debug acknowledgement came back.
        assert_eq!(seen.lock().as_slice(), ["DebugReq", "CollectOutput"]);
    }

    #[tokio::test]
    async fn test_erasing_unknown_pass_keeps_other_bookkeeping() {
        let fx = fixture();
        let mut actor =
            node(&fx, "kernel-erase", StaticKernel::new("Relu-0", vec![16])).with_fan_in(1, 0);
        actor.input_op_datas.entry(3).or_default().push(OpData {
            index: 0,
            tensor: TensorHandle(0),
        });

        actor.erase_input(7);
        assert!(actor.input_op_datas.contains_key(&3));
        actor.erase_input(3);
        assert!(actor.input_op_datas.is_empty());
    }

    #[tokio::test]
    async fn test_execute_step_runs_inline() {
        let fx = fixture();
        let input = fx.arena.create(32, TensorFormat::F32, 1);
        fx.device.allocate_memory(&fx.arena, input, 32).unwrap();
        let out = fx.arena.create(32, TensorFormat::F32, UNBOUNDED_REF_COUNT);
        let mut actor = node(&fx, "kernel-step", StaticKernel::new("Square-0", vec![32]))
            .with_fan_in(1, 0)
            .with_outputs(vec![out]);

        let ctx = Arc::new(PassContext::new(1, GraphExecutionStrategy::Step));
        actor.push_input_tensor(0, input).unwrap();
        actor.execute_step(&ctx).unwrap();
        assert!(!ctx.is_failed());
        // The sole consumer ran, so the input buffer went back.
        assert_eq!(fx.arena.ptr(input).unwrap(), None);
        assert!(fx.arena.ptr(out).unwrap().is_some());
    }
}
