//! Graph-output collector actor.
//!
//! Terminal nodes send their result tensors here instead of (or in
//! addition to) downstream kernels. When every expected output slot of a
//! pass is filled the collector publishes the output vector to the shared
//! sink and resolves the pass, which is what the driver's await unblocks
//! on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use device::TensorHandle;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::actor::Actor;
use crate::messages::{Aid, OpMessage};
use crate::{Result, RuntimeError};

/// Completed pass outputs keyed by sequential number, shared with the
/// driver.
pub type OutputSink = Arc<Mutex<HashMap<u64, Vec<TensorHandle>>>>;

struct PassOutputs {
    slots: Vec<Option<TensorHandle>>,
    filled: usize,
}

/// Collects the graph's output tensors for each pass.
pub struct OutputActor {
    aid: Aid,
    expected: usize,
    pending: HashMap<u64, PassOutputs>,
    sink: OutputSink,
}

impl OutputActor {
    pub const NAME: &'static str = "output-collector";

    pub fn new(expected: usize, sink: OutputSink) -> Self {
        Self {
            aid: Aid::local(Self::NAME),
            expected,
            pending: HashMap::new(),
            sink,
        }
    }
}

#[async_trait]
impl Actor for OutputActor {
    fn aid(&self) -> &Aid {
        &self.aid
    }

    async fn handle(&mut self, msg: OpMessage) -> Result<()> {
        let (node, output_index, target_index, tensor, context) = match msg {
            OpMessage::CollectOutput {
                node,
                output_index,
                target_index,
                tensor,
                context,
            } => (node, output_index, target_index, tensor, context),
            other => {
                warn!(actor = %self.aid, message = other.name(), "unexpected message");
                return Ok(());
            }
        };

        if context.is_failed() {
            // Late result from a pass that already failed.
            return Ok(());
        }
        if target_index >= self.expected {
            let err = RuntimeError::configuration(format!(
                "output slot {target_index} out of range ({} outputs), from {node} output {output_index}",
                self.expected
            ));
            context.set_failed(err.clone());
            return Err(err);
        }

        let seq = context.sequential_num();
        let expected = self.expected;
        let pass = self.pending.entry(seq).or_insert_with(|| PassOutputs {
            slots: vec![None; expected],
            filled: 0,
        });
        if pass.slots[target_index].replace(tensor).is_none() {
            pass.filled += 1;
        } else {
            warn!(sequential_num = seq, target_index, "output slot filled twice");
        }
        debug!(
            sequential_num = seq,
            target_index,
            filled = pass.filled,
            expected = self.expected,
            from = %node,
            "output collected"
        );

        if pass.filled == self.expected {
            let pass = self.pending.remove(&seq).unwrap_or(PassOutputs {
                slots: Vec::new(),
                filled: 0,
            });
            let outputs: Vec<TensorHandle> = pass.slots.into_iter().flatten().collect();
            self.sink.lock().insert(seq, outputs);
            context.set_success();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::{GraphExecutionStrategy, PassContext};

    fn collect(actor: &mut OutputActor, seq_ctx: &Arc<PassContext>, target: usize, tensor: u32) -> Result<()> {
        futures::executor::block_on(actor.handle(OpMessage::CollectOutput {
            node: Aid::local("kernel-x"),
            output_index: 0,
            target_index: target,
            tensor: TensorHandle(tensor),
            context: Arc::clone(seq_ctx),
        }))
    }

    #[test]
    fn test_out_of_order_collection_completes_pass() {
        let sink: OutputSink = Arc::new(Mutex::new(HashMap::new()));
        let mut actor = OutputActor::new(2, sink.clone());
        let ctx = Arc::new(PassContext::new(7, GraphExecutionStrategy::Pipeline));

        collect(&mut actor, &ctx, 1, 11).unwrap();
        assert!(sink.lock().is_empty());
        collect(&mut actor, &ctx, 0, 10).unwrap();

        assert_eq!(
            sink.lock().get(&7).cloned().unwrap(),
            vec![TensorHandle(10), TensorHandle(11)]
        );
        futures::executor::block_on(ctx.wait()).unwrap();
    }

    #[test]
    fn test_failed_pass_results_are_dropped() {
        let sink: OutputSink = Arc::new(Mutex::new(HashMap::new()));
        let mut actor = OutputActor::new(1, sink.clone());
        let ctx = Arc::new(PassContext::new(8, GraphExecutionStrategy::Pipeline));
        ctx.set_failed(RuntimeError::configuration("boom"));

        collect(&mut actor, &ctx, 0, 5).unwrap();
        assert!(sink.lock().is_empty());
    }

    #[test]
    fn test_out_of_range_slot_is_configuration_error() {
        let sink: OutputSink = Arc::new(Mutex::new(HashMap::new()));
        let mut actor = OutputActor::new(1, sink);
        let ctx = Arc::new(PassContext::new(9, GraphExecutionStrategy::Pipeline));

        let err = collect(&mut actor, &ctx, 3, 5).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration { .. }));
        assert!(ctx.is_failed());
    }
}
