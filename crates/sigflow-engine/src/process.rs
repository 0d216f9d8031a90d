//! Node processing
//!
//! A node renders from its counter up to the block's final stamp:
//! - Sources are pulled first, recursively and under their own locks
//! - The range is split at flow job stamps and activation boundaries
//! - Suspended ranges yield silence and mark the node for reset
//!
//! A node that is already on the current thread's stack (a feedback path)
//! is not re-entered; readers see its previous block's output.

use std::sync::Arc;

use sigflow_core::{MAX_TICK_STAMP, Sample};

use crate::const_values::ConstValueCache;
use crate::module::{ProcessContext, StreamIo};
use crate::node::{EngineNode, NodeExec, RealInput, Routing, TimedAction};
use crate::pqueue::BlockInfo;
use crate::queue::Garbage;
use crate::schedule::Work;

/// Process one popped item; returns collected trash
pub(crate) fn process_work(work: &Work, block: BlockInfo, consts: &ConstValueCache) -> Vec<Garbage> {
    let mut trash = Vec::new();
    match work {
        Work::Node(node) => {
            process_node(node, block, consts);
            collect_trash(node, &mut trash);
        }
        Work::Cycle(group) => {
            let _cycle = group.lock.lock();
            for node in &group.nodes {
                process_node(node, block, consts);
            }
            for node in &group.nodes {
                collect_trash(node, &mut trash);
            }
        }
    }
    trash
}

fn collect_trash(node: &EngineNode, trash: &mut Vec<Garbage>) {
    let exec = node.exec.lock();
    trash.append(&mut exec.trash.borrow_mut());
}

/// Bring a node up to `block.final_counter`
pub(crate) fn process_node(node: &Arc<EngineNode>, block: BlockInfo, consts: &ConstValueCache) {
    let group = node.group();
    let _cycle = group.as_ref().map(|lock| lock.lock());
    let exec = node.exec.lock();
    if exec.busy.get() || node.counter() >= block.final_counter {
        return;
    }
    exec.busy.set(true);
    process_locked(node, &exec, block, consts);
    exec.busy.set(false);
}

/// Apply due flow jobs and a pending reset; returns the next flow job stamp
pub(crate) fn update_node_state(node: &EngineNode, exec: &NodeExec, max_tick: u64) -> u64 {
    if node.needs_reset() && !node.is_suspended(max_tick) {
        if let Some(module) = exec.module.borrow_mut().as_mut() {
            module.reset();
        }
        node.set_needs_reset(false);
    }

    let mut flow_jobs = exec.flow_jobs.borrow_mut();
    while flow_jobs.front().is_some_and(|job| job.tick_stamp <= max_tick) {
        let Some(job) = flow_jobs.pop_front() else {
            break;
        };
        if let TimedAction::Access(mut access) = job.action {
            if let Some(module) = exec.module.borrow_mut().as_mut() {
                access(module.as_mut());
            }
            exec.trash.borrow_mut().push(Garbage::Access(access));
        }
    }
    flow_jobs.front().map_or(MAX_TICK_STAMP, |job| job.tick_stamp)
}

fn process_locked(node: &Arc<EngineNode>, exec: &NodeExec, block: BlockInfo, consts: &ConstValueCache) {
    let routing = exec.routing.borrow();
    pull_sources(node, &routing, block, consts);

    let mut counter = node.counter().max(block.current);
    let mut first = true;
    while counter < block.final_counter {
        let next_flow = update_node_state(node, exec, counter);
        let mut new_counter = next_flow.min(block.final_counter);
        let next_active = node.next_active();
        if next_active > counter {
            new_counter = new_counter.min(next_active);
        }
        let diff = (counter - block.current) as usize;
        let n_values = (new_counter - counter) as usize;

        let mut io_ref = exec.io.borrow_mut();
        let io: &mut StreamIo = &mut io_ref;
        fetch_inputs(node, &routing, io, diff, n_values);
        if first && diff > 0 {
            for output in io.outputs.iter_mut() {
                output[..diff].fill(0.0);
            }
        }
        first = false;

        if node.is_suspended(counter) {
            for output in io.outputs.iter_mut() {
                output[diff..diff + n_values].fill(0.0);
            }
            node.set_needs_reset(true);
        } else {
            if let Some(module) = exec.module.borrow_mut().as_mut() {
                let mut ctx = ProcessContext::new(io, diff, n_values, counter);
                module.process(&mut ctx);
            }
            io.apply_redirects(diff, n_values, consts);
        }

        counter = new_counter;
        node.set_counter(counter);
    }
}

/// Bring every source up to date before reading from it
fn pull_sources(node: &Arc<EngineNode>, routing: &Routing, block: BlockInfo, consts: &ConstValueCache) {
    let inputs = routing.inputs.iter().flatten();
    let jinputs = routing.jinputs.iter().flatten();
    for input in inputs.chain(jinputs) {
        if !Arc::ptr_eq(&input.node, node) {
            process_node(&input.node, block, consts);
        }
    }
}

/// Copy source outputs for `[diff, diff + n_values)` into the input scratch
fn fetch_inputs(node: &Arc<EngineNode>, routing: &Routing, io: &mut StreamIo, diff: usize, n_values: usize) {
    let StreamIo {
        inputs,
        jinputs,
        outputs,
        ..
    } = io;
    let range = diff..diff + n_values;

    for (istream, input) in routing.inputs.iter().enumerate() {
        let dst = &mut inputs[istream][..n_values];
        match input {
            None => dst.fill(0.0),
            Some(src) if Arc::ptr_eq(&src.node, node) => dst.copy_from_slice(&outputs[src.stream][range.clone()]),
            Some(src) => copy_source(src, range.clone(), dst),
        }
    }
    for (jstream, connections) in routing.jinputs.iter().enumerate() {
        for (con, src) in connections.iter().enumerate() {
            let dst = &mut jinputs[jstream][con][..n_values];
            if Arc::ptr_eq(&src.node, node) {
                dst.copy_from_slice(&outputs[src.stream][range.clone()]);
            } else {
                copy_source(src, range.clone(), dst);
            }
        }
    }
}

fn copy_source(src: &RealInput, range: std::ops::Range<usize>, dst: &mut [Sample]) {
    let exec = src.node.exec.lock();
    let io = exec.io.borrow();
    dst.copy_from_slice(&io.outputs[src.stream][range]);
}
