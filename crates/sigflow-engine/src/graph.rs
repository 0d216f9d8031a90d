//! Master-owned node topology
//!
//! Connection state lives here, not on the nodes: only the master thread
//! mutates the graph, and process threads see the results through the
//! routing the scheduler publishes.
//!
//! Tracks:
//! - Inputs, joint inputs and the output-node multiset per node
//! - The consumer list (consumer flag and no outputs)
//! - The master node list, unscheduled nodes with flow jobs at the head
//! - Boundary and probe job lists

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use sigflow_core::{EngineError, EngineResult, MAX_TICK_STAMP, NodeId};

use crate::job::ProbeJob;
use crate::node::{EngineNode, Routing, TimedAction, TimedJob, insert_timed};
use crate::queue::Garbage;

/// Output stream of a node feeding an input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Source {
    pub node: NodeId,
    pub stream: usize,
}

pub(crate) struct NodeTopo {
    pub node: Arc<EngineNode>,
    pub inputs: Vec<Option<Source>>,
    /// Inputs with virtual nodes resolved, set by the scheduler
    pub real_inputs: Vec<Option<Source>>,
    pub jinputs: Vec<Vec<Source>>,
    pub jreal: Vec<Vec<Source>>,
    /// Connections per output stream
    pub fan_out: Vec<u32>,
    /// One entry per connection into another node
    pub output_nodes: Vec<NodeId>,
    pub is_consumer: bool,
    pub local_active: u64,
    pub update_suspend: bool,
    pub in_suspend_call: bool,
    pub sched_tag: bool,
    pub sched_recurse_tag: bool,
    pub sched_leaf_level: usize,
    pub cleared_ostreams: bool,
    pub boundary_jobs: VecDeque<TimedJob>,
    /// Most recent request last
    pub probe_jobs: Vec<ProbeJob>,
}

impl NodeTopo {
    fn new(node: Arc<EngineNode>) -> Self {
        let class = node.class;
        Self {
            node,
            inputs: vec![None; class.n_istreams],
            real_inputs: vec![None; class.n_istreams],
            jinputs: vec![Vec::new(); class.n_jstreams],
            jreal: vec![Vec::new(); class.n_jstreams],
            fan_out: vec![0; class.n_ostreams],
            output_nodes: Vec::new(),
            is_consumer: false,
            local_active: 0,
            update_suspend: true,
            in_suspend_call: false,
            sched_tag: false,
            sched_recurse_tag: false,
            sched_leaf_level: 0,
            cleared_ostreams: false,
            boundary_jobs: VecDeque::new(),
            probe_jobs: Vec::new(),
        }
    }

    /// Consumer flag set and nothing connected to the outputs
    pub fn is_consumer(&self) -> bool {
        self.is_consumer && self.output_nodes.is_empty()
    }

    pub fn is_virtual(&self) -> bool {
        self.node.class.is_virtual()
    }
}

// ============ Master Node List ============

#[derive(Default)]
struct Links {
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

/// Doubly linked list over integrated nodes
#[derive(Default)]
struct MasterNodeList {
    head: Option<NodeId>,
    tail: Option<NodeId>,
    links: HashMap<NodeId, Links>,
}

impl MasterNodeList {
    fn push_back(&mut self, id: NodeId) {
        let prev = self.tail;
        match prev {
            Some(tail) => {
                if let Some(l) = self.links.get_mut(&tail) {
                    l.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.links.insert(id, Links { prev, next: None });
    }

    fn push_front(&mut self, id: NodeId) {
        let next = self.head;
        match next {
            Some(head) => {
                if let Some(l) = self.links.get_mut(&head) {
                    l.prev = Some(id);
                }
            }
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.links.insert(id, Links { prev: None, next });
    }

    fn remove(&mut self, id: NodeId) -> bool {
        let Some(Links { prev, next }) = self.links.remove(&id) else {
            return false;
        };
        match prev {
            Some(p) => {
                if let Some(l) = self.links.get_mut(&p) {
                    l.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(l) = self.links.get_mut(&n) {
                    l.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        true
    }

    fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.head, move |id| self.links.get(id).and_then(|l| l.next))
    }
}

// ============ Graph ============

pub(crate) struct Graph {
    nodes: HashMap<NodeId, NodeTopo>,
    mnl: MasterNodeList,
    consumers: Vec<NodeId>,
    pub boundary_nodes: Vec<NodeId>,
    pub probe_nodes: Vec<NodeId>,
    pub need_reflow: bool,
    pub new_boundary_jobs: bool,
    /// Objects to hand to the user thread
    pub garbage: Vec<Garbage>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            mnl: MasterNodeList::default(),
            consumers: Vec::new(),
            boundary_nodes: Vec::new(),
            probe_nodes: Vec::new(),
            need_reflow: false,
            new_boundary_jobs: false,
            garbage: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Topology of an integrated node; panics on unknown ids
    pub fn topo(&self, id: NodeId) -> &NodeTopo {
        &self.nodes[&id]
    }

    pub fn topo_mut(&mut self, id: NodeId) -> &mut NodeTopo {
        self.nodes.get_mut(&id).expect("topology entry must exist for integrated node")
    }

    pub fn get(&self, node: &EngineNode) -> EngineResult<&NodeTopo> {
        node.ensure_integrated()?;
        self.nodes.get(&node.id).ok_or(EngineError::NotIntegrated(node.id))
    }

    fn get_mut(&mut self, node: &EngineNode) -> EngineResult<&mut NodeTopo> {
        node.ensure_integrated()?;
        self.nodes.get_mut(&node.id).ok_or(EngineError::NotIntegrated(node.id))
    }

    pub fn consumers(&self) -> &[NodeId] {
        &self.consumers
    }

    fn add_consumer(&mut self, id: NodeId) {
        if !self.consumers.contains(&id) {
            self.consumers.push(id);
        }
    }

    fn remove_consumer(&mut self, id: NodeId) {
        if let Some(pos) = self.consumers.iter().position(|&c| c == id) {
            self.consumers.remove(pos);
        }
    }

    // ============ Node Lifecycle ============

    pub fn integrate(&mut self, node: Arc<EngineNode>, current: u64) -> EngineResult<()> {
        if node.is_discarded() {
            return Err(EngineError::Discarded(node.id));
        }
        if node.is_integrated() || self.nodes.contains_key(&node.id) {
            return Err(EngineError::AlreadyIntegrated(node.id));
        }
        let id = node.id;
        node.set_integrated(true);
        node.set_counter(current);
        node.set_needs_reset(true);
        self.nodes.insert(id, NodeTopo::new(node));
        self.mnl.push_back(id);
        self.need_reflow = true;
        Ok(())
    }

    pub fn kill_inputs(&mut self, node: &EngineNode) -> EngineResult<()> {
        self.get(node)?;
        self.disconnect_all_inputs(node.id);
        self.need_reflow = true;
        Ok(())
    }

    pub fn kill_outputs(&mut self, node: &EngineNode) -> EngineResult<()> {
        self.get(node)?;
        self.disconnect_all_outputs(node.id);
        self.need_reflow = true;
        Ok(())
    }

    fn disconnect_all_inputs(&mut self, id: NodeId) {
        let n_istreams = self.topo(id).inputs.len();
        for istream in 0..n_istreams {
            if self.topo(id).inputs[istream].is_some() {
                self.idisconnect(id, istream);
            }
        }
        let n_jstreams = self.topo(id).jinputs.len();
        for jstream in 0..n_jstreams {
            while let Some(last) = self.topo(id).jinputs[jstream].len().checked_sub(1) {
                self.jdisconnect_at(id, jstream, last);
            }
        }
    }

    fn disconnect_all_outputs(&mut self, id: NodeId) {
        while let Some(&dest) = self.topo(id).output_nodes.first() {
            self.disconnect_node_outputs(id, dest);
        }
    }

    /// Remove a node; the schedule must already be discarded
    pub fn discard(&mut self, node: &EngineNode) -> EngineResult<()> {
        self.get(node)?;
        let id = node.id;
        self.disconnect_all_inputs(id);
        self.disconnect_all_outputs(id);
        self.remove_consumer(id);
        self.mnl.remove(id);
        node.set_counter(MAX_TICK_STAMP);
        node.set_integrated(false);
        node.mark_discarded();
        node.set_scheduled(false);

        {
            let exec = node.exec.lock();
            let mut trash = exec.trash.borrow_mut();
            for job in exec.flow_jobs.borrow_mut().drain(..) {
                if let TimedAction::Access(access) = job.action {
                    trash.push(Garbage::Access(access));
                }
            }
            self.garbage.extend(trash.drain(..));
            if let Some(module) = exec.module.borrow_mut().take() {
                self.garbage.push(Garbage::Module(module));
            }
        }

        if let Some(mut topo) = self.nodes.remove(&id) {
            for probe in topo.probe_jobs.drain(..).rev() {
                self.garbage.push(Garbage::Probe(probe));
            }
            for job in topo.boundary_jobs.drain(..) {
                if let TimedAction::Access(access) = job.action {
                    self.garbage.push(Garbage::Access(access));
                }
            }
            self.garbage.push(Garbage::Node(topo.node));
        }
        self.probe_nodes.retain(|&p| p != id);
        self.boundary_nodes.retain(|&b| b != id);
        self.need_reflow = true;
        Ok(())
    }

    pub fn set_consumer(&mut self, node: &EngineNode, is_consumer: bool) -> EngineResult<()> {
        let topo = self.get_mut(node)?;
        let was_consumer = topo.is_consumer();
        topo.is_consumer = is_consumer;
        let now_consumer = topo.is_consumer();
        if was_consumer != now_consumer {
            if now_consumer {
                self.add_consumer(node.id);
            } else {
                self.remove_consumer(node.id);
            }
            self.propagate_update_suspend(node.id);
            self.need_reflow = true;
        }
        Ok(())
    }

    pub fn force_reset(&mut self, node: &EngineNode, current: u64) -> EngineResult<()> {
        self.get(node)?;
        node.set_counter(current);
        node.set_needs_reset(true);
        Ok(())
    }

    // ============ Connections ============

    fn link_source(&mut self, src: NodeId, ostream: usize, dest: NodeId) {
        let was_consumer = self.topo(src).is_consumer();
        let topo = self.topo_mut(src);
        topo.fan_out[ostream] += 1;
        topo.output_nodes.push(dest);
        self.propagate_update_suspend(src);
        if was_consumer && !self.topo(src).is_consumer() {
            self.remove_consumer(src);
        }
    }

    fn unlink_source(&mut self, src: NodeId, ostream: usize, dest: NodeId) {
        let was_consumer = self.topo(src).is_consumer();
        let topo = self.topo_mut(src);
        topo.fan_out[ostream] = topo.fan_out[ostream].saturating_sub(1);
        if let Some(pos) = topo.output_nodes.iter().position(|&n| n == dest) {
            topo.output_nodes.remove(pos);
        }
        self.propagate_update_suspend(src);
        if !was_consumer && self.topo(src).is_consumer() {
            self.add_consumer(src);
        }
    }

    pub fn connect(&mut self, src: &EngineNode, ostream: usize, dest: &EngineNode, istream: usize) -> EngineResult<()> {
        self.get(src)?;
        let topo = self.get(dest)?;
        if topo.inputs[istream].is_some() {
            return Err(EngineError::InputConnected {
                node: dest.id,
                istream,
            });
        }
        self.topo_mut(dest.id).inputs[istream] = Some(Source {
            node: src.id,
            stream: ostream,
        });
        dest.set_has_source(istream, true);
        self.link_source(src.id, ostream, dest.id);
        self.need_reflow = true;
        Ok(())
    }

    pub fn jconnect(&mut self, src: &EngineNode, ostream: usize, dest: &EngineNode, jstream: usize) -> EngineResult<()> {
        self.get(src)?;
        self.get(dest)?;
        self.topo_mut(dest.id).jinputs[jstream].push(Source {
            node: src.id,
            stream: ostream,
        });
        self.link_source(src.id, ostream, dest.id);
        self.need_reflow = true;
        Ok(())
    }

    pub fn disconnect(&mut self, dest: &EngineNode, istream: usize) -> EngineResult<()> {
        let topo = self.get(dest)?;
        if topo.inputs[istream].is_none() {
            return Err(EngineError::InputNotConnected {
                node: dest.id,
                istream,
            });
        }
        self.idisconnect(dest.id, istream);
        self.need_reflow = true;
        Ok(())
    }

    /// Remove a joint connection; returns false if it does not exist
    pub fn jdisconnect(&mut self, dest: &EngineNode, jstream: usize, src: &EngineNode, ostream: usize) -> EngineResult<bool> {
        let topo = self.get(dest)?;
        let wanted = Source {
            node: src.id,
            stream: ostream,
        };
        match topo.jinputs[jstream].iter().position(|&s| s == wanted) {
            Some(con) => {
                self.jdisconnect_at(dest.id, jstream, con);
                self.need_reflow = true;
                Ok(true)
            }
            None => {
                log::warn!(
                    "jdisconnect({}:{} -/- {}:j{}): no such connection",
                    src.id,
                    ostream,
                    dest.id,
                    jstream
                );
                Ok(false)
            }
        }
    }

    fn idisconnect(&mut self, dest: NodeId, istream: usize) {
        let topo = self.topo_mut(dest);
        let Some(src) = topo.inputs[istream].take() else {
            return;
        };
        topo.node.set_has_source(istream, false);
        self.unlink_source(src.node, src.stream, dest);
    }

    fn jdisconnect_at(&mut self, dest: NodeId, jstream: usize, con: usize) {
        let src = self.topo_mut(dest).jinputs[jstream].swap_remove(con);
        self.unlink_source(src.node, src.stream, dest);
    }

    fn disconnect_node_outputs(&mut self, src: NodeId, dest: NodeId) {
        let n_istreams = self.topo(dest).inputs.len();
        for istream in 0..n_istreams {
            if self.topo(dest).inputs[istream].is_some_and(|s| s.node == src) {
                self.idisconnect(dest, istream);
            }
        }
        let n_jstreams = self.topo(dest).jinputs.len();
        for jstream in 0..n_jstreams {
            let mut con = 0;
            while con < self.topo(dest).jinputs[jstream].len() {
                if self.topo(dest).jinputs[jstream][con].node == src {
                    self.jdisconnect_at(dest, jstream, con);
                } else {
                    con += 1;
                }
            }
        }
    }

    /// Mark `id` and everything upstream for suspension recomputation
    pub fn propagate_update_suspend(&mut self, id: NodeId) {
        let topo = self.topo_mut(id);
        if topo.update_suspend {
            return;
        }
        topo.update_suspend = true;
        let mut upstream: Vec<NodeId> = topo.inputs.iter().flatten().map(|s| s.node).collect();
        upstream.extend(topo.jinputs.iter().flatten().map(|s| s.node));
        for src in upstream {
            self.propagate_update_suspend(src);
        }
    }

    // ============ Suspension Jobs ============

    pub fn suspend(&mut self, node: &EngineNode, stamp: u64) -> EngineResult<()> {
        if self.get(node)?.local_active < stamp {
            self.propagate_update_suspend(node.id);
            self.topo_mut(node.id).local_active = stamp;
            node.set_needs_reset(true);
            self.need_reflow = true;
        }
        Ok(())
    }

    pub fn resume(&mut self, node: &EngineNode, stamp: u64) -> EngineResult<()> {
        if self.get(node)?.local_active > stamp {
            self.propagate_update_suspend(node.id);
            self.topo_mut(node.id).local_active = stamp;
            node.set_needs_reset(true);
            self.need_reflow = true;
        }
        Ok(())
    }

    // ============ Timed Jobs ============

    pub fn add_flow_job(&mut self, node: &EngineNode, job: TimedJob) -> EngineResult<()> {
        self.get(node)?;
        {
            let exec = node.exec.lock();
            insert_timed(&mut exec.flow_jobs.borrow_mut(), job);
        }
        self.node_changed(node.id);
        Ok(())
    }

    pub fn add_boundary_job(&mut self, node: &EngineNode, job: TimedJob) -> EngineResult<()> {
        let topo = self.get_mut(node)?;
        let was_empty = topo.boundary_jobs.is_empty();
        insert_timed(&mut topo.boundary_jobs, job);
        if was_empty {
            self.boundary_nodes.push(node.id);
        }
        self.new_boundary_jobs = true;
        Ok(())
    }

    /// Next boundary job due by `tick_stamp`
    pub fn pop_boundary_job(&mut self, id: NodeId, tick_stamp: u64) -> Option<TimedJob> {
        let topo = self.nodes.get_mut(&id)?;
        if topo.boundary_jobs.front()?.tick_stamp > tick_stamp {
            return None;
        }
        let job = topo.boundary_jobs.pop_front();
        if topo.boundary_jobs.is_empty() {
            self.boundary_nodes.retain(|&b| b != id);
        }
        job
    }

    pub fn add_probe_job(&mut self, node: &EngineNode, probe: ProbeJob) -> EngineResult<()> {
        let topo = self.get_mut(node)?;
        if topo.probe_jobs.is_empty() {
            self.probe_nodes.push(node.id);
        }
        self.topo_mut(node.id).probe_jobs.push(probe);
        Ok(())
    }

    /// Most recent probe request of `id`
    pub fn pop_probe_job(&mut self, id: NodeId) -> Option<ProbeJob> {
        let topo = self.nodes.get_mut(&id)?;
        let probe = topo.probe_jobs.pop();
        if topo.probe_jobs.is_empty() {
            self.probe_nodes.retain(|&p| p != id);
        }
        probe
    }

    // ============ Master Node List ============

    fn is_unscheduled_tjob_node(&self, id: NodeId) -> bool {
        let topo = self.topo(id);
        !topo.sched_tag && topo.node.has_flow_jobs()
    }

    /// Reorder after flow job or schedule changes; collects executed jobs
    pub fn node_changed(&mut self, id: NodeId) {
        if !self.mnl.remove(id) {
            return;
        }
        if self.is_unscheduled_tjob_node(id) {
            self.mnl.push_front(id);
        } else {
            self.mnl.push_back(id);
        }
        let node = Arc::clone(&self.topo(id).node);
        let exec = node.exec.lock();
        self.garbage.extend(exec.trash.borrow_mut().drain(..));
    }

    /// Leading run of unscheduled nodes with pending flow jobs
    pub fn unscheduled_tjob_nodes(&self) -> Vec<NodeId> {
        self.mnl
            .iter()
            .take_while(|&id| self.is_unscheduled_tjob_node(id))
            .collect()
    }

    #[cfg(test)]
    pub fn mnl_order(&self) -> Vec<NodeId> {
        self.mnl.iter().collect()
    }

    /// Clear scheduler bookkeeping and routing left behind by an aborted query
    pub fn reset_sched_tags(&mut self) {
        for topo in self.nodes.values_mut() {
            topo.sched_recurse_tag = false;
            topo.in_suspend_call = false;
            if !topo.sched_tag {
                let exec = topo.node.exec.lock();
                *exec.routing.borrow_mut() = Routing::default();
            }
        }
    }

    pub fn take_garbage(&mut self) -> Vec<Garbage> {
        std::mem::take(&mut self.garbage)
    }
}
