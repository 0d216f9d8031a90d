//! Leveled processing schedule
//!
//! Built by walking the graph from every consumer:
//! - Leaf level of a node = 1 + max leaf level of its inputs
//! - Expensive nodes go first within their level
//! - Feedback cycles become one group, scheduled and processed as a unit
//! - Virtual nodes are resolved to their real sources and never processed

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use sigflow_core::{EngineError, EngineResult, NodeId};

use crate::graph::{Graph, Source};
use crate::node::{EngineNode, RealInput, Routing};

/// Feedback cycle members sharing one group lock
pub(crate) struct CycleGroup {
    pub lock: Arc<ReentrantMutex<()>>,
    pub nodes: Vec<Arc<EngineNode>>,
}

/// Unit of work handed to a process thread
pub(crate) enum Work {
    Node(Arc<EngineNode>),
    Cycle(Arc<CycleGroup>),
}

pub(crate) struct Schedule {
    nodes: Vec<VecDeque<Arc<EngineNode>>>,
    cycles: Vec<Vec<Arc<CycleGroup>>>,
    vnodes: Vec<NodeId>,
    n_items: usize,
    secured: bool,
    cur_leaf_level: usize,
    cur_node: usize,
    cur_cycle: usize,
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}

impl Schedule {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            cycles: Vec::new(),
            vnodes: Vec::new(),
            n_items: 0,
            secured: false,
            cur_leaf_level: 0,
            cur_node: 0,
            cur_cycle: 0,
        }
    }

    pub fn leaf_levels(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_items(&self) -> usize {
        self.n_items
    }

    #[cfg(test)]
    pub fn is_secured(&self) -> bool {
        self.secured
    }

    /// Node ids per level, in hand-out order
    #[cfg(test)]
    pub fn level_ids(&self, level: usize) -> Vec<NodeId> {
        self.nodes
            .get(level)
            .map(|l| l.iter().map(|n| n.id).collect())
            .unwrap_or_default()
    }

    /// Cycle member ids per level
    #[cfg(test)]
    pub fn cycle_ids(&self, level: usize) -> Vec<Vec<NodeId>> {
        self.cycles
            .get(level)
            .map(|l| l.iter().map(|c| c.nodes.iter().map(|n| n.id).collect()).collect())
            .unwrap_or_default()
    }

    // ============ Building ============

    fn grow(&mut self, leaf_level: usize) {
        let ll = (leaf_level + 1).next_power_of_two().max(2);
        if self.nodes.len() < ll {
            self.nodes.resize_with(ll, VecDeque::new);
            self.cycles.resize_with(ll, Vec::new);
        }
    }

    fn schedule_node(&mut self, graph: &mut Graph, id: NodeId, leaf_level: usize) {
        let topo = graph.topo_mut(id);
        topo.sched_leaf_level = leaf_level;
        topo.sched_tag = true;
        topo.cleared_ostreams = false;
        let node = Arc::clone(&topo.node);
        node.set_scheduled(true);
        if node.has_flow_jobs() {
            graph.node_changed(id);
        }
        self.grow(leaf_level);
        if node.class.is_expensive() {
            self.nodes[leaf_level].push_front(node);
        } else {
            self.nodes[leaf_level].push_back(node);
        }
        self.n_items += 1;
    }

    fn schedule_cycle(&mut self, graph: &mut Graph, ids: Vec<NodeId>, leaf_level: usize) {
        let lock = Arc::new(ReentrantMutex::new(()));
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            let topo = graph.topo_mut(id);
            topo.sched_leaf_level = leaf_level;
            topo.sched_tag = true;
            topo.cleared_ostreams = false;
            let node = Arc::clone(&topo.node);
            node.set_scheduled(true);
            node.set_group(Some(Arc::clone(&lock)));
            if node.has_flow_jobs() {
                graph.node_changed(id);
            }
            nodes.push(node);
        }
        log::debug!(
            "scheduled cycle of {} nodes at level {}",
            nodes.len(),
            leaf_level
        );
        self.grow(leaf_level);
        self.cycles[leaf_level].insert(0, Arc::new(CycleGroup { lock, nodes }));
        self.n_items += 1;
    }

    fn schedule_virtual(&mut self, graph: &mut Graph, id: NodeId) {
        let topo = graph.topo_mut(id);
        topo.sched_tag = true;
        topo.cleared_ostreams = false;
        topo.real_inputs.fill(None);
        topo.node.set_scheduled(true);
        self.vnodes.push(id);
        self.n_items += 1;
    }

    /// Unschedule everything; drops all routing references
    pub fn clear(&mut self, graph: &mut Graph) {
        debug_assert!(!self.secured);
        for id in std::mem::take(&mut self.vnodes) {
            if graph.contains(id) {
                let topo = graph.topo_mut(id);
                topo.sched_tag = false;
                topo.node.set_scheduled(false);
            }
        }
        let levels = std::mem::take(&mut self.nodes);
        for node in levels.into_iter().flatten() {
            unschedule_node(graph, &node);
        }
        let cycles = std::mem::take(&mut self.cycles);
        for group in cycles.into_iter().flatten() {
            for node in &group.nodes {
                node.set_group(None);
                unschedule_node(graph, node);
            }
        }
        self.n_items = 0;
        self.cur_leaf_level = 0;
        self.cur_node = 0;
        self.cur_cycle = 0;
    }

    // ============ Iteration ============

    pub fn secure(&mut self) {
        self.secured = true;
        self.cur_leaf_level = self.leaf_levels();
        self.cur_node = 0;
        self.cur_cycle = 0;
    }

    pub fn unsecure(&mut self) {
        self.secured = false;
    }

    /// Rewind for the next block
    pub fn restart(&mut self) {
        debug_assert!(self.secured);
        self.cur_leaf_level = 0;
        self.cur_node = 0;
        self.cur_cycle = 0;
    }

    /// Nothing left to hand out
    pub fn is_exhausted(&self) -> bool {
        self.cur_leaf_level >= self.leaf_levels()
    }

    fn level_done(&self) -> bool {
        let level = self.cur_leaf_level;
        self.cur_node >= self.nodes[level].len() && self.cur_cycle >= self.cycles[level].len()
    }

    fn advance(&mut self) {
        while !self.is_exhausted() && self.level_done() {
            self.cur_leaf_level += 1;
            self.cur_node = 0;
            self.cur_cycle = 0;
        }
    }

    /// Next node; `None` when exhausted or only cycles remain on this level
    pub fn pop_node(&mut self) -> Option<Arc<EngineNode>> {
        loop {
            if self.is_exhausted() {
                return None;
            }
            let level = self.cur_leaf_level;
            if let Some(node) = self.nodes[level].get(self.cur_node) {
                self.cur_node += 1;
                return Some(Arc::clone(node));
            }
            if self.cur_cycle < self.cycles[level].len() {
                return None;
            }
            self.advance();
        }
    }

    /// Next cycle; `None` when exhausted or only nodes remain on this level
    pub fn pop_cycle(&mut self) -> Option<Arc<CycleGroup>> {
        loop {
            if self.is_exhausted() {
                return None;
            }
            let level = self.cur_leaf_level;
            if let Some(group) = self.cycles[level].get(self.cur_cycle) {
                self.cur_cycle += 1;
                return Some(Arc::clone(group));
            }
            if self.cur_node < self.nodes[level].len() {
                return None;
            }
            self.advance();
        }
    }

    pub fn pop_work(&mut self) -> Option<Work> {
        if let Some(node) = self.pop_node() {
            return Some(Work::Node(node));
        }
        self.pop_cycle().map(Work::Cycle)
    }

    // ============ Query ============

    /// Schedule a consumer and everything it depends on
    pub fn schedule_consumer(&mut self, graph: &mut Graph, id: NodeId, current: u64) -> EngineResult<()> {
        if graph.topo(id).sched_tag {
            return Ok(());
        }
        let mut query = Query::default();
        self.query_node(graph, id, &mut query, current)?;
        if query.cycles.is_empty() {
            self.schedule_node(graph, id, query.leaf_level);
            Ok(())
        } else if resolve_cycles(&mut query, id)? {
            self.schedule_cycle(graph, query.cycle_nodes, query.leaf_level);
            Ok(())
        } else {
            let nodes = query.cycles.into_iter().flat_map(|c| c.nodes).collect();
            Err(EngineError::CycleWithoutDelay(nodes))
        }
    }

    fn query_node(&mut self, graph: &mut Graph, id: NodeId, query: &mut Query, current: u64) -> EngineResult<()> {
        graph.update_suspension_state(id);
        clean_ostreams(graph, id);
        graph.topo_mut(id).sched_recurse_tag = true;

        let n_istreams = graph.topo(id).inputs.len();
        for istream in 0..n_istreams {
            let real = match graph.topo(id).inputs[istream] {
                Some(src) => self.skip_virtuals(graph, src),
                None => None,
            };
            graph.topo_mut(id).real_inputs[istream] = real;
            if let Some(child) = real {
                self.subschedule_child(graph, id, query, child, current)?;
            }
        }

        // valid joint connections first, virtual dead-ends last
        let n_jstreams = graph.topo(id).jinputs.len();
        for jstream in 0..n_jstreams {
            let sources = graph.topo(id).jinputs[jstream].clone();
            let mut valid = Vec::with_capacity(sources.len());
            let mut real = Vec::with_capacity(sources.len());
            let mut dead = Vec::new();
            for src in sources {
                match self.skip_virtuals(graph, src) {
                    Some(r) => {
                        valid.push(src);
                        real.push(r);
                    }
                    None => dead.push(src),
                }
            }
            valid.extend(dead);
            let topo = graph.topo_mut(id);
            topo.jinputs[jstream] = valid;
            topo.jreal[jstream] = real;
        }
        for jstream in 0..n_jstreams {
            for con in 0..graph.topo(id).jreal[jstream].len() {
                let child = graph.topo(id).jreal[jstream][con];
                self.subschedule_child(graph, id, query, child, current)?;
            }
        }

        publish_routing(graph, id);
        let topo = graph.topo_mut(id);
        topo.node.set_counter(current);
        topo.sched_recurse_tag = false;
        Ok(())
    }

    fn subschedule_child(
        &mut self,
        graph: &mut Graph,
        id: NodeId,
        query: &mut Query,
        child: Source,
        current: u64,
    ) -> EngineResult<()> {
        clean_ostreams(graph, child.node);
        {
            let exec = graph.topo(child.node).node.exec.lock();
            exec.io.borrow_mut().ostream_connected[child.stream] = true;
        }

        let ctopo = graph.topo(child.node);
        if ctopo.sched_tag {
            query.leaf_level = query.leaf_level.max(ctopo.sched_leaf_level + 1);
        } else if ctopo.sched_recurse_tag {
            query.cycles.push(Cycle {
                last: child.node,
                nodes: vec![id],
                seen_delay: graph.topo(id).node.class.provides_delay(),
            });
        } else {
            let mut child_query = Query::default();
            self.query_node(graph, child.node, &mut child_query, current)?;
            query.leaf_level = query.leaf_level.max(child_query.leaf_level + 1);
            if child_query.cycles.is_empty() {
                self.schedule_node(graph, child.node, child_query.leaf_level);
            } else if resolve_cycles(&mut child_query, child.node)? {
                self.schedule_cycle(graph, child_query.cycle_nodes, child_query.leaf_level);
            } else {
                merge_cycles(graph, query, child_query, id);
            }
        }
        Ok(())
    }

    /// Resolve a source through virtual nodes to the real node feeding it
    fn skip_virtuals(&mut self, graph: &mut Graph, src: Source) -> Option<Source> {
        if !graph.topo(src.node).is_virtual() {
            return Some(src);
        }
        self.trace_virtual_input(graph, src.node, src.stream);
        graph.topo(src.node).real_inputs[src.stream]
    }

    fn trace_virtual_input(&mut self, graph: &mut Graph, vnode: NodeId, istream: usize) {
        if !graph.topo(vnode).sched_tag {
            self.schedule_virtual(graph, vnode);
        }
        // purely virtual loops resolve to nothing
        if graph.topo(vnode).sched_recurse_tag {
            return;
        }
        graph.topo_mut(vnode).sched_recurse_tag = true;
        let real = match graph.topo(vnode).inputs[istream] {
            Some(src) if graph.topo(src.node).is_virtual() => {
                self.trace_virtual_input(graph, src.node, src.stream);
                graph.topo(src.node).real_inputs[src.stream]
            }
            other => other,
        };
        let topo = graph.topo_mut(vnode);
        topo.real_inputs[istream] = real;
        topo.sched_recurse_tag = false;
    }
}

fn unschedule_node(graph: &mut Graph, node: &Arc<EngineNode>) {
    node.set_scheduled(false);
    {
        let exec = node.exec.lock();
        *exec.routing.borrow_mut() = Routing::default();
    }
    if !graph.contains(node.id) {
        return;
    }
    let topo = graph.topo_mut(node.id);
    topo.sched_tag = false;
    topo.sched_leaf_level = 0;
    if node.has_flow_jobs() {
        graph.node_changed(node.id);
    }
}

fn clean_ostreams(graph: &mut Graph, id: NodeId) {
    let topo = graph.topo_mut(id);
    if topo.cleared_ostreams || topo.sched_tag {
        return;
    }
    topo.cleared_ostreams = true;
    let exec = topo.node.exec.lock();
    exec.io.borrow_mut().ostream_connected.fill(false);
}

/// Hand resolved inputs to the process threads
fn publish_routing(graph: &Graph, id: NodeId) {
    let topo = graph.topo(id);
    let resolve = |src: &Source| RealInput {
        node: Arc::clone(&graph.topo(src.node).node),
        stream: src.stream,
    };
    let routing = Routing {
        inputs: topo.real_inputs.iter().map(|r| r.as_ref().map(resolve)).collect(),
        jinputs: topo.jreal.iter().map(|j| j.iter().map(resolve).collect()).collect(),
    };

    let exec = topo.node.exec.lock();
    let mut io = exec.io.borrow_mut();
    for (istream, real) in topo.real_inputs.iter().enumerate() {
        io.istream_connected[istream] = real.is_some();
    }
    for (jstream, real) in topo.jreal.iter().enumerate() {
        io.set_jconnections(jstream, real.len());
    }
    *exec.routing.borrow_mut() = routing;
}

// ============ Cycle Bookkeeping ============

struct Cycle {
    /// Node the cycle closes on
    last: NodeId,
    nodes: Vec<NodeId>,
    seen_delay: bool,
}

#[derive(Default)]
struct Query {
    leaf_level: usize,
    cycles: Vec<Cycle>,
    cycle_nodes: Vec<NodeId>,
}

fn merge_uniq(into: &mut Vec<NodeId>, from: Vec<NodeId>) {
    for id in from {
        if !into.contains(&id) {
            into.push(id);
        }
    }
}

/// Close all cycles ending at `id`; true when none remain open
fn resolve_cycles(query: &mut Query, id: NodeId) -> EngineResult<bool> {
    let mut open = Vec::new();
    for cycle in std::mem::take(&mut query.cycles) {
        if cycle.last != id {
            open.push(cycle);
            continue;
        }
        if !cycle.seen_delay {
            let mut nodes = vec![id];
            merge_uniq(&mut nodes, cycle.nodes);
            log::error!("cycle without delay module: {:?}", nodes);
            return Err(EngineError::CycleWithoutDelay(nodes));
        }
        merge_uniq(&mut query.cycle_nodes, cycle.nodes);
    }
    let all_resolved = open.is_empty();
    query.cycles = open;
    if all_resolved && !query.cycle_nodes.contains(&id) {
        query.cycle_nodes.insert(0, id);
    }
    Ok(all_resolved)
}

fn merge_cycles(graph: &Graph, query: &mut Query, mut child: Query, id: NodeId) {
    let delay = graph.topo(id).node.class.provides_delay();
    for cycle in &mut child.cycles {
        cycle.nodes.insert(0, id);
        cycle.seen_delay |= delay;
    }
    query.cycles.append(&mut child.cycles);
    merge_uniq(&mut query.cycle_nodes, child.cycle_nodes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{AudioModule, ModuleClass, ModuleFlags, ProcessContext};
    use crate::node::Module;
    use std::any::Any;

    struct Dummy;

    impl AudioModule for Dummy {
        fn process(&mut self, _ctx: &mut ProcessContext<'_>) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn add(graph: &mut Graph, class: ModuleClass) -> Module {
        let m = Module::new(class, Box::new(Dummy)).unwrap();
        graph.integrate(Arc::clone(m.node()), 1).unwrap();
        m
    }

    fn build(graph: &mut Graph) -> EngineResult<Schedule> {
        let mut schedule = Schedule::new();
        for id in graph.consumers().to_vec() {
            if let Err(err) = schedule.schedule_consumer(graph, id, 1) {
                graph.reset_sched_tags();
                schedule.clear(graph);
                return Err(err);
            }
        }
        schedule.secure();
        Ok(schedule)
    }

    #[test]
    fn test_levels_follow_dependencies() {
        let mut graph = Graph::new();
        let src = add(&mut graph, ModuleClass::new(0, 0, 1));
        let fx = add(&mut graph, ModuleClass::new(1, 0, 1));
        let out = add(&mut graph, ModuleClass::new(2, 0, 0));
        graph.connect(src.node(), 0, fx.node(), 0).unwrap();
        graph.connect(fx.node(), 0, out.node(), 0).unwrap();
        graph.connect(src.node(), 0, out.node(), 1).unwrap();
        graph.set_consumer(out.node(), true).unwrap();

        let schedule = build(&mut graph).unwrap();
        assert_eq!(schedule.n_items(), 3);
        assert_eq!(schedule.level_ids(0), vec![src.id()]);
        assert_eq!(schedule.level_ids(1), vec![fx.id()]);
        assert_eq!(schedule.level_ids(2), vec![out.id()]);
        assert_eq!(schedule.leaf_levels(), 4);
        assert!(src.is_scheduled() && fx.is_scheduled() && out.is_scheduled());
    }

    #[test]
    fn test_expensive_nodes_first() {
        let mut graph = Graph::new();
        let cheap = add(&mut graph, ModuleClass::new(0, 0, 1));
        let pricey = add(
            &mut graph,
            ModuleClass::new(0, 0, 1).with_flags(ModuleFlags::EXPENSIVE),
        );
        let out = add(&mut graph, ModuleClass::new(0, 1, 0));
        graph.jconnect(cheap.node(), 0, out.node(), 0).unwrap();
        graph.jconnect(pricey.node(), 0, out.node(), 0).unwrap();
        graph.set_consumer(out.node(), true).unwrap();

        let schedule = build(&mut graph).unwrap();
        assert_eq!(schedule.level_ids(0), vec![pricey.id(), cheap.id()]);
    }

    #[test]
    fn test_unconsumed_nodes_not_scheduled() {
        let mut graph = Graph::new();
        let lone = add(&mut graph, ModuleClass::new(0, 0, 1));
        let out = add(&mut graph, ModuleClass::new(0, 0, 0));
        graph.set_consumer(out.node(), true).unwrap();
        let schedule = build(&mut graph).unwrap();
        assert_eq!(schedule.n_items(), 1);
        assert!(!lone.is_scheduled());
    }

    #[test]
    fn test_cycle_with_delay_is_one_group() {
        let mut graph = Graph::new();
        let a = add(&mut graph, ModuleClass::new(1, 0, 2));
        let b = add(
            &mut graph,
            ModuleClass::new(1, 0, 1).with_flags(ModuleFlags::DELAY),
        );
        let out = add(&mut graph, ModuleClass::new(1, 0, 0));
        graph.connect(a.node(), 0, b.node(), 0).unwrap();
        graph.connect(b.node(), 0, a.node(), 0).unwrap();
        graph.connect(a.node(), 1, out.node(), 0).unwrap();
        graph.set_consumer(out.node(), true).unwrap();

        let schedule = build(&mut graph).unwrap();
        assert_eq!(schedule.n_items(), 2);
        assert!(schedule.cycle_ids(0).is_empty());
        let level1 = schedule.cycle_ids(1);
        assert_eq!(level1.len(), 1);
        assert_eq!(level1[0][0], a.id());
        let mut members = level1[0].clone();
        members.sort();
        let mut expected = vec![a.id(), b.id()];
        expected.sort();
        assert_eq!(members, expected);
        assert_eq!(schedule.level_ids(2), vec![out.id()]);
        assert!(a.node().group().is_some());
        assert!(Arc::ptr_eq(
            &a.node().group().unwrap(),
            &b.node().group().unwrap()
        ));
    }

    #[test]
    fn test_cycle_without_delay_rejected() {
        let mut graph = Graph::new();
        let a = add(&mut graph, ModuleClass::new(1, 0, 2));
        let b = add(&mut graph, ModuleClass::new(1, 0, 1));
        let out = add(&mut graph, ModuleClass::new(1, 0, 0));
        graph.connect(a.node(), 0, b.node(), 0).unwrap();
        graph.connect(b.node(), 0, a.node(), 0).unwrap();
        graph.connect(a.node(), 1, out.node(), 0).unwrap();
        graph.set_consumer(out.node(), true).unwrap();

        match build(&mut graph) {
            Err(EngineError::CycleWithoutDelay(nodes)) => {
                assert!(nodes.contains(&a.id()));
                assert!(nodes.contains(&b.id()));
            }
            other => panic!("expected cycle error, got {:?}", other.map(|s| s.n_items())),
        }
        assert!(!graph.topo(a.id()).sched_recurse_tag);
        assert!(!a.is_scheduled());
    }

    #[test]
    fn test_self_loop_with_delay() {
        let mut graph = Graph::new();
        let echo = add(
            &mut graph,
            ModuleClass::new(1, 0, 1).with_flags(ModuleFlags::DELAY),
        );
        graph.connect(echo.node(), 0, echo.node(), 0).unwrap();
        let out = add(&mut graph, ModuleClass::new(1, 0, 0));
        // echo feeds itself and the consumer through a second connection
        let tap = add(&mut graph, ModuleClass::new(1, 0, 1));
        graph.connect(echo.node(), 0, tap.node(), 0).unwrap();
        graph.connect(tap.node(), 0, out.node(), 0).unwrap();
        graph.set_consumer(out.node(), true).unwrap();

        let schedule = build(&mut graph).unwrap();
        assert_eq!(schedule.cycle_ids(0), vec![vec![echo.id()]]);
        assert_eq!(schedule.level_ids(1), vec![tap.id()]);
    }

    #[test]
    fn test_virtual_nodes_resolved() {
        let mut graph = Graph::new();
        let src = add(&mut graph, ModuleClass::new(0, 0, 1));
        let v = Module::new_virtual(1).unwrap();
        graph.integrate(Arc::clone(v.node()), 1).unwrap();
        let dangling = Module::new_virtual(1).unwrap();
        graph.integrate(Arc::clone(dangling.node()), 1).unwrap();
        let out = add(&mut graph, ModuleClass::new(1, 1, 0));
        graph.connect(src.node(), 0, v.node(), 0).unwrap();
        graph.connect(v.node(), 0, out.node(), 0).unwrap();
        graph.jconnect(dangling.node(), 0, out.node(), 0).unwrap();
        graph.set_consumer(out.node(), true).unwrap();

        let schedule = build(&mut graph).unwrap();
        assert_eq!(schedule.level_ids(0), vec![src.id()]);
        assert_eq!(
            graph.topo(out.id()).real_inputs[0],
            Some(Source {
                node: src.id(),
                stream: 0
            })
        );
        assert!(graph.topo(out.id()).jreal[0].is_empty());
        assert!(v.is_scheduled());
        let exec = out.node().exec.lock();
        assert!(exec.io.borrow().istream_connected[0]);
        assert_eq!(exec.io.borrow().jconnections[0], 0);
    }

    #[test]
    fn test_pop_order_and_clear() {
        let mut graph = Graph::new();
        let a = add(&mut graph, ModuleClass::new(0, 0, 1));
        let out = add(&mut graph, ModuleClass::new(1, 0, 0));
        graph.connect(a.node(), 0, out.node(), 0).unwrap();
        graph.set_consumer(out.node(), true).unwrap();

        let mut schedule = build(&mut graph).unwrap();
        assert!(schedule.is_exhausted());
        schedule.restart();
        let popped: Vec<NodeId> = std::iter::from_fn(|| schedule.pop_work())
            .map(|w| match w {
                Work::Node(n) => n.id,
                Work::Cycle(_) => unreachable!(),
            })
            .collect();
        assert_eq!(popped, vec![a.id(), out.id()]);
        assert!(schedule.is_exhausted());

        schedule.unsecure();
        schedule.clear(&mut graph);
        assert_eq!(schedule.n_items(), 0);
        assert!(!a.is_scheduled());
        assert!(out.node().exec.lock().routing.borrow().inputs.is_empty());
    }
}
