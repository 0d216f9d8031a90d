//! Master: applies transactions, maintains the schedule, drives processing
//!
//! One dispatch cycle:
//! 1. Apply committed transactions, then due boundary jobs
//! 2. Rebuild the schedule if the topology changed
//! 3. Render one block: master and slaves drain the process queue
//! 4. Hand finished probes, spent jobs and other garbage to the user thread
//! 5. Advance the tick stamp and run timers

use std::sync::Arc;

use sigflow_core::{EngineError, EngineResult, MAX_POLLFDS, NodeId};

use crate::engine::EngineShared;
use crate::graph::Graph;
use crate::job::{Job, JobKind, PollFd, PollFn, PollHandle, PollRequest, TimerFn};
use crate::node::{EngineNode, TimedAction, TimedJob};
use crate::pqueue::BlockInfo;
use crate::process;
use crate::queue::Garbage;
use crate::schedule::Schedule;
use crate::slave::SlavePool;

struct PollEntry {
    handle: PollHandle,
    poll: PollFn,
    fds: Vec<PollFd>,
}

pub(crate) struct Master {
    shared: Arc<EngineShared>,
    graph: Graph,
    /// `None` after a failed rebuild; processing halts until the topology changes
    schedule: Option<Schedule>,
    need_process: bool,
    polls: Vec<PollEntry>,
    timers: Vec<TimerFn>,
    slaves: SlavePool,
}

impl Master {
    pub fn new(shared: Arc<EngineShared>, slaves: SlavePool) -> Self {
        let mut schedule = Schedule::new();
        schedule.secure();
        Self {
            shared,
            graph: Graph::new(),
            schedule: Some(schedule),
            need_process: false,
            polls: Vec::new(),
            timers: Vec::new(),
            slaves,
        }
    }

    fn n_pollfds(&self) -> usize {
        self.polls.iter().map(|p| p.fds.len()).sum()
    }

    /// File descriptors of all poll functions, in registration order
    pub fn poll_fds(&mut self) -> impl Iterator<Item = &mut PollFd> + '_ {
        self.polls.iter_mut().flat_map(|p| p.fds.iter_mut())
    }

    // ============ Jobs ============

    fn apply_job(&mut self, job: &mut Job, current: u64) -> EngineResult<()> {
        match &mut job.kind {
            JobKind::Integrate(module) => {
                log::debug!("integrate {}", module.id());
                self.graph.integrate(Arc::clone(module.node()), current)?;
            }
            JobKind::Discard(module) => {
                log::debug!("discard {}", module.id());
                module.node().ensure_integrated()?;
                self.discard_node(module.node())?;
            }
            JobKind::KillInputs(module) => self.graph.kill_inputs(module.node())?,
            JobKind::KillOutputs(module) => self.graph.kill_outputs(module.node())?,
            JobKind::Connect {
                src,
                ostream,
                dest,
                istream,
            } => self.graph.connect(src.node(), *ostream, dest.node(), *istream)?,
            JobKind::JConnect {
                src,
                ostream,
                dest,
                jstream,
            } => self.graph.jconnect(src.node(), *ostream, dest.node(), *jstream)?,
            JobKind::Disconnect { dest, istream } => self.graph.disconnect(dest.node(), *istream)?,
            JobKind::JDisconnect {
                dest,
                jstream,
                src,
                ostream,
            } => {
                self.graph.jdisconnect(dest.node(), *jstream, src.node(), *ostream)?;
            }
            JobKind::SetConsumer(module) => self.graph.set_consumer(module.node(), true)?,
            JobKind::UnsetConsumer(module) => self.graph.set_consumer(module.node(), false)?,
            JobKind::ForceReset(module) => self.graph.force_reset(module.node(), current)?,
            JobKind::Access { module, access } => {
                let node = module.node();
                self.graph.get(node)?;
                node.set_counter(current);
                let exec = node.exec.lock();
                if let Some(imp) = exec.module.borrow_mut().as_mut() {
                    access(imp.as_mut());
                }
            }
            JobKind::Suspend { module, tick_stamp } => self.graph.suspend(module.node(), *tick_stamp)?,
            JobKind::Resume { module, tick_stamp } => self.graph.resume(module.node(), *tick_stamp)?,
            JobKind::FlowAccess {
                module,
                tick_stamp,
                access,
            } => {
                self.graph.get(module.node())?;
                if let Some(access) = access.take() {
                    let job = TimedJob {
                        tick_stamp: *tick_stamp,
                        action: TimedAction::Access(access),
                    };
                    self.graph.add_flow_job(module.node(), job)?;
                }
            }
            JobKind::BoundaryAccess {
                module,
                tick_stamp,
                access,
            } => {
                self.graph.get(module.node())?;
                if let Some(access) = access.take() {
                    let job = TimedJob {
                        tick_stamp: *tick_stamp,
                        action: TimedAction::Access(access),
                    };
                    self.graph.add_boundary_job(module.node(), job)?;
                }
            }
            JobKind::BoundaryDiscard(module) => {
                let job = TimedJob {
                    tick_stamp: current,
                    action: TimedAction::Discard,
                };
                self.graph.add_boundary_job(module.node(), job)?;
            }
            JobKind::ProbeRequest { module, probe } => {
                if let Some(probe) = probe.take() {
                    let integrated = self.graph.get(module.node()).map(|_| ());
                    if let Err(err) = integrated {
                        // the callback still runs, reporting no data
                        self.graph.garbage.push(Garbage::Probe(probe));
                        return Err(err);
                    }
                    self.graph.add_probe_job(module.node(), probe)?;
                }
            }
            JobKind::AddPoll { handle, poll, fds } => {
                let requested = self.n_pollfds() + fds.len();
                if requested > MAX_POLLFDS {
                    return Err(EngineError::PollTableFull {
                        requested,
                        max: MAX_POLLFDS,
                    });
                }
                if let Some(poll) = poll.take() {
                    self.polls.push(PollEntry {
                        handle: *handle,
                        poll,
                        fds: std::mem::take(fds),
                    });
                }
            }
            JobKind::RemovePoll(handle) => match self.polls.iter().position(|p| p.handle == *handle) {
                Some(pos) => {
                    let entry = self.polls.remove(pos);
                    self.graph.garbage.push(Garbage::Poll(entry.poll));
                }
                None => log::warn!("remove_poll: {:?} not registered", handle),
            },
            JobKind::AddTimer(timer) => {
                if let Some(timer) = timer.take() {
                    self.timers.push(timer);
                }
            }
            JobKind::Sync(point) => {
                log::debug!("master parked for synchronization");
                self.graph.need_reflow = true;
                self.discard_schedule();
                self.flush_garbage();
                point.park();
            }
            JobKind::Message(text) => log::info!(target: "engine", "{}", text),
            JobKind::Nop => {}
        }
        Ok(())
    }

    fn apply_transaction(&mut self, mut jobs: Vec<Job>, current: u64) {
        for job in &mut jobs {
            if let Err(err) = self.apply_job(job, current) {
                log::error!("job failed: {}: {}", job, err);
            }
        }
        self.shared.set_n_integrated(self.graph.len());
        self.shared.queue.retire(jobs);
    }

    fn drain_transactions(&mut self, update_commit_stamp: bool, current: u64) {
        while let Some(jobs) = self.shared.queue.pop_transaction(update_commit_stamp, current) {
            self.apply_transaction(jobs, current);
        }
    }

    /// Apply committed transactions and boundary jobs due in this block
    pub fn dispatch_jobs(&mut self) {
        let current = self.shared.tick.current();
        loop {
            let update = self.graph.boundary_nodes.is_empty();
            let Some(jobs) = self.shared.queue.pop_transaction(update, current) else {
                break;
            };
            self.apply_transaction(jobs, current);
        }

        if self.graph.boundary_nodes.is_empty() {
            return;
        }
        let last_block_tick = current + self.shared.block_size() as u64 - 1;
        loop {
            self.graph.new_boundary_jobs = false;
            for id in self.graph.boundary_nodes.clone() {
                self.run_boundary_jobs(id, last_block_tick, current);
            }
            let update = !self.graph.new_boundary_jobs;
            self.drain_transactions(update, current);
            if !self.graph.new_boundary_jobs {
                break;
            }
        }
    }

    fn run_boundary_jobs(&mut self, id: NodeId, last_block_tick: u64, current: u64) {
        let mut ran_any = false;
        while let Some(job) = self.graph.pop_boundary_job(id, last_block_tick) {
            ran_any = true;
            match job.action {
                TimedAction::Access(mut access) => {
                    let node = Arc::clone(&self.graph.topo(id).node);
                    {
                        let exec = node.exec.lock();
                        if let Some(imp) = exec.module.borrow_mut().as_mut() {
                            access(imp.as_mut());
                        }
                    }
                    self.graph.garbage.push(Garbage::Access(access));
                }
                TimedAction::Discard => {
                    let node = Arc::clone(&self.graph.topo(id).node);
                    if let Err(err) = self.discard_node(&node) {
                        log::error!("boundary discard of {} failed: {}", id, err);
                    }
                    return;
                }
            }
        }
        if ran_any && self.graph.contains(id) {
            self.graph.topo(id).node.set_counter(current);
        }
    }

    fn discard_node(&mut self, node: &EngineNode) -> EngineResult<()> {
        self.graph.need_reflow = true;
        self.discard_schedule();
        self.graph.discard(node)
    }

    /// Drop the schedule; routing references go with it
    fn discard_schedule(&mut self) {
        if let Some(mut schedule) = self.schedule.take() {
            schedule.unsecure();
            schedule.clear(&mut self.graph);
        }
        self.graph.need_reflow = true;
    }

    // ============ Scheduling ============

    fn reschedule(&mut self) {
        let current = self.shared.tick.current();
        let mut schedule = self.schedule.take().unwrap_or_default();
        schedule.unsecure();
        schedule.clear(&mut self.graph);
        self.graph.need_reflow = false;

        for id in self.graph.consumers().to_vec() {
            if let Err(err) = schedule.schedule_consumer(&mut self.graph, id, current) {
                log::error!("rescheduling failed, processing halted: {}", err);
                self.graph.reset_sched_tags();
                schedule.clear(&mut self.graph);
                return;
            }
        }
        schedule.secure();
        log::debug!(
            "rescheduled {} items in {} leaf levels",
            schedule.n_items(),
            schedule.leaf_levels()
        );
        self.schedule = Some(schedule);
    }

    pub fn is_halted(&self) -> bool {
        self.schedule.is_none() && !self.graph.need_reflow
    }

    // ============ Processing ============

    fn process_flow(&mut self) {
        let current = self.shared.tick.current();
        let final_counter = current + self.shared.block_size() as u64;
        let block = BlockInfo {
            current,
            final_counter,
        };

        if let Some(schedule) = self.schedule.take() {
            self.shared.pqueue.set_schedule(schedule, block);
            self.slaves.wake();
            self.shared.drain_process_queue();
        }

        // unscheduled nodes still run their flow jobs in time
        for id in self.graph.unscheduled_tjob_nodes() {
            let node = Arc::clone(&self.graph.topo(id).node);
            {
                let exec = node.exec.lock();
                node.set_counter(final_counter);
                process::update_node_state(&node, &exec, final_counter - 1);
            }
            self.graph.node_changed(id);
        }

        self.shared.pqueue.wait_on_unprocessed();
        self.take_probes(block);
        if let Some((schedule, trash)) = self.shared.pqueue.unset_schedule() {
            self.schedule = Some(schedule);
            self.shared.queue.add_garbage(trash);
        }

        let stamp = self.shared.tick.increment();
        self.run_timers(stamp);

        let expired = self.shared.consts.recycle(false);
        self.graph.garbage.extend(expired.into_iter().map(Garbage::Values));
        self.need_process = false;
    }

    fn take_probes(&mut self, block: BlockInfo) {
        let n_values = (block.final_counter - block.current) as usize;
        for id in self.graph.probe_nodes.clone() {
            let topo = self.graph.topo(id);
            let node = Arc::clone(&topo.node);
            let real_inputs = topo.real_inputs.clone();
            let Some(mut probe) = self.graph.pop_probe_job(id) else {
                continue;
            };
            probe.tick_stamp = block.current;
            probe.n_values = n_values;

            if !node.is_scheduled() {
                // fast-forwarded: silence on every stream
                for stream in probe.ostreams.iter_mut() {
                    stream.connected = false;
                    stream.values[..n_values].fill(0.0);
                }
            } else if node.class.is_virtual() {
                for (o, stream) in probe.ostreams.iter_mut().enumerate() {
                    let Some(src) = real_inputs.get(o).copied().flatten() else {
                        stream.connected = false;
                        continue;
                    };
                    let src_node = &self.graph.topo(src.node).node;
                    let exec = src_node.exec.lock();
                    let io = exec.io.borrow();
                    stream.connected = true;
                    stream.values[..n_values].copy_from_slice(&io.outputs[src.stream][..n_values]);
                }
            } else {
                let exec = node.exec.lock();
                let mut io = exec.io.borrow_mut();
                for (o, stream) in probe.ostreams.iter_mut().enumerate() {
                    stream.connected = io.ostream_connected[o];
                    std::mem::swap(&mut stream.values, &mut io.outputs[o]);
                }
            }
            self.graph.garbage.push(Garbage::Probe(probe));
        }
    }

    fn run_timers(&mut self, stamp: u64) {
        let mut i = 0;
        while i < self.timers.len() {
            let timer = &mut self.timers[i];
            if timer(stamp) {
                i += 1;
            } else {
                let timer = self.timers.remove(i);
                self.graph.garbage.push(Garbage::Timer(timer));
            }
        }
    }

    fn flush_garbage(&mut self) {
        self.shared.queue.add_garbage(self.graph.take_garbage());
        if self.shared.queue.has_garbage() {
            self.shared.notify_garbage();
        }
    }

    // ============ Loop Integration ============

    fn poll_check(&mut self, timeout_ms: &mut Option<u64>, revents_valid: bool) -> bool {
        if self.need_process || *timeout_ms == Some(0) {
            self.need_process = true;
            return true;
        }
        let min_n_values = self.shared.block_size();
        for entry in &mut self.polls {
            if !revents_valid {
                for fd in &mut entry.fds {
                    fd.revents = 0;
                }
            }
            let mut request = PollRequest {
                min_n_values,
                timeout_ms: None,
                fds: &mut entry.fds,
                revents_valid,
            };
            let ready = (entry.poll)(&mut request);
            let wanted = request.timeout_ms;
            if ready || wanted == Some(0) {
                self.need_process = true;
                *timeout_ms = Some(0);
                return true;
            }
            if let Some(ms) = wanted {
                *timeout_ms = Some(timeout_ms.map_or(ms, |t| t.min(ms)));
            }
        }
        false
    }

    fn has_work(&self) -> bool {
        self.graph.need_reflow || self.need_process || self.shared.queue.has_pending()
    }

    /// Whether a dispatch is due without sleeping; narrows `timeout_ms` otherwise
    pub fn prepare(&mut self, timeout_ms: &mut Option<u64>) -> bool {
        if self.has_work() {
            *timeout_ms = Some(0);
            return true;
        }
        if self.is_halted() {
            return false;
        }
        self.poll_check(timeout_ms, false)
    }

    /// Whether a dispatch is due after sleeping
    pub fn check(&mut self, revents_valid: bool) -> bool {
        if self.has_work() {
            return true;
        }
        if self.is_halted() {
            return false;
        }
        let mut timeout_ms = None;
        self.poll_check(&mut timeout_ms, revents_valid)
    }

    /// Render the next block regardless of poll functions
    pub fn force_process(&mut self) {
        self.need_process = true;
    }

    pub fn dispatch(&mut self) {
        self.dispatch_jobs();
        if self.graph.need_reflow {
            self.reschedule();
        }
        if self.need_process {
            if self.schedule.is_some() {
                self.process_flow();
            } else {
                self.need_process = false;
            }
        }
        self.flush_garbage();
    }

    /// Drop every cached constant block, after a block size change
    pub fn reconfigured(&mut self) {
        let expired = self.shared.consts.recycle(true);
        self.graph.garbage.extend(expired.into_iter().map(Garbage::Values));
        self.discard_schedule();
        self.flush_garbage();
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.slaves.shutdown();
        // break routing reference cycles through feedback nodes
        if let Some(mut schedule) = self.schedule.take() {
            schedule.unsecure();
            schedule.clear(&mut self.graph);
        }
        self.graph.reset_sched_tags();
        self.flush_garbage();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::module::{AudioModule, ModuleClass, ModuleFlags, ProcessContext};
    use crate::node::Module;
    use sigflow_core::Sample;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Dc(Sample);

    impl AudioModule for Dc {
        fn process(&mut self, ctx: &mut ProcessContext<'_>) {
            let value = self.0;
            ctx.output(0).fill(value);
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Sink;

    impl AudioModule for Sink {
        fn process(&mut self, _ctx: &mut ProcessContext<'_>) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn master() -> Master {
        let config = EngineConfig::default().with_slaves(0);
        let shared = EngineShared::new(&config, false).unwrap();
        Master::new(shared, SlavePool::empty())
    }

    fn run(master: &mut Master, jobs: Vec<Job>) {
        master.shared.enqueue(jobs);
        master.dispatch();
    }

    #[test]
    fn test_jobs_applied_in_order() {
        let mut m = master();
        let src = Module::new(ModuleClass::new(0, 0, 1), Box::new(Dc(0.5))).unwrap();
        let sink = Module::new(ModuleClass::new(1, 0, 0), Box::new(Sink)).unwrap();
        run(
            &mut m,
            vec![
                Job::integrate(&src),
                Job::integrate(&sink),
                Job::connect(&src, 0, &sink, 0).unwrap(),
                Job::set_consumer(&sink),
            ],
        );
        assert!(src.is_integrated() && sink.is_integrated());
        assert!(sink.has_source(0));
        assert!(src.is_scheduled() && sink.is_scheduled());
        assert_eq!(m.shared.n_integrated(), 2);
        assert!(m.shared.queue.is_drained());
    }

    #[test]
    fn test_failed_job_does_not_abort_transaction() {
        let mut m = master();
        let a = Module::new(ModuleClass::new(0, 0, 1), Box::new(Dc(1.0))).unwrap();
        let b = Module::new(ModuleClass::new(1, 0, 0), Box::new(Sink)).unwrap();
        run(
            &mut m,
            vec![
                Job::connect(&a, 0, &b, 0).unwrap(),
                Job::integrate(&a),
                Job::integrate(&a),
                Job::integrate(&b),
            ],
        );
        assert!(a.is_integrated() && b.is_integrated());
        assert!(!b.has_source(0));
    }

    #[test]
    fn test_process_flow_advances_tick() {
        let mut m = master();
        let block_size = m.shared.block_size() as u64;
        let src = Module::new(ModuleClass::new(0, 0, 1), Box::new(Dc(0.25))).unwrap();
        let sink = Module::new(ModuleClass::new(1, 0, 0), Box::new(Sink)).unwrap();
        run(
            &mut m,
            vec![
                Job::integrate(&src),
                Job::integrate(&sink),
                Job::connect(&src, 0, &sink, 0).unwrap(),
                Job::set_consumer(&sink),
            ],
        );
        assert_eq!(m.shared.tick.current(), 1);

        m.force_process();
        m.dispatch();
        assert_eq!(m.shared.tick.current(), 1 + block_size);
        assert_eq!(sink.tick_stamp(), 1 + block_size);
        assert_eq!(src.tick_stamp(), 1 + block_size);
    }

    #[test]
    fn test_cycle_without_delay_halts() {
        let mut m = master();
        let a = Module::new(ModuleClass::new(1, 0, 2), Box::new(Sink)).unwrap();
        let b = Module::new(ModuleClass::new(1, 0, 1), Box::new(Sink)).unwrap();
        let out = Module::new(ModuleClass::new(1, 0, 0), Box::new(Sink)).unwrap();
        run(
            &mut m,
            vec![
                Job::integrate(&a),
                Job::integrate(&b),
                Job::integrate(&out),
                Job::connect(&a, 0, &b, 0).unwrap(),
                Job::connect(&b, 0, &a, 0).unwrap(),
                Job::connect(&a, 1, &out, 0).unwrap(),
                Job::set_consumer(&out),
            ],
        );
        assert!(m.is_halted());
        m.force_process();
        m.dispatch();
        assert_eq!(m.shared.tick.current(), 1);

        // breaking the cycle resumes processing
        run(&mut m, vec![Job::disconnect(&a, 0).unwrap()]);
        assert!(!m.is_halted());
        m.force_process();
        m.dispatch();
        assert!(m.shared.tick.current() > 1);
    }

    #[test]
    fn test_cycle_with_delay_processes() {
        let mut m = master();
        let a = Module::new(ModuleClass::new(1, 0, 2), Box::new(Sink)).unwrap();
        let b = Module::new(
            ModuleClass::new(1, 0, 1).with_flags(ModuleFlags::DELAY),
            Box::new(Sink),
        )
        .unwrap();
        let out = Module::new(ModuleClass::new(1, 0, 0), Box::new(Sink)).unwrap();
        run(
            &mut m,
            vec![
                Job::integrate(&a),
                Job::integrate(&b),
                Job::integrate(&out),
                Job::connect(&a, 0, &b, 0).unwrap(),
                Job::connect(&b, 0, &a, 0).unwrap(),
                Job::connect(&a, 1, &out, 0).unwrap(),
                Job::set_consumer(&out),
            ],
        );
        m.force_process();
        m.dispatch();
        let stamp = m.shared.tick.current();
        assert!(stamp > 1);
        assert_eq!(a.tick_stamp(), stamp);
        assert_eq!(b.tick_stamp(), stamp);
    }

    #[test]
    fn test_access_sees_current_counter() {
        let mut m = master();
        let src = Module::new(ModuleClass::new(0, 0, 1), Box::new(Dc(0.5))).unwrap();
        run(&mut m, vec![Job::integrate(&src)]);
        src.node().set_counter(0);

        let seen = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let handle = src.clone();
        let s = Arc::clone(&seen);
        run(
            &mut m,
            vec![Job::access(&src, move |_| s.store(handle.tick_stamp(), Ordering::SeqCst))],
        );
        let current = m.shared.tick.current();
        assert_ne!(current, 0);
        assert_eq!(seen.load(Ordering::SeqCst), current);
    }

    #[test]
    fn test_timers_run_until_false() {
        let mut m = master();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        run(
            &mut m,
            vec![Job::add_timer(move |_| c.fetch_add(1, Ordering::SeqCst) < 2)],
        );
        for _ in 0..5 {
            m.force_process();
            m.dispatch();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(m.timers.is_empty());
    }

    #[test]
    fn test_poll_table_limit() {
        let mut m = master();
        let fds = vec![PollFd::new(0, 1); MAX_POLLFDS];
        let (job, _) = Job::add_poll(|_| false, fds).unwrap();
        run(&mut m, vec![job]);
        assert_eq!(m.n_pollfds(), MAX_POLLFDS);

        let (job, _) = Job::add_poll(|_| false, vec![PollFd::new(1, 1)]).unwrap();
        run(&mut m, vec![job]);
        assert_eq!(m.polls.len(), 1);
    }

    #[test]
    fn test_poll_timeout_merging() {
        let mut m = master();
        let (first, handle) = Job::add_poll(
            |req| {
                req.timeout_ms = Some(30);
                false
            },
            Vec::new(),
        )
        .unwrap();
        let (second, _) = Job::add_poll(
            |req| {
                req.timeout_ms = Some(10);
                false
            },
            Vec::new(),
        )
        .unwrap();
        run(&mut m, vec![first, second]);

        let mut timeout = None;
        assert!(!m.prepare(&mut timeout));
        assert_eq!(timeout, Some(10));

        run(&mut m, vec![Job::remove_poll(handle)]);
        let mut timeout = Some(50);
        assert!(!m.prepare(&mut timeout));
        assert_eq!(timeout, Some(10));
        assert_eq!(m.polls.len(), 1);
    }
}
