//! Suspension state propagation
//!
//! A node's activation stamp is the earliest stamp any downstream consumer
//! path needs it, bounded below by its own suspend/resume stamp. Cycles
//! are detected through `in_suspend_call`; nodes on a cycle keep their
//! `update_suspend` mark until reached from outside the cycle.

use sigflow_core::{MAX_TICK_STAMP, NodeId};

use crate::graph::Graph;

impl Graph {
    /// Whether `id` would be reset when processing resumes
    fn determine_suspension_reset(&mut self, id: NodeId) -> bool {
        let topo = self.topo(id);
        if !topo.is_virtual() {
            return topo.node.needs_reset();
        }

        self.topo_mut(id).in_suspend_call = true;
        let mut keep_state = false;
        let mut k = 0;
        while !keep_state && k < self.topo(id).output_nodes.len() {
            let dest = self.topo(id).output_nodes[k];
            // purely virtual cycles
            if !self.topo(dest).in_suspend_call {
                keep_state |= !self.determine_suspension_reset(dest);
            }
            k += 1;
        }
        self.topo_mut(id).in_suspend_call = false;
        !keep_state
    }

    fn determine_suspension_state(&mut self, id: NodeId, seen_cycle: &mut bool, keep_state: &mut bool) -> u64 {
        let mut cycle = false;
        let mut stamp = MAX_TICK_STAMP;

        if self.topo(id).update_suspend {
            self.topo_mut(id).in_suspend_call = true;
            if self.topo(id).is_consumer() {
                stamp = 0;
            }
            let mut keep = false;
            for k in 0..self.topo(id).output_nodes.len() {
                let dest = self.topo(id).output_nodes[k];
                if self.topo(dest).in_suspend_call {
                    cycle = true;
                } else {
                    let ostamp = self.determine_suspension_state(dest, &mut cycle, &mut keep);
                    stamp = stamp.min(ostamp);
                }
            }

            let topo = self.topo_mut(id);
            if !keep {
                topo.node.set_needs_reset(true);
            }
            stamp = stamp.max(topo.local_active);
            if !cycle {
                topo.node.set_next_active(stamp);
                topo.update_suspend = false;
            }
            topo.in_suspend_call = false;
        } else {
            stamp = self.topo(id).node.next_active();
        }

        *keep_state |= !self.determine_suspension_reset(id);
        *seen_cycle |= cycle;
        stamp
    }

    /// Recompute `next_active` and `needs_reset` of a marked node
    pub fn update_suspension_state(&mut self, id: NodeId) {
        if !self.topo(id).update_suspend {
            return;
        }
        let mut seen_cycle = false;
        let mut keep_state = false;
        let stamp = self.determine_suspension_state(id, &mut seen_cycle, &mut keep_state);
        let topo = self.topo_mut(id);
        if !keep_state {
            topo.node.set_needs_reset(true);
        }
        if topo.update_suspend {
            topo.node.set_next_active(stamp);
            topo.update_suspend = false;
        }
    }
}
