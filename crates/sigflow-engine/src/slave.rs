//! Slave process threads
//!
//! Each slave sleeps on its own command channel. The master wakes all
//! slaves once a schedule is installed; they drain the process queue
//! alongside the master and go back to sleep.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use sigflow_core::{EngineError, EngineResult};

use crate::engine::EngineShared;

enum SlaveCommand {
    Process,
    Quit,
}

struct Slave {
    tx: Sender<SlaveCommand>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct SlavePool {
    slaves: Vec<Slave>,
}

impl SlavePool {
    /// Spawn `n_slaves` named process threads
    pub fn spawn(shared: &Arc<EngineShared>, n_slaves: usize) -> EngineResult<Self> {
        let mut pool = Self {
            slaves: Vec::with_capacity(n_slaves),
        };
        for index in 0..n_slaves {
            let (tx, rx) = bounded(1);
            let name = format!("sigflow-slave-{}", index);
            let shared = Arc::clone(shared);
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || slave_loop(shared, rx))
                .map_err(|source| {
                    log::error!("Failed to spawn {}: {}", name, source);
                    EngineError::ThreadSpawn { name, source }
                })?;
            pool.slaves.push(Slave {
                tx,
                handle: Some(handle),
            });
        }
        if n_slaves > 0 {
            log::info!("Started {} slave process threads", n_slaves);
        }
        Ok(pool)
    }

    #[cfg(test)]
    pub fn empty() -> Self {
        Self { slaves: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    /// Kick every slave; a slave with a wakeup pending is left alone
    pub fn wake(&self) {
        for slave in &self.slaves {
            match slave.tx.try_send(SlaveCommand::Process) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => log::warn!("slave thread gone"),
            }
        }
    }

    pub fn shutdown(&mut self) {
        for slave in &self.slaves {
            let _ = slave.tx.send(SlaveCommand::Quit);
        }
        for slave in &mut self.slaves {
            if let Some(handle) = slave.handle.take() {
                let _ = handle.join();
            }
        }
        self.slaves.clear();
    }
}

impl Drop for SlavePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn slave_loop(shared: Arc<EngineShared>, rx: Receiver<SlaveCommand>) {
    while let Ok(command) = rx.recv() {
        match command {
            SlaveCommand::Process => {
                shared.drain_process_queue();
            }
            SlaveCommand::Quit => break,
        }
    }
    log::debug!("Slave thread exiting");
}
