//! Shared test modules and helpers

#![allow(dead_code)]

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sigflow_engine::{AudioModule, EngineConfig, Module, ModuleClass, ModuleFlags, ProcessContext, Sample};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small blocks keep the arithmetic in tests readable
pub fn test_config() -> EngineConfig {
    EngineConfig {
        latency_ms: 10,
        sample_freq: 48_000,
        control_freq: 0,
        n_slaves: Some(0),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCES
// ═══════════════════════════════════════════════════════════════════════════════

/// Emits a constant value; counts resets
pub struct ConstSource {
    pub value: Sample,
    pub resets: Arc<AtomicUsize>,
}

impl AudioModule for ConstSource {
    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        let value = self.value;
        ctx.output(0).fill(value);
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn const_source(value: Sample) -> (Module, Arc<AtomicUsize>) {
    let resets = Arc::new(AtomicUsize::new(0));
    let module = Module::new(
        ModuleClass::new(0, 0, 1),
        Box::new(ConstSource {
            value,
            resets: Arc::clone(&resets),
        }),
    )
    .unwrap();
    (module, resets)
}

/// Emits the tick stamp of every sample
pub struct RampSource;

impl AudioModule for RampSource {
    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        let start = ctx.tick_stamp();
        for (i, v) in ctx.output(0).iter_mut().enumerate() {
            *v = (start + i as u64) as Sample;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn ramp_source() -> Module {
    Module::new(ModuleClass::new(0, 0, 1), Box::new(RampSource)).unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROCESSORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Sums every joint input connection
pub struct Mixer;

impl AudioModule for Mixer {
    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        let n = ctx.n_values();
        let mut sum = vec![0.0; n];
        for input in ctx.joint_inputs(0) {
            for (s, v) in sum.iter_mut().zip(input) {
                *s += v;
            }
        }
        ctx.output(0).copy_from_slice(&sum);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn mixer() -> Module {
    Module::new(ModuleClass::new(0, 1, 1), Box::new(Mixer)).unwrap()
}

/// Adds `gain` times its input to a constant offset
pub struct Gain {
    pub gain: Sample,
    pub offset: Sample,
}

impl AudioModule for Gain {
    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        let (gain, offset) = (self.gain, self.offset);
        let (input, output) = ctx.io(0, 0);
        for (o, i) in output.iter_mut().zip(input) {
            *o = offset + gain * i;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn gain(gain: Sample, offset: Sample, flags: ModuleFlags) -> Module {
    Module::new(
        ModuleClass::new(1, 0, 1).with_flags(flags),
        Box::new(Gain { gain, offset }),
    )
    .unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════════
// SINK
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct RecorderLog {
    /// (tick stamp, n_values) of every process call
    pub calls: Vec<(u64, usize)>,
    pub samples: Vec<Sample>,
    pub resets: usize,
}

/// Consumer recording everything it receives
pub struct Recorder {
    pub log: Arc<Mutex<RecorderLog>>,
}

impl AudioModule for Recorder {
    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        let mut log = self.log.lock();
        log.calls.push((ctx.tick_stamp(), ctx.n_values()));
        log.samples.extend_from_slice(ctx.input(0));
    }

    fn reset(&mut self) {
        self.log.lock().resets += 1;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn recorder() -> (Module, Arc<Mutex<RecorderLog>>) {
    let log = Arc::new(Mutex::new(RecorderLog::default()));
    let module = Module::new(
        ModuleClass::new(1, 0, 0),
        Box::new(Recorder { log: Arc::clone(&log) }),
    )
    .unwrap();
    (module, log)
}
