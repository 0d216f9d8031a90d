//! Module classes and the per-block process interface

use std::any::Any;
use std::ops::BitOr;

use sigflow_core::{MAX_BLOCK_SIZE, Sample};

use crate::const_values::ConstValueCache;

// ============ Class Descriptor ============

/// Scheduling and capability flags of a module class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleFlags(u8);

impl ModuleFlags {
    pub const CHEAP: Self = Self(0);
    /// Claimed first within a leaf level
    pub const EXPENSIVE: Self = Self(1 << 0);
    /// Output lags input by a block, may break feedback cycles
    pub const DELAY: Self = Self(1 << 1);
    /// Pass-through, resolved away during scheduling
    pub const VIRTUAL: Self = Self(1 << 2);
    /// Requests deferred (delay-cycle) processing, not supported
    pub const DEFERRED: Self = Self(1 << 3);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for ModuleFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Immutable stream layout and flags shared by all modules of a kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleClass {
    pub n_istreams: usize,
    pub n_jstreams: usize,
    pub n_ostreams: usize,
    pub flags: ModuleFlags,
}

impl ModuleClass {
    pub const fn new(n_istreams: usize, n_jstreams: usize, n_ostreams: usize) -> Self {
        Self {
            n_istreams,
            n_jstreams,
            n_ostreams,
            flags: ModuleFlags::CHEAP,
        }
    }

    pub const fn with_flags(mut self, flags: ModuleFlags) -> Self {
        self.flags = flags;
        self
    }

    #[inline]
    pub fn is_expensive(&self) -> bool {
        self.flags.contains(ModuleFlags::EXPENSIVE)
    }

    #[inline]
    pub fn is_virtual(&self) -> bool {
        self.flags.contains(ModuleFlags::VIRTUAL)
    }

    #[inline]
    pub fn provides_delay(&self) -> bool {
        self.flags.contains(ModuleFlags::DELAY)
    }
}

// ============ Module Trait ============

/// Signal processing implementation driven by the engine.
///
/// Dropping the implementation is its release; the engine only drops it on
/// the user thread during garbage collection.
pub trait AudioModule: Send {
    /// Compute `ctx.n_values()` samples for every connected output
    fn process(&mut self, ctx: &mut ProcessContext<'_>);

    /// Return to initial state, called before processing resumes
    fn reset(&mut self) {}

    /// Downcast to concrete type
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Implementation backing virtual modules
pub(crate) struct VirtualModule;

impl AudioModule for VirtualModule {
    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        for o in 0..ctx.n_ostreams() {
            if ctx.output_connected(o) {
                ctx.forward_input(o, o);
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ============ Stream Buffers ============

/// Output pointer virtualization requested by `process`
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Redirect {
    Const(Sample),
    Input(usize),
}

/// Per-node stream data, guarded by the node lock
pub(crate) struct StreamIo {
    /// Input scratch, filled per sub-run from the source output
    pub inputs: Vec<Vec<Sample>>,
    pub istream_connected: Vec<bool>,
    /// Joint input scratch per stream and connection
    pub jinputs: Vec<Vec<Vec<Sample>>>,
    /// Valid (non dead-end) joint connections per stream
    pub jconnections: Vec<usize>,
    /// Persistent output buffers indexed by `stamp - block start`
    pub outputs: Vec<Vec<Sample>>,
    pub ostream_connected: Vec<bool>,
    pub redirects: Vec<Option<Redirect>>,
}

impl StreamIo {
    pub fn new(class: &ModuleClass) -> Self {
        Self {
            inputs: vec![vec![0.0; MAX_BLOCK_SIZE]; class.n_istreams],
            istream_connected: vec![false; class.n_istreams],
            jinputs: vec![Vec::new(); class.n_jstreams],
            jconnections: vec![0; class.n_jstreams],
            outputs: vec![vec![0.0; MAX_BLOCK_SIZE]; class.n_ostreams],
            ostream_connected: vec![false; class.n_ostreams],
            redirects: vec![None; class.n_ostreams],
        }
    }

    /// Size joint scratch for `n` valid connections
    pub fn set_jconnections(&mut self, jstream: usize, n: usize) {
        self.jconnections[jstream] = n;
        let scratch = &mut self.jinputs[jstream];
        if scratch.len() < n {
            scratch.resize_with(n, || vec![0.0; MAX_BLOCK_SIZE]);
        }
    }

    /// Copy redirected outputs back into the persistent buffers
    pub fn apply_redirects(&mut self, offset: usize, n_values: usize, consts: &ConstValueCache) {
        for o in 0..self.outputs.len() {
            let Some(redirect) = self.redirects[o].take() else {
                continue;
            };
            if !self.ostream_connected[o] {
                continue;
            }
            let dst = &mut self.outputs[o][offset..offset + n_values];
            match redirect {
                Redirect::Const(value) => {
                    let block = consts.values(value);
                    dst.copy_from_slice(&block[..n_values]);
                }
                Redirect::Input(i) => dst.copy_from_slice(&self.inputs[i][..n_values]),
            }
        }
    }
}

// ============ Process Context ============

/// View of a node's streams for one `process` call
pub struct ProcessContext<'a> {
    io: &'a mut StreamIo,
    offset: usize,
    n_values: usize,
    tick_stamp: u64,
}

impl<'a> ProcessContext<'a> {
    pub(crate) fn new(io: &'a mut StreamIo, offset: usize, n_values: usize, tick_stamp: u64) -> Self {
        Self {
            io,
            offset,
            n_values,
            tick_stamp,
        }
    }

    /// Samples to compute in this call
    #[inline]
    pub fn n_values(&self) -> usize {
        self.n_values
    }

    /// Tick stamp of the first sample of this call
    #[inline]
    pub fn tick_stamp(&self) -> u64 {
        self.tick_stamp
    }

    pub fn n_istreams(&self) -> usize {
        self.io.inputs.len()
    }

    pub fn n_jstreams(&self) -> usize {
        self.io.jinputs.len()
    }

    pub fn n_ostreams(&self) -> usize {
        self.io.outputs.len()
    }

    /// Input values; silence when unconnected
    #[inline]
    pub fn input(&self, istream: usize) -> &[Sample] {
        &self.io.inputs[istream][..self.n_values]
    }

    #[inline]
    pub fn input_connected(&self, istream: usize) -> bool {
        self.io.istream_connected[istream]
    }

    /// Number of live connections on a joint input
    pub fn n_joint(&self, jstream: usize) -> usize {
        self.io.jconnections[jstream]
    }

    pub fn joint_input(&self, jstream: usize, connection: usize) -> &[Sample] {
        &self.io.jinputs[jstream][connection][..self.n_values]
    }

    pub fn joint_inputs(&self, jstream: usize) -> impl Iterator<Item = &[Sample]> + '_ {
        let n = self.n_values;
        self.io.jinputs[jstream][..self.io.jconnections[jstream]]
            .iter()
            .map(move |values| &values[..n])
    }

    /// Output block to write in place
    #[inline]
    pub fn output(&mut self, ostream: usize) -> &mut [Sample] {
        let range = self.offset..self.offset + self.n_values;
        &mut self.io.outputs[ostream][range]
    }

    #[inline]
    pub fn output_connected(&self, ostream: usize) -> bool {
        self.io.ostream_connected[ostream]
    }

    /// Input and output pair, for in-place style filters
    pub fn io(&mut self, istream: usize, ostream: usize) -> (&[Sample], &mut [Sample]) {
        let n = self.n_values;
        let range = self.offset..self.offset + n;
        (&self.io.inputs[istream][..n], &mut self.io.outputs[ostream][range])
    }

    /// Emit a constant instead of writing the output block
    pub fn set_output_const(&mut self, ostream: usize, value: Sample) {
        self.io.redirects[ostream] = Some(Redirect::Const(value));
    }

    /// Emit an input unchanged instead of writing the output block
    pub fn forward_input(&mut self, ostream: usize, istream: usize) {
        self.io.redirects[ostream] = Some(Redirect::Input(istream));
    }
}
