//! Engine configuration

use serde::{Deserialize, Serialize};
use sigflow_core::{BlockConfig, EngineResult, constrain};

/// Startup configuration of an [`Engine`](crate::Engine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Requested output latency in milliseconds
    pub latency_ms: u32,

    /// Sample rate in Hz
    pub sample_freq: u32,

    /// Control value evaluation rate in Hz (0 = once per block)
    pub control_freq: u32,

    /// Slave process threads next to the master (None = one per extra core)
    pub n_slaves: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            latency_ms: 50,
            sample_freq: 44_100,
            control_freq: 0,
            n_slaves: None,
        }
    }
}

impl EngineConfig {
    /// Small blocks, fine control raster
    pub fn low_latency() -> Self {
        Self {
            latency_ms: 8,
            sample_freq: 48_000,
            control_freq: 1500,
            n_slaves: None,
        }
    }

    /// Large blocks for offline or high-load rendering
    pub fn high_quality() -> Self {
        Self {
            latency_ms: 120,
            sample_freq: 96_000,
            control_freq: 0,
            n_slaves: None,
        }
    }

    pub fn with_slaves(mut self, n_slaves: usize) -> Self {
        self.n_slaves = Some(n_slaves);
        self
    }

    /// Slave threads to spawn
    pub fn slave_count(&self) -> usize {
        self.n_slaves.unwrap_or_else(|| num_cpus::get().saturating_sub(1))
    }

    /// Derived block size and control raster
    pub fn block_config(&self) -> EngineResult<BlockConfig> {
        constrain(self.latency_ms, self.sample_freq, self.control_freq)
    }
}
