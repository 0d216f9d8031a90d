//! Block size and control raster derivation

use serde::{Deserialize, Serialize};

use crate::{EngineError, EngineResult, MAX_BLOCK_SIZE};

/// Lowest sample frequency the engine accepts
pub const MIN_SAMPLE_FREQ: u32 = 100;

/// Block-wise processing parameters derived from latency and sample rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockConfig {
    pub sample_freq: u32,
    /// Samples per block, the tick stamp leap
    pub block_size: usize,
    /// Samples between control value reevaluation (power of two)
    pub control_raster: usize,
    pub control_freq: u32,
}

fn floor_power2(value: usize) -> usize {
    if value == 0 {
        return 0;
    }
    1 << (usize::BITS - 1 - value.leading_zeros())
}

/// Calculate block size and control raster for a latency at `sample_freq`.
///
/// `control_freq` of 0 derives one control evaluation per block.
pub fn constrain(latency_ms: u32, sample_freq: u32, control_freq: u32) -> EngineResult<BlockConfig> {
    if sample_freq < MIN_SAMPLE_FREQ {
        return Err(EngineError::InvalidParam(format!(
            "sample frequency {} below {}",
            sample_freq, MIN_SAMPLE_FREQ
        )));
    }

    // three buffers make up the effective latency
    let latency_ms = latency_ms.clamp(1, 10_000) as u64;
    let block_size = (latency_ms * sample_freq as u64 / 1000 / 3) as usize;
    let upper = (MAX_BLOCK_SIZE / 2).min(sample_freq as usize / 6).max(8);
    let block_size = block_size.clamp(8, upper) & !3;

    let mut control_freq = control_freq.min(sample_freq);
    if control_freq == 0 {
        control_freq = (sample_freq as usize).div_ceil(block_size) as u32;
    }
    let control_raster = (sample_freq as usize).div_ceil(control_freq as usize);
    let control_raster = floor_power2(control_raster.clamp(1, block_size));

    Ok(BlockConfig {
        sample_freq,
        block_size,
        control_raster,
        control_freq,
    })
}
