//! Sample type and block limits

/// Type alias for audio samples
pub type Sample = f32;

/// Upper bound for samples processed per block; stream buffers are sized to it
pub const MAX_BLOCK_SIZE: usize = 2048;

/// Maximum number of file descriptors all poll functions may register
pub const MAX_POLLFDS: usize = 128;

/// Tick stamp sentinel meaning "infinitely far in the future"
pub const MAX_TICK_STAMP: u64 = u64::MAX;

/// Fill a block with a constant value
#[inline]
pub fn block_fill(block: &mut [Sample], value: Sample) {
    block.fill(value);
}

/// Copy `src` into the start of `dst`
#[inline]
pub fn block_copy(dst: &mut [Sample], src: &[Sample]) {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
}
