//! Shared constant-value blocks
//!
//! Blocks backing `ProcessContext::set_output_const`, kept sorted by value
//! and aged out after a number of unused process cycles.

use std::sync::Arc;

use parking_lot::Mutex;
use sigflow_core::{MAX_BLOCK_SIZE, Sample};

/// Process cycles an unused block survives
const CONST_VALUES_EXPIRE: u8 = 16;

struct ConstBlock {
    value: Sample,
    block: Arc<[Sample]>,
    age: u8,
}

pub(crate) struct ConstValueCache {
    blocks: Mutex<Vec<ConstBlock>>,
}

impl ConstValueCache {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(Vec::new()),
        }
    }

    /// Block of `MAX_BLOCK_SIZE` samples all equal to `value`
    pub fn values(&self, value: Sample) -> Arc<[Sample]> {
        let mut blocks = self.blocks.lock();
        match blocks.binary_search_by(|b| b.value.total_cmp(&value)) {
            Ok(pos) => {
                let entry = &mut blocks[pos];
                entry.age = CONST_VALUES_EXPIRE;
                Arc::clone(&entry.block)
            }
            Err(pos) => {
                let block: Arc<[Sample]> = vec![value; MAX_BLOCK_SIZE].into();
                blocks.insert(
                    pos,
                    ConstBlock {
                        value,
                        block: Arc::clone(&block),
                        age: CONST_VALUES_EXPIRE,
                    },
                );
                block
            }
        }
    }

    /// Age all blocks by one cycle; returns those that expired
    pub fn recycle(&self, nuke_all: bool) -> Vec<Arc<[Sample]>> {
        let mut blocks = self.blocks.lock();
        let mut expired = Vec::new();
        blocks.retain_mut(|b| {
            b.age = b.age.saturating_sub(1);
            if nuke_all || b.age == 0 {
                expired.push(Arc::clone(&b.block));
                false
            } else {
                true
            }
        });
        expired
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }
}
