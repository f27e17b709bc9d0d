use std::sync::atomic::Ordering;

use crate::device::{require_words, DeviceBuffer, ExecutionContext, Kernel};
use crate::errors::GroupByError;

/// Exclusive prefix sum over `len` words of `input`, written to `output`.
///
/// Implementations must be deterministic, preserve the total and return only
/// once `output` is complete.
pub trait PrefixScan {
    fn exclusive_scan(&self,
                      ctx: &ExecutionContext,
                      input: &DeviceBuffer,
                      output: &DeviceBuffer,
                      len: usize) -> Result<(), GroupByError>;
}

/// Two-level scan: blocks are scanned independently, then block totals are
/// scanned and added back.
#[derive(Debug, Clone, Copy)]
pub struct BlockScan {
    pub block: usize,
}

impl Default for BlockScan {
    fn default() -> BlockScan {
        BlockScan { block: 1024 }
    }
}

impl PrefixScan for BlockScan {
    fn exclusive_scan(&self,
                      ctx: &ExecutionContext,
                      input: &DeviceBuffer,
                      output: &DeviceBuffer,
                      len: usize) -> Result<(), GroupByError> {
        if self.block == 0 {
            return Err(GroupByError::launch("scan_blocks", "scan block size must be positive"));
        }
        let blocks = len.div_ceil(self.block);
        let block_sums = ctx.alloc_words("scan_block_sums", blocks)?;
        ctx.launch(&ScanBlocks { input, output, block_sums: &block_sums, block: self.block, len }, blocks)?;
        ctx.launch(&ScanBlockSums { block_sums: &block_sums, blocks }, blocks.min(1))?;
        ctx.launch(&AddBlockOffsets { output, block_sums: &block_sums, block: self.block }, len)?;
        Ok(())
    }
}

struct ScanBlocks<'a> {
    input: &'a DeviceBuffer,
    output: &'a DeviceBuffer,
    block_sums: &'a DeviceBuffer,
    block: usize,
    len: usize,
}

impl<'a> Kernel for ScanBlocks<'a> {
    fn name(&self) -> &'static str { "scan_blocks" }

    fn check_args(&self, work_items: usize) -> Result<(), String> {
        require_words(self.input.name(), self.input.word_count(), self.len)?;
        require_words(self.output.name(), self.output.word_count(), self.len)?;
        require_words(self.block_sums.name(), self.block_sums.word_count(), work_items)
    }

    fn run(&self, block: usize) -> Result<(), GroupByError> {
        let start = block * self.block;
        let end = (start + self.block).min(self.len);
        let mut sum = 0u64;
        for i in start..end {
            let value = self.input.word(i).load(Ordering::Relaxed);
            self.output.word(i).store(sum, Ordering::Relaxed);
            sum = sum.checked_add(value).ok_or(GroupByError::Overflow)?;
        }
        self.block_sums.word(block).store(sum, Ordering::Relaxed);
        Ok(())
    }
}

struct ScanBlockSums<'a> {
    block_sums: &'a DeviceBuffer,
    blocks: usize,
}

impl<'a> Kernel for ScanBlockSums<'a> {
    fn name(&self) -> &'static str { "scan_block_sums" }

    fn check_args(&self, work_items: usize) -> Result<(), String> {
        if work_items > 1 {
            return Err(format!("runs as a single work item, got {}", work_items));
        }
        require_words(self.block_sums.name(), self.block_sums.word_count(), self.blocks)
    }

    fn run(&self, _: usize) -> Result<(), GroupByError> {
        let mut sum = 0u64;
        for i in 0..self.blocks {
            let value = self.block_sums.word(i).load(Ordering::Relaxed);
            self.block_sums.word(i).store(sum, Ordering::Relaxed);
            sum = sum.checked_add(value).ok_or(GroupByError::Overflow)?;
        }
        Ok(())
    }
}

struct AddBlockOffsets<'a> {
    output: &'a DeviceBuffer,
    block_sums: &'a DeviceBuffer,
    block: usize,
}

impl<'a> Kernel for AddBlockOffsets<'a> {
    fn name(&self) -> &'static str { "add_block_offsets" }

    fn check_args(&self, work_items: usize) -> Result<(), String> {
        require_words(self.output.name(), self.output.word_count(), work_items)?;
        require_words(self.block_sums.name(), self.block_sums.word_count(), work_items.div_ceil(self.block))
    }

    #[inline]
    fn run(&self, i: usize) -> Result<(), GroupByError> {
        let offset = self.block_sums.word(i / self.block).load(Ordering::Relaxed);
        if offset != 0 {
            self.output.word(i).fetch_add(offset, Ordering::Relaxed);
        }
        Ok(())
    }
}
