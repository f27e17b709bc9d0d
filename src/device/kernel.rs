use crate::errors::GroupByError;

/// A compute kernel bound to its arguments.
///
/// A kernel value is the complete launch request: the struct names the kernel
/// and holds every buffer and scalar it reads or writes. Nothing is bound on
/// the execution context, so independent launches never share argument state.
pub trait Kernel: Sync {
    fn name(&self) -> &'static str;

    /// Rejects the launch before dispatch, e.g. when a bound buffer is too small for `work_items`.
    fn check_args(&self, _work_items: usize) -> Result<(), String> {
        Ok(())
    }

    /// Processes one work item. Items are independent and run in any order.
    fn run(&self, item: usize) -> Result<(), GroupByError>;
}

/// Work distribution of one launch: `blocks` blocks of `block_size` items, handed to
/// `lanes` parallel lanes in grid-stride order (lane `l` runs blocks `l`, `l + lanes`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGrid {
    pub block_size: usize,
    pub blocks: usize,
    pub lanes: usize,
}

impl LaunchGrid {
    pub fn for_work(work_items: usize, block_size: usize, max_lanes: usize) -> Result<LaunchGrid, String> {
        if block_size == 0 {
            return Err("block size must be positive".to_string());
        }
        if max_lanes == 0 {
            return Err("no lanes available".to_string());
        }
        let blocks = work_items.div_ceil(block_size);
        Ok(LaunchGrid {
            block_size,
            blocks,
            lanes: blocks.min(max_lanes),
        })
    }

    pub fn items(&self, lane: usize, work_items: usize) -> impl Iterator<Item = usize> {
        let block_size = self.block_size;
        (lane..self.blocks)
            .step_by(self.lanes.max(1))
            .flat_map(move |block| block * block_size..((block + 1) * block_size).min(work_items))
    }
}

pub(crate) fn require_words(buffer_name: &str, word_count: usize, required: usize) -> Result<(), String> {
    if word_count < required {
        Err(format!("{} holds {} words, launch needs {}", buffer_name, word_count, required))
    } else {
        Ok(())
    }
}
