use std::sync::{Arc, Mutex};

use scoped_threadpool::Pool;

use crate::device::kernel::{Kernel, LaunchGrid};
use crate::device::memory::{DeviceBuffer, MemoryPool};
use crate::errors::GroupByError;
use crate::options::Options;

/// A command queue over one device: memory pool plus the lanes kernels run on.
///
/// Every operation is blocking. Kernel launches take the queue lock, so launches
/// from different callers sharing a context execute one after another.
pub struct ExecutionContext {
    opts: Options,
    memory: Arc<MemoryPool>,
    queue: Mutex<Pool>,
}

impl ExecutionContext {
    /// `opts.lanes` is clamped to at least one lane; `opts()` reports the clamped value.
    pub fn new(opts: &Options) -> ExecutionContext {
        let lanes = opts.lanes.clamp(1, u32::MAX as usize);
        ExecutionContext {
            opts: Options { lanes, ..opts.clone() },
            memory: MemoryPool::new(opts.device_memory),
            queue: Mutex::new(Pool::new(lanes as u32)),
        }
    }

    pub fn opts(&self) -> &Options {
        &self.opts
    }

    pub fn memory(&self) -> &Arc<MemoryPool> {
        &self.memory
    }

    pub fn alloc(&self, name: &'static str, len: usize) -> Result<DeviceBuffer, GroupByError> {
        self.memory.allocate(name, len)
    }

    pub fn alloc_words(&self, name: &'static str, words: usize) -> Result<DeviceBuffer, GroupByError> {
        let len = words
            .checked_mul(8)
            .ok_or(GroupByError::Allocation { buffer: name, requested: usize::MAX, available: 0 })?;
        self.alloc(name, len)
    }

    pub fn upload_words(&self, name: &'static str, data: &[u64]) -> Result<DeviceBuffer, GroupByError> {
        let buffer = self.alloc_words(name, data.len())?;
        for (i, &value) in data.iter().enumerate() {
            buffer.store(i * 8, 8, value);
        }
        Ok(buffer)
    }

    /// Blocking host to device transfer of `src` into `dst` at `offset`.
    pub fn write_buffer(&self, dst: &DeviceBuffer, offset: usize, src: &[u8]) -> Result<(), GroupByError> {
        self.check_range(dst, offset, src.len())?;
        dst.write_from(offset, src);
        Ok(())
    }

    pub fn copy_buffer(&self,
                       src: &DeviceBuffer,
                       src_offset: usize,
                       dst: &DeviceBuffer,
                       dst_offset: usize,
                       len: usize) -> Result<(), GroupByError> {
        self.check_range(src, src_offset, len)?;
        self.check_range(dst, dst_offset, len)?;
        src.copy_to(src_offset, dst, dst_offset, len);
        Ok(())
    }

    /// Blocking device to host transfer.
    pub fn read_buffer(&self, src: &DeviceBuffer, offset: usize, dst: &mut [u8]) -> Result<(), GroupByError> {
        self.check_range(src, offset, dst.len())?;
        src.read_into(offset, dst);
        Ok(())
    }

    pub fn read_word(&self, src: &DeviceBuffer, index: usize) -> Result<u64, GroupByError> {
        self.check_range(src, index * 8, 8)?;
        Ok(src.load(index * 8, 8))
    }

    pub fn read_words(&self, src: &DeviceBuffer, count: usize) -> Result<Vec<u64>, GroupByError> {
        self.check_range(src, 0, count * 8)?;
        Ok((0..count).map(|i| src.load(i * 8, 8)).collect())
    }

    pub fn fill_words(&self, dst: &DeviceBuffer, first: usize, count: usize, value: u64) -> Result<(), GroupByError> {
        self.check_range(dst, first * 8, count * 8)?;
        for i in first..first + count {
            dst.store(i * 8, 8, value);
        }
        Ok(())
    }

    /// Runs `kernel` over `work_items` items and waits for every lane to finish.
    /// Returns the first fault raised by any work item.
    pub fn launch(&self, kernel: &dyn Kernel, work_items: usize) -> Result<LaunchGrid, GroupByError> {
        kernel
            .check_args(work_items)
            .map_err(|reason| GroupByError::launch(kernel.name(), reason))?;
        let grid = LaunchGrid::for_work(work_items, self.opts.block_size, self.opts.lanes)
            .map_err(|reason| GroupByError::launch(kernel.name(), reason))?;
        log::trace!("launching {} over {} items ({:?})", kernel.name(), work_items, grid);
        if work_items == 0 {
            return Ok(grid);
        }

        let mut pool = self
            .queue
            .lock()
            .map_err(|_| GroupByError::launch(kernel.name(), "command queue poisoned by an earlier launch"))?;
        let fault: Mutex<Option<GroupByError>> = Mutex::new(None);
        pool.scoped(|scope| {
            for lane in 0..grid.lanes {
                let fault = &fault;
                scope.execute(move || {
                    for item in grid.items(lane, work_items) {
                        if let Err(err) = kernel.run(item) {
                            if let Ok(mut fault) = fault.lock() {
                                fault.get_or_insert(err);
                            }
                            return;
                        }
                    }
                });
            }
        });
        match fault.into_inner() {
            Ok(None) => Ok(grid),
            Ok(Some(err)) => Err(err),
            Err(_) => Err(GroupByError::launch(kernel.name(), "lane panicked")),
        }
    }

    fn check_range(&self, buffer: &DeviceBuffer, offset: usize, len: usize) -> Result<(), GroupByError> {
        if !buffer.belongs_to(&self.memory) {
            return Err(GroupByError::Transfer(format!("{} was allocated on a different device", buffer.name())));
        }
        match offset.checked_add(len) {
            Some(end) if end <= buffer.len() => Ok(()),
            _ => Err(GroupByError::Transfer(format!(
                "range {}..{} out of bounds for {} ({} bytes)",
                offset,
                offset.saturating_add(len),
                buffer.name(),
                buffer.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;

    struct Increment<'a> {
        counters: &'a DeviceBuffer,
    }

    impl<'a> Kernel for Increment<'a> {
        fn name(&self) -> &'static str { "increment" }

        fn check_args(&self, work_items: usize) -> Result<(), String> {
            crate::device::kernel::require_words(self.counters.name(), self.counters.word_count(), work_items)
        }

        fn run(&self, item: usize) -> Result<(), GroupByError> {
            self.counters.word(item).fetch_add(item as u64 + 1, Ordering::Relaxed);
            self.counters.word(0).fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Faulty;

    impl Kernel for Faulty {
        fn name(&self) -> &'static str { "faulty" }

        fn run(&self, item: usize) -> Result<(), GroupByError> {
            if item == 77 { Err(GroupByError::Overflow) } else { Ok(()) }
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new(&Options::default().with_lanes(4).with_block_size(8))
    }

    #[test]
    fn test_launch_runs_every_item() {
        let ctx = context();
        let counters = ctx.alloc_words("counters", 100).unwrap();
        let grid = ctx.launch(&Increment { counters: &counters }, 100).unwrap();
        assert_eq!(grid, LaunchGrid { block_size: 8, blocks: 13, lanes: 4 });
        let words = ctx.read_words(&counters, 100).unwrap();
        assert_eq!(words[0], 101);
        assert!(words.iter().enumerate().skip(1).all(|(i, &w)| w == i as u64 + 1));
    }

    #[test]
    fn test_zero_lanes_runs_on_one_lane() {
        let ctx = ExecutionContext::new(&Options::default().with_lanes(0).with_block_size(8));
        assert_eq!(ctx.opts().lanes, 1);
        let counters = ctx.alloc_words("counters", 20).unwrap();
        let grid = ctx.launch(&Increment { counters: &counters }, 20).unwrap();
        assert_eq!(grid, LaunchGrid { block_size: 8, blocks: 3, lanes: 1 });
        assert_eq!(ctx.read_word(&counters, 0).unwrap(), 21);
    }

    #[test]
    fn test_launch_rejects_short_buffers() {
        let ctx = context();
        let counters = ctx.alloc_words("counters", 10).unwrap();
        match ctx.launch(&Increment { counters: &counters }, 11) {
            Err(GroupByError::KernelLaunch { kernel, .. }) => assert_eq!(kernel, "increment"),
            other => panic!("expected launch error, got {:?}", other),
        }
        assert_eq!(ctx.read_word(&counters, 0).unwrap(), 0);
    }

    #[test]
    fn test_launch_propagates_fault() {
        let ctx = context();
        assert!(matches!(ctx.launch(&Faulty, 200), Err(GroupByError::Overflow)));
        assert!(ctx.launch(&Faulty, 50).is_ok());
    }

    #[test]
    fn test_transfers_check_bounds_and_device() {
        let ctx = context();
        let other = context();
        let buffer = ctx.alloc("buffer", 16).unwrap();
        let foreign = other.alloc("foreign", 16).unwrap();
        ctx.write_buffer(&buffer, 8, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert!(matches!(ctx.write_buffer(&buffer, 12, &[0; 8]), Err(GroupByError::Transfer(_))));
        assert!(matches!(ctx.copy_buffer(&foreign, 0, &buffer, 0, 8), Err(GroupByError::Transfer(_))));
        let mut out = [0u8; 4];
        ctx.read_buffer(&buffer, 10, &mut out).unwrap();
        assert_eq!(out, [3, 4, 5, 6]);
    }
}
