use std::sync::atomic::Ordering;

use crate::device::{require_words, DeviceBuffer, Kernel};
use crate::errors::GroupByError;

/// Counts non-empty buckets and flags each of them in `occupancy`.
pub(crate) struct CountGroups<'a> {
    pub histogram: &'a DeviceBuffer,
    pub occupancy: &'a DeviceBuffer,
    pub group_count: &'a DeviceBuffer,
}

impl<'a> Kernel for CountGroups<'a> {
    fn name(&self) -> &'static str { "count_group_num" }

    fn check_args(&self, work_items: usize) -> Result<(), String> {
        require_words(self.histogram.name(), self.histogram.word_count(), work_items)?;
        require_words(self.occupancy.name(), self.occupancy.word_count(), work_items)?;
        require_words(self.group_count.name(), self.group_count.word_count(), 1)
    }

    #[inline]
    fn run(&self, bucket: usize) -> Result<(), GroupByError> {
        if self.histogram.word(bucket).load(Ordering::Relaxed) > 0 {
            self.occupancy.word(bucket).store(1, Ordering::Relaxed);
            self.group_count.word(0).fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
