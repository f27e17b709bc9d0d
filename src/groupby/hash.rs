use std::hash::Hasher;
use std::sync::atomic::Ordering;

use seahash::SeaHasher;

use crate::device::{require_words, DeviceBuffer, Kernel};
use crate::errors::GroupByError;
use crate::groupby::SourceView;
use crate::table::DataType;

const SEED: u64 = 0x9e37_79b9_7f4a_7c15;
const COMBINE: u64 = 0x0000_0100_0000_01b3;

/// Marks an unused bucket in the representatives buffer.
pub(crate) const NO_TUPLE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GroupColumn {
    pub index: usize,
    pub data_type: DataType,
}

/// Murmur3 64-bit finalizer.
#[inline]
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^ (h >> 33)
}

/// Hashes the grouping columns of a tuple. Numeric columns are mixed as words,
/// fixed-width columns are streamed through seahash. Equal bytes always give
/// equal hashes and column order matters.
#[derive(Clone, Copy)]
pub(crate) struct GroupKeyHasher<'a> {
    pub source: SourceView<'a>,
    pub columns: &'a [GroupColumn],
}

impl<'a> GroupKeyHasher<'a> {
    #[inline]
    pub fn hash(&self, row: usize) -> u64 {
        let mut h = SEED;
        for column in self.columns {
            let size = column.data_type.size();
            let column_hash = match column.data_type {
                DataType::Fixed(_) => {
                    let mut hasher = SeaHasher::new();
                    for chunk in self.source.chunks(column.index, size, row) {
                        hasher.write_u64(chunk);
                    }
                    hasher.finish()
                }
                _ => fmix64(self.source.element(column.index, size, row)),
            };
            h = (h.rotate_left(23) ^ column_hash).wrapping_mul(COMBINE);
        }
        fmix64(h)
    }

    #[inline]
    pub fn bucket(&self, row: usize, capacity: usize) -> usize {
        (self.hash(row) % capacity as u64) as usize
    }

    /// Whether two tuples have byte-identical grouping keys.
    pub fn same_key(&self, a: usize, b: usize) -> bool {
        self.columns.iter().all(|column| {
            let size = column.data_type.size();
            self.source
                .chunks(column.index, size, a)
                .zip(self.source.chunks(column.index, size, b))
                .all(|(x, y)| x == y)
        })
    }
}

/// Assigns every tuple to a bucket, counts tuples per bucket and remembers the
/// lowest tuple index seen in each bucket.
pub(crate) struct BuildGroupKey<'a> {
    pub hasher: GroupKeyHasher<'a>,
    pub hash_capacity: usize,
    pub keys: &'a DeviceBuffer,
    pub histogram: &'a DeviceBuffer,
    pub representatives: Option<&'a DeviceBuffer>,
}

impl<'a> Kernel for BuildGroupKey<'a> {
    fn name(&self) -> &'static str { "build_groupby_key" }

    fn check_args(&self, work_items: usize) -> Result<(), String> {
        if self.hash_capacity == 0 {
            return Err("hash capacity must be positive".to_string());
        }
        require_words(self.keys.name(), self.keys.word_count(), work_items)?;
        require_words(self.histogram.name(), self.histogram.word_count(), self.hash_capacity)?;
        if let Some(representatives) = self.representatives {
            require_words(representatives.name(), representatives.word_count(), self.hash_capacity)?;
        }
        Ok(())
    }

    #[inline]
    fn run(&self, row: usize) -> Result<(), GroupByError> {
        let bucket = self.hasher.bucket(row, self.hash_capacity);
        self.keys.word(row).store(bucket as u64, Ordering::Relaxed);
        self.histogram.word(bucket).fetch_add(1, Ordering::Relaxed);
        if let Some(representatives) = self.representatives {
            representatives.word(bucket).fetch_min(row as u64, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Counts tuples whose grouping key differs from the first tuple in their bucket.
pub(crate) struct VerifyGroupKeys<'a> {
    pub hasher: GroupKeyHasher<'a>,
    pub keys: &'a DeviceBuffer,
    pub representatives: &'a DeviceBuffer,
    pub aliased: &'a DeviceBuffer,
}

impl<'a> Kernel for VerifyGroupKeys<'a> {
    fn name(&self) -> &'static str { "verify_group_keys" }

    fn check_args(&self, work_items: usize) -> Result<(), String> {
        require_words(self.keys.name(), self.keys.word_count(), work_items)?;
        require_words(self.aliased.name(), self.aliased.word_count(), 1)
    }

    fn run(&self, row: usize) -> Result<(), GroupByError> {
        let bucket = self.keys.word(row).load(Ordering::Relaxed) as usize;
        let representative = self.representatives.word(bucket).load(Ordering::Relaxed);
        if representative == NO_TUPLE {
            return Err(fatal!("bucket {} of tuple {} has no representative", bucket, row));
        }
        let representative = representative as usize;
        if representative != row && !self.hasher.same_key(row, representative) {
            self.aliased.word(0).fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ExecutionContext;
    use crate::groupby::pack::pack;
    use crate::options::Options;
    use crate::table::{Column, Table};

    #[test]
    fn test_hash_depends_on_bytes_and_order() {
        let ctx = ExecutionContext::new(&Options::default().with_lanes(1));
        let table = Table::new(vec![
            Column::from_i64(&[1, 2, 1, 2]),
            Column::from_i64(&[2, 1, 2, 1]),
            Column::from_fixed_str(12, &["x", "y", "x", "x"]),
        ]).unwrap();
        let packed = pack(&ctx, &table).unwrap();
        let columns = [
            GroupColumn { index: 0, data_type: DataType::Int64 },
            GroupColumn { index: 1, data_type: DataType::Int64 },
            GroupColumn { index: 2, data_type: DataType::Fixed(12) },
        ];
        let hasher = GroupKeyHasher { source: packed.view(), columns: &columns };
        assert_eq!(hasher.hash(0), hasher.hash(2));
        assert!(hasher.same_key(0, 2));
        assert_ne!(hasher.hash(0), hasher.hash(1));
        assert!(!hasher.same_key(1, 3));

        let ints = GroupKeyHasher { source: packed.view(), columns: &columns[..2] };
        assert_eq!(ints.hash(1), ints.hash(3));
        let swapped = [columns[1], columns[0]];
        let swapped = GroupKeyHasher { source: packed.view(), columns: &swapped };
        assert_ne!(ints.hash(0), swapped.hash(0));
        assert_eq!(ints.hash(0), swapped.hash(1));
    }
}
