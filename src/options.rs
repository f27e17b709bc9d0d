use serde::{Deserialize, Serialize};

/// Default number of hash buckets used to assign tuples to groups.
///
/// This is a hard capacity: when a table has more distinct grouping keys than
/// buckets (or two keys hash to the same bucket) the affected groups are
/// merged. Merges are reported as a `CapacityOverflow` but never resized away.
pub const HSIZE: usize = 131072;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Options {
    /// Number of parallel lanes a kernel launch may occupy.
    pub lanes: usize,
    /// Work items per block. Each lane processes whole blocks, grid-stride.
    pub block_size: usize,
    /// Device memory capacity in bytes.
    pub device_memory: usize,
    pub hash_capacity: usize,
    /// Compare every tuple's grouping key against its bucket representative to detect aliased groups.
    pub verify_group_keys: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            lanes: num_cpus::get(),
            block_size: 256,
            device_memory: 4 * 1024 * 1024 * 1024, // 4 GiB
            hash_capacity: HSIZE,
            verify_group_keys: true,
        }
    }
}

impl Options {
    pub fn with_lanes(mut self, lanes: usize) -> Options {
        self.lanes = lanes;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Options {
        self.block_size = block_size;
        self
    }

    pub fn with_device_memory(mut self, bytes: usize) -> Options {
        self.device_memory = bytes;
        self
    }

    pub fn with_hash_capacity(mut self, buckets: usize) -> Options {
        self.hash_capacity = buckets;
        self
    }

    pub fn with_verify_group_keys(mut self, verify: bool) -> Options {
        self.verify_group_keys = verify;
        self
    }
}
