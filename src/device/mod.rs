mod context;
mod kernel;
mod memory;

pub use self::context::ExecutionContext;
pub use self::kernel::{Kernel, LaunchGrid};
pub(crate) use self::kernel::require_words;
pub use self::memory::{DeviceBuffer, MemoryPool};
