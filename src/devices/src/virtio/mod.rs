//! Virtio plumbing shared by the guest drivers.
//!
//! The drivers never touch the ring layout or the platform's memory manager
//! directly: both arrive as trait objects at construction time.

pub mod dma;
pub mod queue;
pub mod snd;

pub use self::dma::{CachePolicy, DmaAllocator, DmaBuffer, DmaError};
pub use self::queue::{Descriptor, DeviceQueue, QueueError};
