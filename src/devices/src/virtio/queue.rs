use thiserror::Error as ThisError;

/// Errors reported by a device queue implementation.
#[derive(Debug, ThisError, Clone, Copy, Eq, PartialEq)]
pub enum QueueError {
    #[error("Virtqueue has no room for the descriptor chain")]
    Full,
    #[error("Descriptor chain of {0} entries exceeds the queue limit")]
    ChainTooLong(usize),
    #[error("Virtqueue is broken or not yet set up")]
    Broken,
}

/// One segment of a descriptor chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub device_writable: bool,
}

impl Descriptor {
    pub fn readable(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            device_writable: false,
        }
    }

    pub fn writable(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            device_writable: true,
        }
    }
}

/// A driver-side virtqueue.
///
/// Every method is non-blocking and may be called from caller context or
/// from completion context, concurrently. The cookie handed to `submit` is
/// returned unchanged by `pop_completed` together with the number of bytes
/// the device wrote into the device-writable part of the chain.
pub trait DeviceQueue: Send + Sync {
    fn submit(&self, chain: &[Descriptor], cookie: u64) -> Result<(), QueueError>;

    fn pop_completed(&self) -> Option<(u64, u32)>;

    fn kick(&self);

    fn disable_interrupts(&self) {}

    fn enable_interrupts(&self) {}

    /// Ring size, when the implementation knows it.
    fn capacity(&self) -> Option<usize> {
        None
    }
}
