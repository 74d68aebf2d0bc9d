//! Guest-side drivers for paravirtualized devices.
//!
//! Only the sound device lives here. The ring implementation, DMA memory and
//! device lifecycle are supplied by the platform through the traits in
//! [`virtio::queue`] and [`virtio::dma`].

#[macro_use]
extern crate log;

pub mod virtio;
