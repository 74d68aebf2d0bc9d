// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use super::rx::RxCompletion;

/// Higher layer that consumes device notifications.
///
/// Every method is called from completion context and must not block.
pub trait SndListener: Send + Sync {
    /// `changed` is false when the device repeated the current state.
    fn jack_changed(&self, _jack_id: u32, _connected: bool, _changed: bool) {}

    fn period_elapsed(&self, _stream_id: u32) {}

    fn xrun(&self, _stream_id: u32) {}

    fn capture_complete(&self, _completion: RxCompletion) {}
}

/// Lightweight stream notification used when no listener is installed.
pub type SignalHook = Box<dyn Fn(u32) + Send + Sync>;
