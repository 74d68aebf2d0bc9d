use std::sync::Arc;

use super::defs::{CTL_INDEX, EVT_INDEX, NUM_QUEUES, RXQ_INDEX, TXQ_INDEX};
use super::device::Snd;
use super::ExecContext;
use crate::virtio::queue::DeviceQueue;

/// Drains `queue` with its interrupt masked, then once more after unmasking
/// to pick up completions that raced with the re-enable.
fn drain_masked<F>(queue: &Arc<dyn DeviceQueue>, mut drain: F) -> usize
where
    F: FnMut() -> usize,
{
    queue.disable_interrupts();
    let mut count = drain();
    queue.enable_interrupts();
    count += drain();
    count
}

impl Snd {
    pub fn handle_ctl_event(&self) -> usize {
        debug!("snd: control queue event");
        drain_masked(self.control().queue(), || {
            self.control().on_completion(ExecContext::Completion)
        })
    }

    pub fn handle_evt_event(&self) -> usize {
        debug!("snd: evt queue event");
        drain_masked(self.events().queue(), || self.events().drain(true))
    }

    pub fn handle_txq_event(&self) -> usize {
        trace!("snd: txq queue event");
        drain_masked(self.tx().queue(), || self.tx().drain())
    }

    pub fn handle_rxq_event(&self) -> usize {
        trace!("snd: rxq queue event");
        drain_masked(self.rx().queue(), || self.drain_rx())
    }

    /// Handles a used-buffer notification for the queue at `queue_index`.
    pub fn process(&self, queue_index: usize) -> usize {
        match queue_index {
            CTL_INDEX => self.handle_ctl_event(),
            EVT_INDEX => self.handle_evt_event(),
            TXQ_INDEX => self.handle_txq_event(),
            RXQ_INDEX => self.handle_rxq_event(),
            _ => {
                warn!("snd: event for unknown queue {}", queue_index);
                0
            }
        }
    }

    /// Handles a device interrupt that does not say which queue it is for.
    pub fn handle_interrupt(&self) -> usize {
        (0..NUM_QUEUES).map(|index| self.process(index)).sum()
    }
}
