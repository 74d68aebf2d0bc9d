use std::sync::atomic::{AtomicBool, Ordering};

/// Connection state of the device's jacks, indexed by device jack id.
///
/// Written from completion context by the event drain, read from anywhere.
pub struct JackTable {
    connected: Vec<AtomicBool>,
}

impl JackTable {
    /// Every jack starts out connected.
    pub fn new(count: usize) -> Self {
        JackTable {
            connected: (0..count).map(|_| AtomicBool::new(true)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.connected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }

    pub fn is_connected(&self, jack_id: u32) -> Option<bool> {
        self.connected
            .get(jack_id as usize)
            .map(|flag| flag.load(Ordering::Acquire))
    }

    /// Records a new state and reports whether it flipped, `None` for an
    /// unknown jack.
    pub fn set_connected(&self, jack_id: u32, connected: bool) -> Option<bool> {
        let flag = self.connected.get(jack_id as usize)?;
        Some(flag.swap(connected, Ordering::AcqRel) != connected)
    }

    pub fn snapshot(&self) -> Vec<bool> {
        self.connected
            .iter()
            .map(|flag| flag.load(Ordering::Acquire))
            .collect()
    }
}
