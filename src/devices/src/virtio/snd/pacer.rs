//! Period pacing over the cyclic buffer the audio stack plays from.

use std::ops::Range;

use super::defs::MAX_BUFFER_BYTES;
use super::{Error, Result};

/// The byte ranges of the cyclic buffer that make up one period. A period
/// that runs past the end of the buffer continues at its start.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeriodSegments {
    pub first: Range<usize>,
    pub second: Option<Range<usize>>,
}

impl PeriodSegments {
    pub fn len(&self) -> usize {
        self.first.len() + self.second.as_ref().map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves the ranges against `ring`, `None` if it is too short.
    pub fn slices<'a>(&self, ring: &'a [u8]) -> Option<(&'a [u8], Option<&'a [u8]>)> {
        let first = ring.get(self.first.clone())?;
        let second = match &self.second {
            Some(range) => Some(ring.get(range.clone())?),
            None => None,
        };
        Some((first, second))
    }
}

#[derive(Debug)]
pub struct RingPacer {
    buffer_bytes: usize,
    period_bytes: usize,
    position: usize,
    linear_position: u64,
    packets: u64,
}

impl RingPacer {
    pub fn new(buffer_bytes: usize, period_bytes: usize) -> Result<Self> {
        if period_bytes == 0 || period_bytes > buffer_bytes {
            return Err(Error::InvalidParameter("period_bytes"));
        }
        if buffer_bytes > MAX_BUFFER_BYTES {
            return Err(Error::InvalidParameter("buffer_bytes"));
        }
        Ok(RingPacer {
            buffer_bytes,
            period_bytes,
            position: 0,
            linear_position: 0,
            packets: 0,
        })
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    pub fn period_bytes(&self) -> usize {
        self.period_bytes
    }

    /// Offset of the next period in the cyclic buffer.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes handed out since the last reset.
    pub fn linear_position(&self) -> u64 {
        self.linear_position
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// The period that would be handed out next.
    pub fn peek(&self) -> PeriodSegments {
        let start = self.position;
        let end = start + self.period_bytes;
        if end <= self.buffer_bytes {
            PeriodSegments {
                first: start..end,
                second: None,
            }
        } else {
            PeriodSegments {
                first: start..self.buffer_bytes,
                second: Some(0..end - self.buffer_bytes),
            }
        }
    }

    /// Moves past the current period.
    pub fn advance(&mut self) {
        self.position = (self.position + self.period_bytes) % self.buffer_bytes;
        self.linear_position += self.period_bytes as u64;
        self.packets += 1;
    }

    pub fn next_period(&mut self) -> PeriodSegments {
        let segments = self.peek();
        self.advance();
        segments
    }

    pub fn reset(&mut self) {
        self.position = 0;
        self.linear_position = 0;
        self.packets = 0;
    }
}
