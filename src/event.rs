//! Fault event records produced into a domain's event queue.

use crate::bits::{deposit, deposit_bit};
use crate::queue::{EncodeElement, QueueElement};

/// Encoded width of one event record.
pub const EVENT_BYTES: usize = 32;

/// Event record types the model raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    BadStreamId = 0x02,
    BadStreamTableEntry = 0x04,
    StreamDisabled = 0x06,
    TranslationFault = 0x10,
    AddressSizeFault = 0x11,
    AccessFault = 0x12,
    PermissionFault = 0x13,
}

/// A translation or configuration fault, as written to guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub stream_id: u32,
    pub substream_id: Option<u32>,
    /// Input address of the faulting transaction, when one exists.
    pub address: Option<u64>,
}

impl Event {
    pub fn translation_fault(stream_id: u32, address: u64) -> Self {
        Self {
            kind: EventKind::TranslationFault,
            stream_id,
            substream_id: None,
            address: Some(address),
        }
    }

    pub fn permission_fault(stream_id: u32, address: u64) -> Self {
        Self {
            kind: EventKind::PermissionFault,
            stream_id,
            substream_id: None,
            address: Some(address),
        }
    }
}

impl QueueElement for Event {
    const WIDTH: usize = EVENT_BYTES;
}

impl EncodeElement for Event {
    fn encode(&self, raw: &mut [u8]) {
        raw.fill(0);
        deposit(raw, 0, 8, self.kind as u64);
        if let Some(substream) = self.substream_id {
            deposit_bit(raw, 11, true);
            deposit(raw, 12, 20, u64::from(substream));
        }
        deposit(raw, 32, 32, u64::from(self.stream_id));
        deposit(raw, 192, 64, self.address.unwrap_or(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::extract;

    #[test]
    fn encode_places_fields_at_documented_offsets() {
        let event = Event {
            kind: EventKind::PermissionFault,
            stream_id: 0x42,
            substream_id: Some(0x7),
            address: Some(0xDEAD_B000),
        };
        let mut raw = [0u8; EVENT_BYTES];
        event.encode(&mut raw);

        assert_eq!(extract(&raw, 0, 8), 0x13);
        assert_eq!(extract(&raw, 11, 1), 1);
        assert_eq!(extract(&raw, 12, 20), 0x7);
        assert_eq!(extract(&raw, 32, 32), 0x42);
        assert_eq!(extract(&raw, 192, 64), 0xDEAD_B000);
    }

    #[test]
    fn encode_without_substream_clears_ssv() {
        let event = Event::translation_fault(9, 0x1000);
        let mut raw = [0xFFu8; EVENT_BYTES];
        event.encode(&mut raw);

        assert_eq!(extract(&raw, 0, 8), 0x10);
        assert_eq!(extract(&raw, 11, 1), 0);
        assert_eq!(extract(&raw, 32, 32), 9);
    }
}
