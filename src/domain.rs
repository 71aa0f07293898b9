//! Per-security-state device state.
//!
//! The device is two nearly independent halves: a Secure and a Non-secure
//! domain, each with its own command queue, event queue, stream-table view,
//! error flags and interrupt lines. A domain caches decoded stream table
//! entries until software explicitly invalidates them; that staleness is
//! deliberate and mirrors the hardware's configuration caching.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, trace};

use crate::bus::InterruptLine;
use crate::commands::{Command, CommandError};
use crate::event::Event;
use crate::queue::{Consumer, Producer, WrappingQueue};
use crate::structures::StreamTableEntry;
use crate::{MAX_COMMAND_QUEUE_SHIFT, MAX_EVENT_QUEUE_SHIFT, STREAM_ID_BITS, SecurityState};

/// Byte-address masks of the base registers' address fields.
const STRTAB_BASE_ADDR_MASK: u64 = ((1 << 56) - 1) & !0x3F;
const QUEUE_BASE_ADDR_MASK: u64 = ((1 << 56) - 1) & !0x1F;

pub(crate) struct Domain {
    pub security_state: SecurityState,
    /// Master enable, cascaded to every stream controller in this security
    /// state. The only state touched by reset.
    pub enabled: bool,

    // Stream table view.
    pub stream_table_base: u64,
    pub stream_table_shift: u32,
    pub stream_table_format: u32,
    pub ste_cache: HashMap<u32, StreamTableEntry>,

    // Command queue, consumer role.
    pub cmdq: WrappingQueue<Command, Consumer>,
    pub cmdq_base_raw: u64,
    pub cmdq_enabled: bool,
    pub cmdq_error_reason: u32,
    /// GERROR.CMDQ_ERR: flipped when a new command error is recorded.
    pub gerror_cmdq_err: bool,
    /// GERRORN.CMDQ_ERR: written by software to acknowledge.
    pub gerrorn_cmdq_err: bool,

    // Event queue, producer role.
    pub evtq: WrappingQueue<Event, Producer>,
    pub evtq_base_raw: u64,
    pub evtq_enabled: bool,
    /// PROD.OVFLG: toggled when an event is lost to a full queue.
    pub evtq_overflow: bool,
    /// CONS.OVACKFLG: written by software to acknowledge the overflow.
    pub evtq_overflow_ack: bool,

    // Interrupt configuration and wiring.
    pub gerror_irq_enabled: bool,
    pub eventq_irq_enabled: bool,
    pub gerror_line: Arc<dyn InterruptLine>,
    pub eventq_line: Arc<dyn InterruptLine>,

    // Control bits that are latched and acknowledged but drive no modeled
    // behavior (page requests, ATS checking, secure instruction fetch).
    pub priq_enabled: bool,
    pub ats_check: bool,
    pub secure_instruction_fetch: bool,
    pub priq_irq_enabled: bool,
}

impl Domain {
    pub fn new(
        security_state: SecurityState,
        gerror_line: Arc<dyn InterruptLine>,
        eventq_line: Arc<dyn InterruptLine>,
    ) -> Self {
        Self {
            security_state,
            enabled: false,
            stream_table_base: 0,
            stream_table_shift: 0,
            stream_table_format: 0,
            ste_cache: HashMap::new(),
            cmdq: WrappingQueue::new(0, 0, MAX_COMMAND_QUEUE_SHIFT),
            cmdq_base_raw: 0,
            cmdq_enabled: false,
            cmdq_error_reason: 0,
            gerror_cmdq_err: false,
            gerrorn_cmdq_err: false,
            evtq: WrappingQueue::new(0, 0, MAX_EVENT_QUEUE_SHIFT),
            evtq_base_raw: 0,
            evtq_enabled: false,
            evtq_overflow: false,
            evtq_overflow_ack: false,
            gerror_irq_enabled: false,
            eventq_irq_enabled: false,
            gerror_line,
            eventq_line,
            priq_enabled: false,
            ats_check: false,
            secure_instruction_fetch: false,
            priq_irq_enabled: false,
        }
    }

    /// Reset clears the enable flag only. Queue geometry, indices and the
    /// stream-table view are software-visible register state; queue contents
    /// live in guest memory, not in the model.
    pub fn reset(&mut self) {
        self.enabled = false;
    }

    /// Number of stream table entries reachable through this domain,
    /// bounded by the implemented stream id width.
    pub fn stream_table_entries(&self) -> u32 {
        1 << self.stream_table_shift.min(STREAM_ID_BITS)
    }

    pub fn set_stream_table_base(&mut self, raw: u64) {
        self.stream_table_base = raw & STRTAB_BASE_ADDR_MASK;
    }

    pub fn set_stream_table_config(&mut self, value: u32) {
        self.stream_table_shift = value & 0x3F;
        self.stream_table_format = (value >> 16) & 0b11;
        if self.stream_table_format == 0b01 {
            error!("two-level stream table is not supported yet");
        }
    }

    pub fn stream_table_config(&self) -> u32 {
        self.stream_table_shift | (self.stream_table_format << 16)
    }

    /// Capture command queue geometry. The size shift is clamped to the
    /// hardware maximum, and the clamped value is what software reads back.
    pub fn set_cmdq_base(&mut self, raw: u64) {
        let shift = (raw as u32 & 0x1F).min(MAX_COMMAND_QUEUE_SHIFT);
        self.cmdq_base_raw = (raw & QUEUE_BASE_ADDR_MASK) | u64::from(shift);
        self.cmdq.reconfigure(
            raw & QUEUE_BASE_ADDR_MASK,
            shift,
            MAX_COMMAND_QUEUE_SHIFT,
        );
    }

    pub fn set_evtq_base(&mut self, raw: u64) {
        let shift = (raw as u32 & 0x1F).min(MAX_EVENT_QUEUE_SHIFT);
        self.evtq_base_raw = (raw & QUEUE_BASE_ADDR_MASK) | u64::from(shift);
        self.evtq
            .reconfigure(raw & QUEUE_BASE_ADDR_MASK, shift, MAX_EVENT_QUEUE_SHIFT);
    }

    /// Drop the cached entry for one stream; the next translation re-reads
    /// it from guest memory.
    pub fn invalidate_ste(&mut self, stream_id: u32) {
        if self.ste_cache.remove(&stream_id).is_some() {
            trace!(
                "invalidated cached STE for stream #{stream_id} ({:?})",
                self.security_state
            );
        }
    }

    /// Invalidate a power-of-two aligned range of streams. The range is
    /// intersected with the implemented stream table; ids past it can never
    /// be cached.
    pub fn invalidate_ste_range(&mut self, stream_id: u32, range: u8) {
        let count = (2u64 << (u32::from(range) + 1)) - 1;
        let start = u64::from(stream_id) & !count;
        let last = (start + count).min(u64::from(1u32 << STREAM_ID_BITS) - 1);
        for id in start..=last {
            self.invalidate_ste(id as u32);
        }
    }

    /// Record a failed command: latch the reason for the consumer register
    /// and flip the global-error flag, but only when software has
    /// acknowledged the previous error. Returns whether the global-error
    /// interrupt should fire.
    pub fn record_command_error(&mut self, error: CommandError) -> bool {
        debug!(
            "command queue error {:?} ({:?})",
            error, self.security_state
        );
        self.cmdq_error_reason = error.reason();
        if self.gerror_cmdq_err == self.gerrorn_cmdq_err {
            self.gerror_cmdq_err = !self.gerror_cmdq_err;
            return self.gerror_irq_enabled;
        }
        false
    }

    /// Whether a command-queue error is pending acknowledgment.
    pub fn command_error_pending(&self) -> bool {
        self.gerror_cmdq_err != self.gerrorn_cmdq_err
    }

    /// An event was lost to a full queue. The overflow flag only toggles
    /// when it matches the acknowledge flag, so a storm of overflows reports
    /// as a single edge until software acknowledges it.
    pub fn note_event_overflow(&mut self) {
        debug!(
            "event queue overflow ({:?}), ack {}",
            self.security_state, self.evtq_overflow_ack
        );
        if self.evtq_overflow == self.evtq_overflow_ack {
            self.evtq_overflow = !self.evtq_overflow;
        }
    }
}
