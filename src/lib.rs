//! # vm-smmu - ARM SMMUv3 functional model
//!
//! A functional model of an ARM SMMUv3 I/O memory management unit: the
//! device that interposes on every bus transaction issued by a DMA-capable
//! peripheral, translates the transaction address through software-defined
//! page tables, enforces access permissions and reports faults through
//! in-memory event queues.
//!
//! Modeled here:
//! - the wrapping produce/consume queue protocol shared with guest software
//!   (command consumption, event production),
//! - linear stream tables and context descriptors fetched from guest memory,
//! - the VMSAv8-64 / VMSAv8-32 LPAE multi-level page-table walk,
//! - the command interpreter with halt-on-error semantics,
//! - two security domains (Secure and Non-secure), each with its own queues,
//!   stream-table view and interrupt state,
//! - two stream-controller back-ends: a software window check applied per
//!   access, and a hardware-assisted back-end that installs windows into a
//!   CPU's MMU window table and emulates asynchronous external aborts with a
//!   two-phase fault retry.
//!
//! Guest memory, interrupt wiring and CPU window tables are collaborator
//! traits (see [`bus`]); the crate has no opinion about the surrounding
//! machine.

pub mod bits;
pub mod bus;
pub mod commands;
pub mod controller;
pub mod domain;
pub mod error;
pub mod event;
pub mod queue;
pub mod registers;
pub mod smmu;
pub mod structures;
pub mod walker;

pub use bus::{
    ExternalMmu, GuestMemory, InterruptLine, MemoryContext, MemoryError, NullLine, SmmuInterrupts,
};
pub use commands::{Command, CommandError, CommandKind, Opcode};
pub use controller::FaultAction;
pub use error::{SmmuError, SmmuResult};
pub use event::{Event, EventKind};
pub use queue::{Consumer, DecodeElement, EncodeElement, Producer, QueueElement, WrappingQueue};
pub use smmu::{AccessOutcome, Smmu, StreamBackend};
pub use structures::{ContextDescriptor, PageTableEntry, StreamConfig, StreamTableEntry};
pub use walker::MmuWindow;

use bitflags::bitflags;
use std::fmt;

/// Implemented stream id width. The stream table never holds more than
/// `1 << STREAM_ID_BITS` entries regardless of the configured table size.
pub const STREAM_ID_BITS: u32 = 8;

/// Deepest level of the VMSAv8 long-descriptor translation table formats.
pub const MAX_PAGE_TABLE_LEVEL: u32 = 3;

/// Hardware limit on the command queue size shift (log2 of the entry count).
pub const MAX_COMMAND_QUEUE_SHIFT: u32 = 7;

/// Hardware limit on the event queue size shift (log2 of the entry count).
pub const MAX_EVENT_QUEUE_SHIFT: u32 = 7;

/// Security state a stream's traffic and configuration belong to.
///
/// Every domain, queue set and stream-table view is partitioned along this
/// axis; a command issued from one state cannot address structures owned by
/// the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityState {
    NonSecure,
    Secure,
}

/// Opaque identity of a bus master attached downstream of the device.
///
/// The surrounding machine assigns these; the model only compares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(pub u64);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peripheral {:#x}", self.0)
    }
}

/// Registration point of a peripheral: the stream id its transactions carry
/// and the security state they are attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamPoint {
    pub stream_id: u32,
    pub security_state: SecurityState,
}

impl fmt::Display for StreamPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream #{} ({:?})", self.stream_id, self.security_state)
    }
}

bitflags! {
    /// Access kinds a translated window may grant.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}
