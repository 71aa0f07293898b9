//! Collaborator interfaces towards the surrounding machine.
//!
//! The model only touches the outside world through the traits in this
//! module: a byte-addressable guest memory, interrupt lines into the
//! interrupt fabric, and (for hardware-assisted streams) the window table of
//! a CPU with an externally managed MMU.

use std::sync::Arc;

use thiserror::Error;

use crate::PeripheralId;
use crate::walker::MmuWindow;

/// Attribution of a guest-memory access to a bus master.
///
/// Structure fetches and queue traffic are issued by the device itself;
/// everything else carries the identity of the initiating peripheral so a
/// multi-master bus can route and trace the access correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryContext {
    /// The device's own structure and queue traffic.
    Smmu,
    /// A downstream peripheral.
    Peripheral(PeripheralId),
}

/// A guest-memory access failed at the bus level.
#[derive(Debug, Clone, Error)]
#[error("bus error accessing {len} bytes at {address:#x}")]
pub struct MemoryError {
    pub address: u64,
    pub len: usize,
}

/// Byte-addressable access to simulated guest memory.
pub trait GuestMemory: Send + Sync {
    fn read_bytes(
        &self,
        address: u64,
        dest: &mut [u8],
        context: MemoryContext,
    ) -> Result<(), MemoryError>;

    fn write_bytes(
        &self,
        address: u64,
        src: &[u8],
        context: MemoryContext,
    ) -> Result<(), MemoryError>;
}

/// An interrupt line into the surrounding interrupt fabric.
pub trait InterruptLine: Send + Sync {
    fn set(&self, high: bool);

    /// Edge-trigger the line. Used where no status bit backs the condition,
    /// so a level would never be deasserted.
    fn pulse(&self) {
        self.set(true);
        self.set(false);
    }
}

/// An interrupt line that goes nowhere.
pub struct NullLine;

impl InterruptLine for NullLine {
    fn set(&self, _high: bool) {}
}

/// Window table of a CPU core whose MMU is managed externally.
///
/// The hardware-assisted stream controller pushes translated windows into
/// this table and relies on the CPU calling back on a miss.
pub trait ExternalMmu: Send + Sync {
    fn install_window(&self, window: &MmuWindow);

    /// Remove the window covering `virtual_address`, if any.
    fn remove_window(&self, virtual_address: u64);

    fn remove_all_windows(&self);
}

/// Interrupt wiring of the device: one global-error and one event-queue line
/// per security domain.
#[derive(Clone)]
pub struct SmmuInterrupts {
    pub gerror: Arc<dyn InterruptLine>,
    pub eventq: Arc<dyn InterruptLine>,
    pub secure_gerror: Arc<dyn InterruptLine>,
    pub secure_eventq: Arc<dyn InterruptLine>,
}

impl Default for SmmuInterrupts {
    fn default() -> Self {
        Self {
            gerror: Arc::new(NullLine),
            eventq: Arc::new(NullLine),
            secure_gerror: Arc::new(NullLine),
            secure_eventq: Arc::new(NullLine),
        }
    }
}
