//! Stream controller back-ends.
//!
//! Every registered stream gets a controller that applies translation
//! results to real bus traffic. Two interchangeable strategies exist:
//!
//! - the software controller keeps its own cache of translated windows and
//!   checks each access against it;
//! - the hardware-assisted controller pushes windows into the requesting
//!   CPU's MMU window table and reacts to the CPU's fault hook, deferring
//!   fault delivery once so the fault event's interrupt can be serviced
//!   before the access repeats - the model's rendition of an asynchronous
//!   external abort.
//!
//! Calls into the CPU's window table are collected as [`ExternalAction`]s
//! and run by the device after it has released its state borrow, because a
//! CPU model may call straight back into the device.

use std::sync::Arc;

use log::trace;

use crate::bus::ExternalMmu;
use crate::walker::MmuWindow;

/// Resolution of a CPU MMU fault reported to the hardware-assisted
/// controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Repeat the access; no fault is delivered to the CPU.
    Retry,
    /// Deliver an external abort.
    ExternalAbort,
}

/// Deferred call into a CPU's window table.
pub(crate) enum ExternalAction {
    Install(Arc<dyn ExternalMmu>, MmuWindow),
    Remove(Arc<dyn ExternalMmu>, u64),
    RemoveAll(Arc<dyn ExternalMmu>),
}

impl ExternalAction {
    pub fn run(self) {
        match self {
            ExternalAction::Install(cpu, window) => cpu.install_window(&window),
            ExternalAction::Remove(cpu, address) => cpu.remove_window(address),
            ExternalAction::RemoveAll(cpu) => cpu.remove_all_windows(),
        }
    }
}

/// Software back-end: a per-stream window cache consulted on every access.
pub(crate) struct SoftwareController {
    pub enabled: bool,
    windows: Vec<MmuWindow>,
}

impl SoftwareController {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            windows: Vec::new(),
        }
    }

    pub fn window_containing(&self, address: u64) -> Option<MmuWindow> {
        self.windows.iter().copied().find(|w| w.contains(address))
    }

    pub fn cache_window(&mut self, window: MmuWindow) {
        trace!(
            "caching window [{:#x}, {:#x}) offset {:#x}",
            window.start, window.end, window.offset
        );
        self.windows.push(window);
    }

    fn invalidate(&mut self, address: Option<u64>) {
        match address {
            Some(address) => self.windows.retain(|w| !w.contains(address)),
            None => self.windows.clear(),
        }
    }
}

/// Hardware-assisted back-end: windows live in the CPU's own table; the
/// controller only keeps the fault-retry state.
pub(crate) struct ExternalMmuController {
    pub enabled: bool,
    pub cpu: Arc<dyn ExternalMmu>,
    /// Set when the last fault was answered with a retry instead of an
    /// abort. One flag for all addresses: back-to-back faults on different
    /// addresses share it, which can over- or under-escalate, and is the
    /// deliberate one-shot-deferral behavior of the modeled hardware.
    pub skipped_last_fault: bool,
}

impl ExternalMmuController {
    pub fn new(enabled: bool, cpu: Arc<dyn ExternalMmu>) -> Self {
        Self {
            enabled,
            cpu,
            skipped_last_fault: false,
        }
    }
}

/// A registered stream's back-end.
pub(crate) enum StreamController {
    Software(SoftwareController),
    External(ExternalMmuController),
}

impl StreamController {
    /// Cascade the owning domain's enable state. Disabling a
    /// hardware-assisted stream withdraws its windows from the CPU.
    pub fn set_enabled(&mut self, enabled: bool, actions: &mut Vec<ExternalAction>) {
        match self {
            StreamController::Software(ctl) => ctl.enabled = enabled,
            StreamController::External(ctl) => {
                ctl.enabled = enabled;
                if !enabled {
                    actions.push(ExternalAction::RemoveAll(ctl.cpu.clone()));
                }
            }
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            StreamController::Software(ctl) => ctl.enabled,
            StreamController::External(ctl) => ctl.enabled,
        }
    }

    /// Drop one cached window or all of them.
    pub fn invalidate_tlb(&mut self, address: Option<u64>, actions: &mut Vec<ExternalAction>) {
        match self {
            StreamController::Software(ctl) => ctl.invalidate(address),
            StreamController::External(ctl) => match address {
                Some(address) => actions.push(ExternalAction::Remove(ctl.cpu.clone(), address)),
                None => actions.push(ExternalAction::RemoveAll(ctl.cpu.clone())),
            },
        }
    }
}
