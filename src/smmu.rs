//! The device itself: stream registry, translation entry points, command
//! queue draining and event signaling.
//!
//! All mutable state lives behind one re-entrant lock. Command execution
//! fetches structures through the same bus that carries the traffic being
//! translated, so the lock may be re-taken on the same thread; `RefCell`
//! borrows are therefore never held across calls into collaborators (guest
//! memory, interrupt lines, CPU window tables).

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use parking_lot::ReentrantMutex;

use crate::bus::{ExternalMmu, GuestMemory, MemoryContext, SmmuInterrupts};
use crate::commands::{CommandError, CommandKind};
use crate::controller::{
    ExternalAction, ExternalMmuController, FaultAction, SoftwareController, StreamController,
};
use crate::domain::Domain;
use crate::error::{SmmuError, SmmuResult};
use crate::event::Event;
use crate::structures::{CD_BYTES, ContextDescriptor, STE_BYTES, StreamConfig, StreamTableEntry};
use crate::walker::{self, MmuWindow};
use crate::{AccessFlags, PeripheralId, SecurityState, StreamPoint};

/// Back-end wiring for a stream registration.
pub enum StreamBackend {
    /// A DMA-capable bus peripheral; the device checks each access in
    /// software against its window cache.
    Bus,
    /// A CPU whose MMU window table the device manages directly.
    ExternalMmu(Arc<dyn ExternalMmu>),
}

/// Result of checking one bus access on a software-controlled stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    /// Access allowed; perform it at the translated address.
    Translated(u64),
    /// Access denied; the corresponding fault event has been signaled.
    Fault,
}

pub(crate) struct Inner {
    pub(crate) nonsecure: Domain,
    pub(crate) secure: Domain,
    pub(crate) streams: HashMap<StreamPoint, PeripheralId>,
    pub(crate) peripherals: HashMap<PeripheralId, StreamPoint>,
    pub(crate) controllers: HashMap<StreamPoint, StreamController>,
    // Implementation-defined scratch registers.
    pub(crate) agbpa: u32,
    pub(crate) vatos_sid: u64,
    pub(crate) vatos_addr: u64,
}

impl Inner {
    pub(crate) fn domain(&self, state: SecurityState) -> &Domain {
        match state {
            SecurityState::NonSecure => &self.nonsecure,
            SecurityState::Secure => &self.secure,
        }
    }

    pub(crate) fn domain_mut(&mut self, state: SecurityState) -> &mut Domain {
        match state {
            SecurityState::NonSecure => &mut self.nonsecure,
            SecurityState::Secure => &mut self.secure,
        }
    }
}

/// Functional model of an SMMUv3 translation unit.
pub struct Smmu {
    pub(crate) memory: Arc<dyn GuestMemory>,
    pub(crate) context: MemoryContext,
    pub(crate) inner: ReentrantMutex<RefCell<Inner>>,
}

impl Smmu {
    pub fn new(memory: Arc<dyn GuestMemory>, interrupts: SmmuInterrupts) -> Self {
        let inner = Inner {
            nonsecure: Domain::new(
                SecurityState::NonSecure,
                interrupts.gerror,
                interrupts.eventq,
            ),
            secure: Domain::new(
                SecurityState::Secure,
                interrupts.secure_gerror,
                interrupts.secure_eventq,
            ),
            streams: HashMap::new(),
            peripherals: HashMap::new(),
            controllers: HashMap::new(),
            agbpa: 0,
            vatos_sid: 0,
            vatos_addr: 0,
        };
        Self {
            memory,
            context: MemoryContext::Smmu,
            inner: ReentrantMutex::new(RefCell::new(inner)),
        }
    }

    /// Attach a peripheral downstream of the device. The registration point
    /// must be unique in both directions.
    pub fn register_stream(
        &self,
        peripheral: PeripheralId,
        point: StreamPoint,
        backend: StreamBackend,
    ) -> SmmuResult<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.streams.contains_key(&point) {
            return Err(SmmuError::StreamAlreadyRegistered { point });
        }
        if inner.peripherals.contains_key(&peripheral) {
            return Err(SmmuError::PeripheralAlreadyRegistered(peripheral));
        }

        let enabled = inner.domain(point.security_state).enabled;
        let controller = match backend {
            StreamBackend::Bus => StreamController::Software(SoftwareController::new(enabled)),
            StreamBackend::ExternalMmu(cpu) => {
                StreamController::External(ExternalMmuController::new(enabled, cpu))
            }
        };
        inner.streams.insert(point, peripheral);
        inner.peripherals.insert(peripheral, point);
        inner.controllers.insert(point, controller);
        debug!("registered {peripheral} as {point}");
        Ok(())
    }

    /// Detach a peripheral. Windows installed on its behalf are withdrawn.
    pub fn unregister_stream(&self, peripheral: PeripheralId) -> SmmuResult<()> {
        let guard = self.inner.lock();
        let actions = {
            let mut inner = guard.borrow_mut();
            let point = inner
                .peripherals
                .remove(&peripheral)
                .ok_or(SmmuError::UnknownPeripheral(peripheral))?;
            inner.streams.remove(&point);
            match inner.controllers.remove(&point) {
                Some(StreamController::External(ctl)) => {
                    vec![ExternalAction::RemoveAll(ctl.cpu)]
                }
                _ => Vec::new(),
            }
        };
        for action in actions {
            action.run();
        }
        Ok(())
    }

    /// Registered streams, for the surrounding machine's bookkeeping.
    pub fn registered_streams(&self) -> Vec<(StreamPoint, PeripheralId)> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .streams
            .iter()
            .map(|(&point, &peripheral)| (point, peripheral))
            .collect()
    }

    /// Device reset: clears the enable flag of both domains and nothing
    /// else. Queue contents live in guest memory, not in the model.
    pub fn reset(&self) {
        let guard = self.inner.lock();
        let actions = {
            let mut inner = guard.borrow_mut();
            inner.nonsecure.reset();
            inner.secure.reset();
            let mut actions = Vec::new();
            for controller in inner.controllers.values_mut() {
                controller.set_enabled(false, &mut actions);
            }
            actions
        };
        for action in actions {
            action.run();
        }
    }

    /// Drop one cached translation or all of them, across every stream
    /// controller of both domains.
    pub fn invalidate_tlb(&self, address: Option<u64>) {
        let guard = self.inner.lock();
        let actions = {
            let mut inner = guard.borrow_mut();
            let mut actions = Vec::new();
            Self::invalidate_controllers(&mut inner, address, &mut actions);
            actions
        };
        for action in actions {
            action.run();
        }
    }

    /// Resolve a window for `address` through the page tables configured
    /// for the peripheral's stream.
    ///
    /// The stream table entry is served from the cache when present and
    /// only (re)fetched on a miss; the context descriptor is re-read from
    /// guest memory on every call. Returns `None` on aborting streams and
    /// on every translation failure; no event is raised here.
    pub fn window_from_page_table(
        &self,
        address: u64,
        peripheral: PeripheralId,
    ) -> Option<MmuWindow> {
        let guard = self.inner.lock();
        self.window_from_page_table_locked(&guard, address, peripheral)
    }

    /// Check one access of a software-controlled stream: window cache hit,
    /// or walk and cache. Denials signal the matching fault event - a
    /// permission fault when a window exists but does not grant the access,
    /// a translation fault when no window could be produced at all.
    pub fn validate_access(
        &self,
        peripheral: PeripheralId,
        address: u64,
        access: AccessFlags,
    ) -> SmmuResult<AccessOutcome> {
        let guard = self.inner.lock();
        let point = self.stream_point(&guard, peripheral)?;

        let (enabled, cached) = {
            let inner = guard.borrow();
            let controller = inner
                .controllers
                .get(&point)
                .ok_or(SmmuError::UnknownPeripheral(peripheral))?;
            match controller {
                StreamController::Software(ctl) => (ctl.enabled, ctl.window_containing(address)),
                StreamController::External(_) => {
                    return Err(SmmuError::NotABusStream(peripheral));
                }
            }
        };

        if !enabled {
            return Ok(AccessOutcome::Translated(address));
        }

        let window = match cached {
            Some(window) => Some(window),
            None => {
                let walked = self.window_from_page_table_locked(&guard, address, peripheral);
                if let Some(window) = walked {
                    let mut inner = guard.borrow_mut();
                    if let Some(StreamController::Software(ctl)) =
                        inner.controllers.get_mut(&point)
                    {
                        ctl.cache_window(window);
                    }
                }
                walked
            }
        };

        match window {
            None => {
                self.signal_event(
                    &guard,
                    point.security_state,
                    Event::translation_fault(point.stream_id, address),
                    true,
                );
                Ok(AccessOutcome::Fault)
            }
            Some(window) if window.grants(access) => {
                Ok(AccessOutcome::Translated(window.translate(address)))
            }
            Some(_) => {
                self.signal_event(
                    &guard,
                    point.security_state,
                    Event::permission_fault(point.stream_id, address),
                    true,
                );
                Ok(AccessOutcome::Fault)
            }
        }
    }

    /// Fault hook for hardware-assisted streams, called by the CPU model
    /// when an access misses its window table or violates a window's
    /// permissions.
    ///
    /// First fault: walk, install the window, record the fault event when
    /// the window still denies the access, and answer with a plain retry so
    /// the event interrupt can be serviced before the access repeats.
    /// Second consecutive fault: escalate to an external abort without
    /// walking again, suppressing the duplicate event. A failed walk aborts
    /// immediately at any phase.
    pub fn handle_mmu_fault(
        &self,
        peripheral: PeripheralId,
        address: u64,
        access: AccessFlags,
    ) -> SmmuResult<FaultAction> {
        let guard = self.inner.lock();
        let point = self.stream_point(&guard, peripheral)?;

        let (enabled, skipped, cpu) = {
            let inner = guard.borrow();
            let controller = inner
                .controllers
                .get(&point)
                .ok_or(SmmuError::UnknownPeripheral(peripheral))?;
            match controller {
                StreamController::External(ctl) => {
                    (ctl.enabled, ctl.skipped_last_fault, ctl.cpu.clone())
                }
                StreamController::Software(_) => {
                    return Err(SmmuError::NotAnExternalMmuStream(peripheral));
                }
            }
        };

        if !enabled {
            // Translation disabled: traffic bypasses the device.
            ExternalAction::Install(cpu, MmuWindow::bypass()).run();
            return Ok(FaultAction::Retry);
        }

        if skipped {
            // The fault was already deferred once; hardware delivers the
            // abort now, without re-reporting the event.
            self.set_skipped_fault(&guard, point, false);
            self.signal_event(
                &guard,
                point.security_state,
                Event::permission_fault(point.stream_id, address),
                false,
            );
            return Ok(FaultAction::ExternalAbort);
        }

        match self.window_from_page_table_locked(&guard, address, peripheral) {
            None => {
                self.signal_event(
                    &guard,
                    point.security_state,
                    Event::translation_fault(point.stream_id, address),
                    true,
                );
                Ok(FaultAction::ExternalAbort)
            }
            Some(window) => {
                ExternalAction::Install(cpu, window).run();
                if window.grants(access) {
                    // A plain miss; the refilled window satisfies the
                    // access, nothing to report.
                    return Ok(FaultAction::Retry);
                }
                self.signal_event(
                    &guard,
                    point.security_state,
                    Event::permission_fault(point.stream_id, address),
                    true,
                );
                self.set_skipped_fault(&guard, point, true);
                Ok(FaultAction::Retry)
            }
        }
    }

    fn stream_point(
        &self,
        cell: &RefCell<Inner>,
        peripheral: PeripheralId,
    ) -> SmmuResult<StreamPoint> {
        cell.borrow()
            .peripherals
            .get(&peripheral)
            .copied()
            .ok_or(SmmuError::UnknownPeripheral(peripheral))
    }

    fn set_skipped_fault(&self, cell: &RefCell<Inner>, point: StreamPoint, value: bool) {
        if let Some(StreamController::External(ctl)) =
            cell.borrow_mut().controllers.get_mut(&point)
        {
            ctl.skipped_last_fault = value;
        }
    }

    pub(crate) fn window_from_page_table_locked(
        &self,
        cell: &RefCell<Inner>,
        address: u64,
        peripheral: PeripheralId,
    ) -> Option<MmuWindow> {
        let Some(point) = cell.borrow().peripherals.get(&peripheral).copied() else {
            warn!("no stream for context {peripheral}");
            return None;
        };
        let state = point.security_state;
        let stream_id = point.stream_id;

        let cached = {
            let inner = cell.borrow();
            let domain = inner.domain(state);
            if stream_id >= domain.stream_table_entries() {
                warn!(
                    "stream #{stream_id} is outside the {}-entry stream table",
                    domain.stream_table_entries()
                );
                return None;
            }
            domain.ste_cache.get(&stream_id).copied()
        };

        let ste = match cached {
            Some(ste) => ste,
            None => {
                let table_base = cell.borrow().domain(state).stream_table_base;
                let entry_address = table_base + u64::from(stream_id) * STE_BYTES as u64;
                let mut raw = [0u8; STE_BYTES];
                if let Err(fault) = self.memory.read_bytes(entry_address, &mut raw, self.context) {
                    warn!("stream table fetch failed for stream #{stream_id}: {fault}");
                    return None;
                }
                let ste = StreamTableEntry::decode(&raw);
                trace!("caching STE for stream #{stream_id}: {ste:?}");
                cell.borrow_mut()
                    .domain_mut(state)
                    .ste_cache
                    .insert(stream_id, ste);
                ste
            }
        };

        match ste.config {
            StreamConfig::Abort => {
                debug!("stream #{stream_id} is configured to abort transactions");
                None
            }
            StreamConfig::Bypass => Some(MmuWindow::bypass()),
            _ => {
                let mut raw = [0u8; CD_BYTES];
                if let Err(fault) =
                    self.memory
                        .read_bytes(ste.s1_context_ptr, &mut raw, self.context)
                {
                    warn!("context descriptor fetch failed for stream #{stream_id}: {fault}");
                    return None;
                }
                let cd = ContextDescriptor::decode(&raw);
                walker::walk(
                    &*self.memory,
                    self.context,
                    &cd,
                    address,
                    ste.privileged(),
                )
            }
        }
    }

    /// Queue a fault event into a domain's event queue.
    ///
    /// `record == false` suppresses the event entirely; the fault-retry
    /// protocol uses it to avoid reporting the same underlying fault twice.
    /// A disabled queue drops the event with a diagnostic. On the empty to
    /// non-empty transition the event interrupt is pulsed - there is no
    /// status bit for this condition, so a level would stick.
    pub(crate) fn signal_event(
        &self,
        cell: &RefCell<Inner>,
        state: SecurityState,
        event: Event,
        record: bool,
    ) {
        if !record {
            trace!("suppressing duplicate event {event:?}");
            return;
        }

        let (enabled, queue) = {
            let inner = cell.borrow();
            let domain = inner.domain(state);
            (domain.evtq_enabled, domain.evtq)
        };
        if !enabled {
            debug!("event queue is disabled ({state:?}), dropping event {event:?}");
            return;
        }

        let was_empty = queue.is_empty();
        let mut queue = queue;
        match queue.try_enqueue(&event, &*self.memory, self.context) {
            Err(fault) => warn!("failed to write event record: {fault}"),
            Ok(true) => {
                let line = {
                    let mut inner = cell.borrow_mut();
                    let domain = inner.domain_mut(state);
                    domain.evtq = queue;
                    (was_empty && domain.eventq_irq_enabled).then(|| domain.eventq_line.clone())
                };
                if let Some(line) = line {
                    line.pulse();
                }
            }
            Ok(false) => cell.borrow_mut().domain_mut(state).note_event_overflow(),
        }
    }

    /// Drain the command queue: peek, execute, advance, until the queue is
    /// empty or a command fails. On failure the consume index stays on the
    /// failed command so software can inspect it; the model never skips on
    /// its own.
    pub(crate) fn process_command_queue(&self, cell: &RefCell<Inner>, state: SecurityState) {
        loop {
            let queue = cell.borrow().domain(state).cmdq;
            let command = match queue.try_peek(&*self.memory, self.context) {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(fault) => {
                    error!("command fetch failed: {fault}");
                    self.halt_command_queue(cell, state, CommandError::Abort);
                    break;
                }
            };
            trace!("executing {:?} ({state:?})", command.kind);

            let mut error = command.validate_security(state);
            let mut actions = Vec::new();
            if !error.is_failure() {
                let mut inner = cell.borrow_mut();
                error = Self::execute_command(&mut inner, state, &command.kind, &mut actions);
            }
            for action in actions {
                action.run();
            }

            if error.is_failure() {
                self.halt_command_queue(cell, state, error);
                break;
            }
            cell.borrow_mut().domain_mut(state).cmdq.advance_consumer();
        }
    }

    fn halt_command_queue(&self, cell: &RefCell<Inner>, state: SecurityState, error: CommandError) {
        let line = {
            let mut inner = cell.borrow_mut();
            let domain = inner.domain_mut(state);
            domain
                .record_command_error(error)
                .then(|| domain.gerror_line.clone())
        };
        if let Some(line) = line {
            line.pulse();
        }
    }

    fn execute_command(
        inner: &mut Inner,
        state: SecurityState,
        kind: &CommandKind,
        actions: &mut Vec<ExternalAction>,
    ) -> CommandError {
        match kind {
            // Prefetch hints may warm caches; doing nothing is a valid
            // implementation.
            CommandKind::PrefetchConfig { .. } | CommandKind::PrefetchAddress { .. } => {
                trace!("prefetch hint: {kind:?}");
                CommandError::None
            }
            CommandKind::InvalidateSte { stream_id, .. } => {
                inner.domain_mut(state).invalidate_ste(*stream_id);
                CommandError::None
            }
            CommandKind::InvalidateSteRange { stream_id, range } => {
                inner
                    .domain_mut(state)
                    .invalidate_ste_range(*stream_id, *range);
                CommandError::None
            }
            // VMID/ASID qualifiers are decoded but do not narrow the
            // invalidation.
            CommandKind::InvalidateTlbAll { .. } | CommandKind::InvalidateTlbByAsid { .. } => {
                Self::invalidate_controllers(inner, None, actions);
                CommandError::None
            }
            CommandKind::InvalidateTlbByAddress { address, .. }
            | CommandKind::InvalidateTlbByAddressAsid { address, .. } => {
                Self::invalidate_controllers(inner, Some(*address), actions);
                CommandError::None
            }
            CommandKind::Sync { .. } => {
                // TODO: raise the requested completion signal (IRQ/SEV/MSI).
                debug!("sync acknowledged: {kind:?}");
                CommandError::None
            }
            CommandKind::Unhandled { opcode } => {
                error!("unhandled command {opcode:?}");
                CommandError::None
            }
            CommandKind::Invalid { opcode } => {
                error!("invalid command opcode {opcode:#04x}");
                CommandError::Illegal
            }
        }
    }

    fn invalidate_controllers(
        inner: &mut Inner,
        address: Option<u64>,
        actions: &mut Vec<ExternalAction>,
    ) {
        for controller in inner.controllers.values_mut() {
            controller.invalidate_tlb(address, actions);
        }
    }

    /// Cascade a domain's enable flag to its stream controllers.
    pub(crate) fn set_domain_enabled(
        &self,
        cell: &RefCell<Inner>,
        state: SecurityState,
        enabled: bool,
    ) {
        let actions = {
            let mut inner = cell.borrow_mut();
            inner.domain_mut(state).enabled = enabled;
            let mut actions = Vec::new();
            for (point, controller) in inner.controllers.iter_mut() {
                if point.security_state == state {
                    controller.set_enabled(enabled, &mut actions);
                }
            }
            actions
        };
        for action in actions {
            action.run();
        }
    }

    /// Global invalidation requested through the secure initialization
    /// register: every cached STE of both domains plus all cached windows.
    pub(crate) fn secure_init(&self, cell: &RefCell<Inner>) {
        let actions = {
            let mut inner = cell.borrow_mut();
            for state in [SecurityState::NonSecure, SecurityState::Secure] {
                let domain = inner.domain_mut(state);
                for stream_id in 0..domain.stream_table_entries() {
                    domain.invalidate_ste(stream_id);
                }
            }
            let mut actions = Vec::new();
            Self::invalidate_controllers(&mut inner, None, &mut actions);
            actions
        };
        for action in actions {
            action.run();
        }
    }
}
