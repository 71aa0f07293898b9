//! Memory-mapped register file.
//!
//! Explicit offsets and a match-based dispatch; the generic register
//! collection machinery of the surrounding framework stays outside the
//! model. 32-bit accesses to 64-bit registers read or read-modify-write the
//! addressed half. Registers belonging to unimplemented extensions (PRI,
//! ATS/ATOS, VATOS translation, MPAM, DPT, ECMDQ) read as zero and log;
//! their feature bits in the ID registers read zero so conformant software
//! never pokes them.
//!
//! Secure registers are only reachable from streams registered as Secure,
//! with one architected exception: the secure initialization register is
//! exposed to non-secure software for platforms without a secure world.

use std::cell::RefCell;

use log::{debug, error, warn};

use crate::smmu::{Inner, Smmu};
use crate::{PeripheralId, SecurityState};

/// Size of the register space in bytes (register pages 0 and 1 plus the
/// VATOS page).
pub const REGISTER_SPACE_SIZE: u64 = 0x24000;

/// Register offsets. Secure mirrors sit at `SECURE_BASE` past their
/// non-secure twins unless listed explicitly.
pub mod offsets {
    pub const IDR0: u64 = 0x0;
    pub const IDR1: u64 = 0x4;
    pub const IDR2: u64 = 0x8;
    pub const IDR3: u64 = 0xC;
    pub const IDR4: u64 = 0x10;
    pub const IDR5: u64 = 0x14;
    pub const IIDR: u64 = 0x18;
    pub const AIDR: u64 = 0x1C;
    pub const CR0: u64 = 0x20;
    pub const CR0ACK: u64 = 0x24;
    pub const CR1: u64 = 0x28;
    pub const CR2: u64 = 0x2C;
    pub const STATUSR: u64 = 0x40;
    pub const GBPA: u64 = 0x44;
    pub const AGBPA: u64 = 0x48;
    pub const IRQ_CTRL: u64 = 0x50;
    pub const IRQ_CTRLACK: u64 = 0x54;
    pub const GERROR: u64 = 0x60;
    pub const GERRORN: u64 = 0x64;
    pub const STRTAB_BASE: u64 = 0x80;
    pub const STRTAB_BASE_CFG: u64 = 0x88;
    pub const CMDQ_BASE: u64 = 0x90;
    pub const CMDQ_PROD: u64 = 0x98;
    pub const CMDQ_CONS: u64 = 0x9C;
    pub const EVENTQ_BASE: u64 = 0xA0;
    pub const EVENTQ_PROD_ALIAS: u64 = 0xA8;
    pub const EVENTQ_CONS_ALIAS: u64 = 0xAC;
    pub const GATOS_CTRL: u64 = 0x100;
    pub const GATOS_SID: u64 = 0x108;
    pub const GATOS_ADDR: u64 = 0x110;
    pub const GATOS_PAR: u64 = 0x118;
    pub const PMDEVARCH: u64 = 0xFBC;
    pub const PMDEVTYPE: u64 = 0xFCC;
    pub const PIDR4: u64 = 0xFD0;
    pub const PIDR5: u64 = 0xFD4;
    pub const PIDR6: u64 = 0xFD8;
    pub const PIDR7: u64 = 0xFDC;
    pub const PIDR0: u64 = 0xFE0;
    pub const PIDR1: u64 = 0xFE4;
    pub const PIDR2: u64 = 0xFE8;
    pub const PIDR3: u64 = 0xFEC;
    pub const CIDR0: u64 = 0xFF0;
    pub const CIDR1: u64 = 0xFF4;
    pub const CIDR2: u64 = 0xFF8;
    pub const CIDR3: u64 = 0xFFC;

    pub const SECURE_BASE: u64 = 0x8000;
    /// Last register of the secure page; the access filter covers
    /// `SECURE_BASE..=SECURE_LAST`.
    pub const SECURE_LAST: u64 = SECURE_BASE | 0x400C;

    pub const S_IDR0: u64 = SECURE_BASE | IDR0;
    pub const S_IDR1: u64 = SECURE_BASE | IDR1;
    pub const S_IDR3: u64 = SECURE_BASE | IDR3;
    pub const S_IDR4: u64 = SECURE_BASE | IDR4;
    pub const S_CR0: u64 = SECURE_BASE | CR0;
    pub const S_CR0ACK: u64 = SECURE_BASE | CR0ACK;
    pub const S_INIT: u64 = SECURE_BASE | 0x3C;
    pub const S_GBPA: u64 = SECURE_BASE | GBPA;
    pub const S_IRQ_CTRL: u64 = SECURE_BASE | IRQ_CTRL;
    pub const S_IRQ_CTRLACK: u64 = SECURE_BASE | IRQ_CTRLACK;
    pub const S_GERROR: u64 = SECURE_BASE | GERROR;
    pub const S_GERRORN: u64 = SECURE_BASE | GERRORN;
    pub const S_STRTAB_BASE: u64 = SECURE_BASE | STRTAB_BASE;
    pub const S_STRTAB_BASE_CFG: u64 = SECURE_BASE | STRTAB_BASE_CFG;
    pub const S_CMDQ_BASE: u64 = SECURE_BASE | CMDQ_BASE;
    pub const S_CMDQ_PROD: u64 = SECURE_BASE | CMDQ_PROD;
    pub const S_CMDQ_CONS: u64 = SECURE_BASE | CMDQ_CONS;
    pub const S_EVENTQ_BASE: u64 = SECURE_BASE | EVENTQ_BASE;

    // The live event queue index registers sit on register page 1; the
    // page-0 offsets above are read-only aliases.
    pub const EVENTQ_PROD: u64 = 0x100A8;
    pub const EVENTQ_CONS: u64 = 0x100AC;
    pub const S_EVENTQ_PROD: u64 = SECURE_BASE | EVENTQ_PROD;
    pub const S_EVENTQ_CONS: u64 = SECURE_BASE | EVENTQ_CONS;

    pub const VATOS_CTRL: u64 = 0x20A00;
    pub const VATOS_SID: u64 = 0x20A08;
    pub const VATOS_ADDR: u64 = 0x20A10;
}

use offsets::*;

// ID register contents: stage 1 only, AArch32+64 table formats, 16-bit
// ASID/VMID, little-endian tables, no stall model, linear stream table.
const IDR0_VALUE: u32 = (1 << 1) // S1P
    | (0b11 << 2) // TTF: AArch32 + AArch64
    | (1 << 12) // ASID16
    | (1 << 18) // VMID16
    | (0b10 << 21) // TTENDIAN: little-endian
    | (0b01 << 24); // STALL_MODEL: stall not supported

const IDR1_VALUE: u32 = crate::STREAM_ID_BITS // SIDSIZE
    | (7 << 11) // PRIQS
    | (crate::MAX_EVENT_QUEUE_SHIFT << 16) // EVENTQS
    | (crate::MAX_COMMAND_QUEUE_SHIFT << 21); // CMDQS

const IDR3_VALUE: u32 = 0b01 << 11; // BBML level 1

const IDR5_VALUE: u32 = 0b101 // OAS: 48 bits
    | (1 << 4); // GRAN4K

const IIDR_VALUE: u32 = 0x43B; // JEP106 implementer code
const AIDR_VALUE: u32 = 0x32; // SMMUv3.2

const S_IDR0_VALUE: u32 = 0b01 << 24; // STALL_MODEL: stall not supported
const S_IDR1_VALUE: u32 = crate::STREAM_ID_BITS | (1 << 31); // SECURE_IMPL

impl Smmu {
    /// 32-bit register read. Unattributed or cross-world accesses to secure
    /// registers read as zero.
    pub fn read_register32(&self, offset: u64, initiator: Option<PeripheralId>) -> u32 {
        if !self.register_accessible(offset, initiator, None) {
            return 0;
        }
        let guard = self.inner.lock();
        if let Some(value) = self.read32(&guard, offset) {
            return value;
        }
        // Possibly a 32-bit access to one half of a 64-bit register.
        let base = offset & !0x7;
        if is_quad_register(base) {
            let quad = self.read64_value(&guard, base).unwrap_or(0);
            return if offset & 0x4 != 0 {
                (quad >> 32) as u32
            } else {
                quad as u32
            };
        }
        debug!("unhandled register read at {offset:#x}");
        0
    }

    /// 32-bit register write.
    pub fn write_register32(&self, offset: u64, value: u32, initiator: Option<PeripheralId>) {
        if !self.register_accessible(offset, initiator, Some(u64::from(value))) {
            return;
        }
        let guard = self.inner.lock();
        if self.write32(&guard, offset, value) {
            return;
        }
        let base = offset & !0x7;
        if is_quad_register(base) {
            let current = self.read64_value(&guard, base).unwrap_or(0);
            let merged = if offset & 0x4 != 0 {
                (current & 0x0000_0000_FFFF_FFFF) | (u64::from(value) << 32)
            } else {
                (current & 0xFFFF_FFFF_0000_0000) | u64::from(value)
            };
            self.write64(&guard, base, merged);
            return;
        }
        debug!("unhandled register write at {offset:#x} (value {value:#x})");
    }

    /// 64-bit register read.
    pub fn read_register64(&self, offset: u64, initiator: Option<PeripheralId>) -> u64 {
        if !self.register_accessible(offset, initiator, None) {
            return 0;
        }
        let guard = self.inner.lock();
        match self.read64_value(&guard, offset) {
            Some(value) => value,
            None => {
                debug!("unhandled register read at {offset:#x}");
                0
            }
        }
    }

    /// 64-bit register write.
    pub fn write_register64(&self, offset: u64, value: u64, initiator: Option<PeripheralId>) {
        if !self.register_accessible(offset, initiator, Some(value)) {
            return;
        }
        let guard = self.inner.lock();
        if !self.write64(&guard, offset, value) {
            debug!("unhandled register write at {offset:#x} (value {value:#x})");
        }
    }

    /// Secure registers require a Secure-registered initiator; `S_INIT` is
    /// reachable from anyone so non-secure initialization software can use
    /// it on platforms without a secure world.
    fn register_accessible(
        &self,
        offset: u64,
        initiator: Option<PeripheralId>,
        write_value: Option<u64>,
    ) -> bool {
        let secure = (SECURE_BASE..=SECURE_LAST).contains(&offset);
        if !secure || offset == S_INIT {
            return true;
        }
        let access = if write_value.is_some() { "write" } else { "read" };
        let Some(initiator) = initiator else {
            error!(
                "could not obtain an initiator for a {access} access to secure register \
                 {offset:#x}, ignoring access"
            );
            return false;
        };
        let guard = self.inner.lock();
        let inner = guard.borrow();
        match inner.peripherals.get(&initiator) {
            Some(point) if point.security_state == SecurityState::Secure => true,
            Some(point) => {
                warn!(
                    "non-secure stream #{} attempted a {access} access to secure register \
                     {offset:#x}",
                    point.stream_id
                );
                false
            }
            None => {
                warn!("unknown stream attempted a {access} access to secure register {offset:#x}");
                false
            }
        }
    }

    fn read32(&self, cell: &RefCell<Inner>, offset: u64) -> Option<u32> {
        let inner = cell.borrow();
        let value = match offset {
            IDR0 => IDR0_VALUE,
            IDR1 => IDR1_VALUE,
            IDR2 => 0,
            IDR3 => IDR3_VALUE,
            IDR4 => 0,
            IDR5 => IDR5_VALUE,
            IIDR => IIDR_VALUE,
            AIDR => AIDR_VALUE,
            CR0 | CR0ACK => {
                let d = &inner.nonsecure;
                u32::from(d.enabled)
                    | u32::from(d.priq_enabled) << 1
                    | u32::from(d.evtq_enabled) << 2
                    | u32::from(d.cmdq_enabled) << 3
                    | u32::from(d.ats_check) << 4
            }
            CR1 | CR2 | STATUSR | GBPA => 0,
            AGBPA => inner.agbpa,
            IRQ_CTRL | IRQ_CTRLACK => {
                let d = &inner.nonsecure;
                u32::from(d.gerror_irq_enabled)
                    | u32::from(d.priq_irq_enabled) << 1
                    | u32::from(d.eventq_irq_enabled) << 2
            }
            GERROR => u32::from(inner.nonsecure.gerror_cmdq_err),
            GERRORN => u32::from(inner.nonsecure.gerrorn_cmdq_err),
            STRTAB_BASE_CFG => inner.nonsecure.stream_table_config(),
            CMDQ_PROD => inner.nonsecure.cmdq.produce_raw(),
            CMDQ_CONS => {
                inner.nonsecure.cmdq.consume_raw() | (inner.nonsecure.cmdq_error_reason << 24)
            }
            EVENTQ_PROD | EVENTQ_PROD_ALIAS => eventq_prod_value(&inner.nonsecure),
            EVENTQ_CONS | EVENTQ_CONS_ALIAS => eventq_cons_value(&inner.nonsecure),
            GATOS_CTRL => 0,
            PMDEVARCH => 0x4770_2A56,
            PMDEVTYPE => 0x56,
            PIDR0 => 0x83,
            PIDR1 => 0xB4,
            PIDR2 => 0x2F,
            PIDR3 | PIDR5 | PIDR6 | PIDR7 => 0,
            PIDR4 => 0x04,
            CIDR0 => 0x0D,
            CIDR1 => 0x90,
            CIDR2 => 0x05,
            CIDR3 => 0xB1,
            S_IDR0 => S_IDR0_VALUE,
            S_IDR1 => S_IDR1_VALUE,
            S_IDR3 | S_IDR4 | S_INIT => 0,
            S_CR0 | S_CR0ACK => {
                let d = &inner.secure;
                u32::from(d.enabled)
                    | u32::from(d.evtq_enabled) << 2
                    | u32::from(d.cmdq_enabled) << 3
                    | u32::from(d.secure_instruction_fetch) << 5
            }
            S_IRQ_CTRL | S_IRQ_CTRLACK => {
                let d = &inner.secure;
                u32::from(d.gerror_irq_enabled) | u32::from(d.eventq_irq_enabled) << 2
            }
            S_GERROR => u32::from(inner.secure.gerror_cmdq_err),
            S_GERRORN => u32::from(inner.secure.gerrorn_cmdq_err),
            S_STRTAB_BASE_CFG => inner.secure.stream_table_config(),
            S_CMDQ_PROD => inner.secure.cmdq.produce_raw(),
            S_CMDQ_CONS => {
                inner.secure.cmdq.consume_raw() | (inner.secure.cmdq_error_reason << 24)
            }
            S_EVENTQ_PROD => eventq_prod_value(&inner.secure),
            S_EVENTQ_CONS => eventq_cons_value(&inner.secure),
            VATOS_CTRL => 0,
            _ => return None,
        };
        Some(value)
    }

    fn write32(&self, cell: &RefCell<Inner>, offset: u64, value: u32) -> bool {
        match offset {
            CR0 => self.write_cr0(cell, SecurityState::NonSecure, value),
            S_CR0 => self.write_cr0(cell, SecurityState::Secure, value),
            CR1 | CR2 => {
                debug!("queue/table attribute register {offset:#x} latched but unused");
            }
            GBPA => {
                if value & (1 << 31) != 0 {
                    warn!("global bypass attribute update requested");
                }
            }
            AGBPA => cell.borrow_mut().agbpa = value,
            IRQ_CTRL => {
                let mut inner = cell.borrow_mut();
                let d = &mut inner.nonsecure;
                d.gerror_irq_enabled = value & 1 != 0;
                d.priq_irq_enabled = value & (1 << 1) != 0;
                d.eventq_irq_enabled = value & (1 << 2) != 0;
            }
            S_IRQ_CTRL => {
                let mut inner = cell.borrow_mut();
                let d = &mut inner.secure;
                d.gerror_irq_enabled = value & 1 != 0;
                d.eventq_irq_enabled = value & (1 << 2) != 0;
            }
            GERRORN => cell.borrow_mut().nonsecure.gerrorn_cmdq_err = value & 1 != 0,
            S_GERRORN => cell.borrow_mut().secure.gerrorn_cmdq_err = value & 1 != 0,
            STRTAB_BASE_CFG => cell.borrow_mut().nonsecure.set_stream_table_config(value),
            S_STRTAB_BASE_CFG => cell.borrow_mut().secure.set_stream_table_config(value),
            CMDQ_PROD => self.write_cmdq_prod(cell, SecurityState::NonSecure, value),
            S_CMDQ_PROD => self.write_cmdq_prod(cell, SecurityState::Secure, value),
            // Software steps the consume index to skip past a failed
            // command; the error field is read-only.
            CMDQ_CONS => cell
                .borrow_mut()
                .nonsecure
                .cmdq
                .set_consume_raw(value & 0xF_FFFF),
            S_CMDQ_CONS => cell
                .borrow_mut()
                .secure
                .cmdq
                .set_consume_raw(value & 0xF_FFFF),
            EVENTQ_PROD => cell
                .borrow_mut()
                .nonsecure
                .evtq
                .set_produce_raw(value & 0xF_FFFF),
            S_EVENTQ_PROD => cell
                .borrow_mut()
                .secure
                .evtq
                .set_produce_raw(value & 0xF_FFFF),
            EVENTQ_CONS => {
                let mut inner = cell.borrow_mut();
                let d = &mut inner.nonsecure;
                d.evtq.set_consume_raw(value & 0xF_FFFF);
                d.evtq_overflow_ack = value & (1 << 31) != 0;
            }
            S_EVENTQ_CONS => {
                let mut inner = cell.borrow_mut();
                let d = &mut inner.secure;
                d.evtq.set_consume_raw(value & 0xF_FFFF);
                d.evtq_overflow_ack = value & (1 << 31) != 0;
            }
            EVENTQ_PROD_ALIAS | EVENTQ_CONS_ALIAS => {
                debug!("write to read-only event queue alias {offset:#x} ignored");
            }
            S_INIT => {
                if value & 1 != 0 {
                    self.secure_init(cell);
                }
            }
            GATOS_CTRL => debug!("address translation operations are not supported"),
            VATOS_CTRL => {
                if value & 1 != 0 {
                    error!("VATOS translation requested, not implemented");
                }
            }
            _ => return false,
        }
        true
    }

    fn write_cr0(&self, cell: &RefCell<Inner>, state: SecurityState, value: u32) {
        let toggle = {
            let mut inner = cell.borrow_mut();
            let d = inner.domain_mut(state);
            match state {
                SecurityState::NonSecure => {
                    d.priq_enabled = value & (1 << 1) != 0;
                    d.ats_check = value & (1 << 4) != 0;
                }
                SecurityState::Secure => {
                    d.secure_instruction_fetch = value & (1 << 5) != 0;
                }
            }
            d.evtq_enabled = value & (1 << 2) != 0;
            d.cmdq_enabled = value & (1 << 3) != 0;
            let enable = value & 1 != 0;
            (d.enabled != enable).then_some(enable)
        };
        if let Some(enable) = toggle {
            self.set_domain_enabled(cell, state, enable);
        }
    }

    fn write_cmdq_prod(&self, cell: &RefCell<Inner>, state: SecurityState, value: u32) {
        let enabled = {
            let mut inner = cell.borrow_mut();
            let d = inner.domain_mut(state);
            d.cmdq.set_produce_raw(value & 0xF_FFFF);
            d.cmdq_enabled
        };
        if !enabled {
            warn!("command queue is disabled ({state:?}), ignoring PROD update");
            return;
        }
        self.process_command_queue(cell, state);
    }

    fn read64_value(&self, cell: &RefCell<Inner>, offset: u64) -> Option<u64> {
        let inner = cell.borrow();
        let value = match offset {
            STRTAB_BASE => inner.nonsecure.stream_table_base,
            CMDQ_BASE => inner.nonsecure.cmdq_base_raw,
            EVENTQ_BASE => inner.nonsecure.evtq_base_raw,
            S_STRTAB_BASE => inner.secure.stream_table_base,
            S_CMDQ_BASE => inner.secure.cmdq_base_raw,
            S_EVENTQ_BASE => inner.secure.evtq_base_raw,
            GATOS_SID | GATOS_ADDR | GATOS_PAR => 0,
            VATOS_SID => inner.vatos_sid,
            VATOS_ADDR => inner.vatos_addr,
            _ => return None,
        };
        Some(value)
    }

    fn write64(&self, cell: &RefCell<Inner>, offset: u64, value: u64) -> bool {
        match offset {
            STRTAB_BASE => cell.borrow_mut().nonsecure.set_stream_table_base(value),
            S_STRTAB_BASE => cell.borrow_mut().secure.set_stream_table_base(value),
            CMDQ_BASE => cell.borrow_mut().nonsecure.set_cmdq_base(value),
            S_CMDQ_BASE => cell.borrow_mut().secure.set_cmdq_base(value),
            EVENTQ_BASE => cell.borrow_mut().nonsecure.set_evtq_base(value),
            S_EVENTQ_BASE => cell.borrow_mut().secure.set_evtq_base(value),
            GATOS_SID | GATOS_ADDR | GATOS_PAR => {
                debug!("address translation operations are not supported");
            }
            VATOS_SID => cell.borrow_mut().vatos_sid = value,
            VATOS_ADDR => cell.borrow_mut().vatos_addr = value,
            _ => return false,
        }
        true
    }
}

fn eventq_prod_value(domain: &crate::domain::Domain) -> u32 {
    (domain.evtq.produce_raw() & 0xF_FFFF) | (u32::from(domain.evtq_overflow) << 31)
}

fn eventq_cons_value(domain: &crate::domain::Domain) -> u32 {
    (domain.evtq.consume_raw() & 0xF_FFFF) | (u32::from(domain.evtq_overflow_ack) << 31)
}

fn is_quad_register(offset: u64) -> bool {
    matches!(
        offset,
        STRTAB_BASE
            | CMDQ_BASE
            | EVENTQ_BASE
            | S_STRTAB_BASE
            | S_CMDQ_BASE
            | S_EVENTQ_BASE
            | GATOS_SID
            | GATOS_ADDR
            | GATOS_PAR
            | VATOS_SID
            | VATOS_ADDR
    )
}
