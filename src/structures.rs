//! Guest-visible translation structures.
//!
//! Stream table entries, context descriptors and page-table entries are
//! fixed-width, bit-packed, little-endian structures read directly from
//! guest memory. Field offsets follow the SMMUv3 and VMSAv8 layouts
//! bit for bit; reserved regions decode as zero and are never interpreted.

use crate::AccessFlags;
use crate::bits::{self, extract, extract_bit};

/// Encoded width of a stream table entry.
pub const STE_BYTES: usize = 64;

/// Encoded width of a context descriptor.
pub const CD_BYTES: usize = 64;

/// Encoded width of a page-table entry.
pub const PTE_BYTES: usize = 8;

/// Translation behavior selected by a stream table entry.
///
/// The encodings 0b001-0b011 are reserved; the model carries them through
/// and treats them like the translating configurations, matching the
/// hardware's permissive decode rather than rejecting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamConfig {
    Abort,
    Bypass,
    Stage1Translate,
    Stage2Translate,
    Stage1And2Translate,
    Reserved(u8),
}

impl StreamConfig {
    pub fn from_bits(raw: u8) -> Self {
        match raw {
            0b000 => StreamConfig::Abort,
            0b100 => StreamConfig::Bypass,
            0b101 => StreamConfig::Stage1Translate,
            0b110 => StreamConfig::Stage2Translate,
            0b111 => StreamConfig::Stage1And2Translate,
            other => StreamConfig::Reserved(other),
        }
    }
}

/// Privilege override applied to a stream's transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeConfig {
    UseIncoming,
    Unprivileged,
    Privileged,
    Reserved,
}

impl PrivilegeConfig {
    pub fn from_bits(raw: u8) -> Self {
        match raw {
            0b00 => PrivilegeConfig::UseIncoming,
            0b10 => PrivilegeConfig::Unprivileged,
            0b11 => PrivilegeConfig::Privileged,
            _ => PrivilegeConfig::Reserved,
        }
    }
}

/// Per-stream configuration, cached by the device until explicitly
/// invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTableEntry {
    pub valid: bool,
    pub config: StreamConfig,
    pub s1_format: u8,
    /// Stage-1 context descriptor pointer, already shifted into a byte
    /// address.
    pub s1_context_ptr: u64,
    pub s1_cd_max: u8,
    pub stream_world: u8,
    pub privilege_config: PrivilegeConfig,
    pub s2_vmid: u16,
}

impl StreamTableEntry {
    pub fn decode(raw: &[u8]) -> Self {
        debug_assert_eq!(raw.len(), STE_BYTES);
        Self {
            valid: extract_bit(raw, 0),
            config: StreamConfig::from_bits(extract(raw, 1, 3) as u8),
            s1_format: extract(raw, 4, 2) as u8,
            s1_context_ptr: extract(raw, 6, 50) << 6,
            s1_cd_max: extract(raw, 59, 5) as u8,
            stream_world: extract(raw, 94, 2) as u8,
            privilege_config: PrivilegeConfig::from_bits(extract(raw, 112, 2) as u8),
            s2_vmid: extract(raw, 128, 16) as u16,
        }
    }

    /// Whether translations for this stream are performed as privileged
    /// accesses.
    // TODO: derive the UseIncoming case from the incoming transaction
    // attributes instead of assuming a privileged initiator.
    pub fn privileged(&self) -> bool {
        self.privilege_config != PrivilegeConfig::Unprivileged
    }
}

/// Per-context translation parameters, re-read from guest memory on every
/// translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextDescriptor {
    pub t0sz: u8,
    pub tg0: u8,
    pub epd0: bool,
    pub t1sz: u8,
    pub tg1: u8,
    pub epd1: bool,
    pub valid: bool,
    pub ips: u8,
    pub aa64: bool,
    /// Stall the transaction on a fault.
    pub stall_on_fault: bool,
    /// Record an event on a fault.
    pub record_on_fault: bool,
    /// Abort rather than terminate silently.
    pub abort_on_terminate: bool,
    pub asid: u16,
    /// Translation table base for the low half, already a byte address.
    pub ttb0: u64,
    /// Translation table base for the high half, already a byte address.
    pub ttb1: u64,
}

impl ContextDescriptor {
    pub fn decode(raw: &[u8]) -> Self {
        debug_assert_eq!(raw.len(), CD_BYTES);
        Self {
            t0sz: extract(raw, 0, 6) as u8,
            tg0: extract(raw, 6, 2) as u8,
            epd0: extract_bit(raw, 14),
            t1sz: extract(raw, 16, 6) as u8,
            tg1: extract(raw, 22, 2) as u8,
            epd1: extract_bit(raw, 30),
            valid: extract_bit(raw, 31),
            ips: extract(raw, 32, 3) as u8,
            aa64: extract_bit(raw, 41),
            stall_on_fault: extract_bit(raw, 44),
            record_on_fault: extract_bit(raw, 45),
            abort_on_terminate: extract_bit(raw, 46),
            asid: extract(raw, 48, 16) as u16,
            ttb0: extract(raw, 68, 52) << 4,
            ttb1: extract(raw, 132, 52) << 4,
        }
    }

    /// Bit 55 of the input address selects the TTB0 or TTB1 half of the
    /// address space.
    pub fn uses_ttb0(address: u64) -> bool {
        address & (1 << 55) == 0
    }

    /// Page size shift for the address-space half covering `address`, or
    /// `None` when that half's walk is disabled or its granule encoding is
    /// reserved.
    pub fn page_shift_for(&self, address: u64) -> Option<u32> {
        if Self::uses_ttb0(address) {
            if self.epd0 {
                return None;
            }
            page_shift_for_tg0(self.tg0)
        } else {
            if self.epd1 {
                return None;
            }
            page_shift_for_tg1(self.tg1)
        }
    }

    /// Table base for the address-space half covering `address`.
    pub fn table_base_for(&self, address: u64) -> u64 {
        if Self::uses_ttb0(address) {
            self.ttb0
        } else {
            self.ttb1
        }
    }
}

/// TG0 uses the stage-2 granule encoding.
fn page_shift_for_tg0(granule: u8) -> Option<u32> {
    match granule {
        0b00 => Some(12),
        0b01 => Some(16),
        0b10 => Some(14),
        _ => None,
    }
}

/// TG1 uses the stage-1 granule encoding, which differs from TG0.
fn page_shift_for_tg1(granule: u8) -> Option<u32> {
    match granule {
        0b01 => Some(14),
        0b10 => Some(12),
        0b11 => Some(16),
        _ => None,
    }
}

/// One 8-byte VMSAv8 long-descriptor entry, discriminated by its low two
/// bits before full decode: bit 0 validity, bit 1 table-or-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableEntry {
    Invalid,
    Block(BlockDescriptor),
    Table(TableDescriptor),
}

impl PageTableEntry {
    pub fn decode(raw: &[u8]) -> Self {
        debug_assert_eq!(raw.len(), PTE_BYTES);
        match raw[0] & 0b11 {
            0b01 => PageTableEntry::Block(BlockDescriptor::decode(raw)),
            0b11 => PageTableEntry::Table(TableDescriptor::decode(raw)),
            _ => PageTableEntry::Invalid,
        }
    }
}

/// A block descriptor terminates the walk early and maps a large aligned
/// region. Only the output address matters to the model; attribute bits are
/// decoded nowhere because block permissions are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    /// Raw output address field (bits 47:12 of the descriptor), not yet
    /// shifted by the granule.
    pub output_address: u64,
}

impl BlockDescriptor {
    fn decode(raw: &[u8]) -> Self {
        Self {
            output_address: extract(raw, 12, 36),
        }
    }
}

/// A table descriptor either chains to the next level or, at the last
/// level, maps a page. The same layout serves VMSAv8-64 and VMSAv8-32 LPAE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDescriptor {
    pub attr_index: u8,
    pub non_secure: bool,
    pub ap: u8,
    pub shareability: u8,
    pub access_flag: bool,
    pub not_global: bool,
    /// Raw output address field (bits 47:12 of the descriptor).
    pub output_address: u64,
    pub pxn: bool,
    pub uxn: bool,
}

impl TableDescriptor {
    fn decode(raw: &[u8]) -> Self {
        Self {
            attr_index: extract(raw, 2, 3) as u8,
            non_secure: extract_bit(raw, 5),
            ap: extract(raw, 6, 2) as u8,
            shareability: extract(raw, 8, 2) as u8,
            access_flag: extract_bit(raw, 10),
            not_global: extract_bit(raw, 11),
            output_address: extract(raw, 12, 36),
            pxn: extract_bit(raw, 53),
            uxn: extract_bit(raw, 54),
        }
    }

    /// Output address with the format's width check applied. VMSAv8-32 LPAE
    /// stores the output address in bits 39:12; any higher bit set is an
    /// address-size fault, reported as `None`.
    pub fn output(&self, vmsa32: bool) -> Option<u64> {
        if vmsa32 {
            const VMSA32_MASK: u64 = (1 << 28) - 1;
            if self.output_address & !VMSA32_MASK != 0 {
                return None;
            }
        }
        Some(self.output_address)
    }

    /// Permissions a last-level entry grants to an access of the given
    /// privilege, from AP[2:1], PXN and UXN.
    pub fn privileges(&self, privileged: bool) -> AccessFlags {
        let privileged_only = self.ap & 0b01 == 0;
        let read_only = self.ap & 0b10 != 0;

        let mut allowed = AccessFlags::empty();
        if privileged || !privileged_only {
            allowed |= AccessFlags::READ;
            if !read_only {
                allowed |= AccessFlags::WRITE;
            }
        }
        if (privileged && !self.pxn) || (!privileged && !self.uxn) {
            allowed |= AccessFlags::EXECUTE;
        }
        allowed
    }
}

/// Build a raw page-table entry. The encoder mirrors the decoder so tests
/// and table builders do not hand-pack bits.
pub fn encode_table_descriptor(output_address: u64, ap: u8, pxn: bool, uxn: bool) -> [u8; 8] {
    let mut raw = [0u8; 8];
    raw[0] = 0b11;
    bits::deposit(&mut raw, 6, 2, u64::from(ap));
    bits::deposit(&mut raw, 12, 36, output_address);
    bits::deposit_bit(&mut raw, 53, pxn);
    bits::deposit_bit(&mut raw, 54, uxn);
    raw
}

/// Build a raw block descriptor.
pub fn encode_block_descriptor(output_address: u64) -> [u8; 8] {
    let mut raw = [0u8; 8];
    raw[0] = 0b01;
    bits::deposit(&mut raw, 12, 36, output_address);
    raw
}
