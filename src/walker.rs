//! Multi-level page-table walker.
//!
//! Walks the VMSAv8-64 / VMSAv8-32 LPAE long-descriptor formats for a
//! context descriptor and produces a translated window: the virtual range a
//! descriptor covers, the signed offset to the physical range, and the
//! permissions it grants. The walker only reads guest memory and reports
//! failure by returning no window; turning a failed walk into a fault event
//! is the caller's business.

use log::warn;

use crate::bus::{GuestMemory, MemoryContext};
use crate::structures::{ContextDescriptor, PTE_BYTES, PageTableEntry};
use crate::{AccessFlags, MAX_PAGE_TABLE_LEVEL};

/// A contiguous translated range: `[start, end)` in the virtual space,
/// mapped by adding `offset`, usable for the access kinds in `privileges`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuWindow {
    pub start: u64,
    pub end: u64,
    pub offset: i64,
    pub privileges: AccessFlags,
}

impl MmuWindow {
    pub fn new(start: u64, end: u64, offset: i64, privileges: AccessFlags) -> Self {
        let window = Self {
            start,
            end,
            offset,
            privileges,
        };
        debug_assert!(
            window.start < window.end,
            "degenerate window [{:#x}, {:#x})",
            window.start,
            window.end
        );
        window
    }

    /// The identity window used for bypassing streams: the whole address
    /// space, zero offset, every permission.
    pub fn bypass() -> Self {
        Self::new(0, u64::MAX, 0, AccessFlags::all())
    }

    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }

    pub fn grants(&self, access: AccessFlags) -> bool {
        self.privileges.contains(access)
    }

    pub fn translate(&self, address: u64) -> u64 {
        address.wrapping_add(self.offset as u64)
    }
}

/// Index bits resolved by one level of lookup.
fn index_bits_per_level(page_shift: u32) -> u32 {
    page_shift - 3
}

/// Index bits actually used at `level`; the top level of a configuration
/// usually resolves fewer bits than a full level's worth.
fn index_bits_at(va_bits: u32, level: u32, page_shift: u32) -> u32 {
    let per_level = i64::from(index_bits_per_level(page_shift));
    let bits = (i64::from(va_bits) - i64::from(page_shift))
        - per_level * i64::from(MAX_PAGE_TABLE_LEVEL - level);
    bits.clamp(0, per_level) as u32
}

/// Amount of virtual address space one entry at `level` covers, as a shift.
fn va_size_shift(level: u32, page_shift: u32) -> u32 {
    page_shift + index_bits_per_level(page_shift) * (MAX_PAGE_TABLE_LEVEL - level)
}

/// First level of the walk for an address-space size: levels are counted
/// from the bottom, so a configuration that needs three lookups starts at
/// level 1.
fn first_level(va_bits: u32, page_shift: u32) -> Option<u32> {
    let available = (va_bits - page_shift).div_ceil(index_bits_per_level(page_shift));
    (MAX_PAGE_TABLE_LEVEL + 1).checked_sub(available)
}

/// Address of the entry to read at `level`, and the page size shift in
/// effect. `table_base` carries the chained table address once the first
/// lookup has resolved one; before that the context's TTB0/TTB1 applies.
fn entry_address(
    cd: &ContextDescriptor,
    address: u64,
    va_bits: u32,
    level: u32,
    table_base: Option<u64>,
) -> Option<(u64, u32)> {
    let page_shift = cd.page_shift_for(address)?;
    let base = table_base.unwrap_or_else(|| cd.table_base_for(address));
    let index_bits = index_bits_at(va_bits, level, page_shift);
    let mask = (1u64 << index_bits) - 1;
    let index = (address >> va_size_shift(level, page_shift)) & mask;
    Some((base + index * PTE_BYTES as u64, page_shift))
}

/// Walk the page tables described by `cd` for `address`.
///
/// Returns the window the terminating descriptor maps, or `None` on any
/// failure: disabled address-space half, reserved granule, invalid entry,
/// misplaced block descriptor, address-size violation, or a bus error
/// fetching an entry.
pub(crate) fn walk(
    memory: &dyn GuestMemory,
    context: MemoryContext,
    cd: &ContextDescriptor,
    address: u64,
    privileged: bool,
) -> Option<MmuWindow> {
    // The VMSAv8-32 LPAE virtual address space is 32 bits; for VMSAv8-64
    // the model uses the full 48 implemented bits.
    let va_bits: u32 = if cd.aa64 { 48 } else { 32 };

    let Some(page_shift) = cd.page_shift_for(address) else {
        warn!("could not establish a page size shift for {cd:?}");
        return None;
    };
    let Some(start_level) = first_level(va_bits, page_shift) else {
        warn!("no usable walk levels for va_bits={va_bits} page_shift={page_shift}");
        return None;
    };

    let mut table_base: Option<u64> = None;
    for level in start_level..=MAX_PAGE_TABLE_LEVEL {
        let Some((pte_address, shift)) = entry_address(cd, address, va_bits, level, table_base)
        else {
            warn!("translation failed for address {address:#x} at level {level}");
            return None;
        };

        let mut raw = [0u8; PTE_BYTES];
        if let Err(fault) = memory.read_bytes(pte_address, &mut raw, context) {
            warn!("level-{level} entry fetch failed: {fault}");
            return None;
        }

        match PageTableEntry::decode(&raw) {
            PageTableEntry::Block(block) => {
                if level == 1 && shift != 12 {
                    warn!(
                        "translation failed for address {address:#x}: block entry allowed \
                         on level 1 only with 4K pages, got shift {shift}"
                    );
                    return None;
                }
                if level > 2 {
                    warn!(
                        "translation failed for address {address:#x}: invalid block \
                         descriptor at level {level}"
                    );
                    return None;
                }

                let block_size = 1u64 << va_size_shift(level, shift);
                let mask = !(block_size - 1);
                let virt = address & mask;
                let phys = (block.output_address << shift) & mask;
                // Execute permission for blocks is a known simplification.
                return Some(MmuWindow::new(
                    virt,
                    virt + block_size,
                    phys.wrapping_sub(virt) as i64,
                    AccessFlags::READ | AccessFlags::WRITE,
                ));
            }
            PageTableEntry::Table(table) => {
                let Some(output) = table.output(!cd.aa64) else {
                    warn!(
                        "translation failed for address {address:#x}: output address \
                         exceeds the 32-bit format at level {level}"
                    );
                    return None;
                };
                if level == MAX_PAGE_TABLE_LEVEL {
                    let page_size = 1u64 << shift;
                    let virt = address & !(page_size - 1);
                    let phys = output << shift;
                    return Some(MmuWindow::new(
                        virt,
                        virt + page_size,
                        phys.wrapping_sub(virt) as i64,
                        table.privileges(privileged),
                    ));
                }
                table_base = Some(output << shift);
            }
            PageTableEntry::Invalid => {
                warn!(
                    "translation failed for address {address:#x}: invalid entry at \
                     level {level} ({pte_address:#x})"
                );
                return None;
            }
        }
    }
    unreachable!("the walk terminates at the last level")
}
