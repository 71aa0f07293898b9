//! Page-table walk behavior through the device's translation entry point.

mod common;

use common::*;
use vm_smmu::bits::deposit_bit;
use vm_smmu::{AccessFlags, MmuWindow, PeripheralId};

const DMA: PeripheralId = PeripheralId(1);

#[test]
fn three_level_walk_translates_virtual_zero() {
    let bench = bench();
    bench.configure_non_secure();
    bench.register_bus_stream(DMA, 0);
    // Final page: output 0x1000, AP read/write at any privilege, no XN.
    install_aa32_stream(&bench, 0, page_pte(0x1000, 0b01, false, false));

    let window = bench.smmu.window_from_page_table(0, DMA).unwrap();
    assert_eq!(window.start, 0);
    assert_eq!(window.end, 0x1000);
    assert_eq!(window.offset, 0x1000);
    assert_eq!(
        window.privileges,
        AccessFlags::READ | AccessFlags::WRITE | AccessFlags::EXECUTE
    );
    assert_eq!(window.translate(0x10), 0x1010);
}

#[test]
fn bypass_stream_yields_identity_window() {
    let bench = bench();
    bench.configure_non_secure();
    bench.register_bus_stream(DMA, 0);
    bench.install_ste(0, ste_bypass());

    let window = bench.smmu.window_from_page_table(0x1234_5678, DMA).unwrap();
    assert_eq!(window, MmuWindow::bypass());
}

#[test]
fn abort_stream_yields_no_window() {
    let bench = bench();
    bench.configure_non_secure();
    bench.register_bus_stream(DMA, 0);
    bench.install_ste(0, ste_abort());

    assert!(bench.smmu.window_from_page_table(0, DMA).is_none());
}

#[test]
fn unknown_peripheral_yields_no_window() {
    let bench = bench();
    bench.configure_non_secure();
    assert!(bench.smmu.window_from_page_table(0, DMA).is_none());
}

#[test]
fn stale_ste_remains_in_effect_until_invalidated() {
    let bench = bench();
    bench.configure_non_secure();
    bench.register_bus_stream(DMA, 0);
    install_aa32_stream(&bench, 0, page_pte(0x1000, 0b01, false, false));

    // First translation populates the STE cache.
    let first = bench.smmu.window_from_page_table(0, DMA).unwrap();
    assert_ne!(first, MmuWindow::bypass());

    // Rewriting the STE in guest memory has no effect on its own.
    bench.install_ste(0, ste_bypass());
    let stale = bench.smmu.window_from_page_table(0, DMA).unwrap();
    assert_eq!(stale, first);

    // After CMD_CFGI_STE the new configuration takes effect.
    bench.run_commands(&[cmd_cfgi_ste(0)]);
    let fresh = bench.smmu.window_from_page_table(0, DMA).unwrap();
    assert_eq!(fresh, MmuWindow::bypass());
}

#[test]
fn context_descriptor_is_read_fresh_each_translation() {
    let bench = bench();
    bench.configure_non_secure();
    bench.register_bus_stream(DMA, 0);
    install_aa32_stream(&bench, 0, page_pte(0x1000, 0b01, false, false));

    bench.smmu.window_from_page_table(0, DMA).unwrap();

    // Disabling the TTB0 walk in the CD fails the next translation without
    // any invalidation command.
    let mut cd = cd_stage1(TABLE_L1, false);
    deposit_bit(&mut cd, 14, true); // EPD0
    bench.memory.write(CD_BASE, &cd);
    assert!(bench.smmu.window_from_page_table(0, DMA).is_none());
}

#[test]
fn block_descriptor_terminates_the_walk_early() {
    let bench = bench();
    bench.configure_non_secure();
    bench.register_bus_stream(DMA, 0);

    // 48-bit address space: L0 -> L1 -> block at L2 (2 MiB).
    bench.install_ste(0, ste_stage1(CD_BASE, 0b00));
    bench.memory.write(CD_BASE, &cd_stage1(TABLE_L0, true));
    bench.memory.write(TABLE_L0, &table_pte(TABLE_L1));
    bench.memory.write(TABLE_L1, &table_pte(TABLE_L2));
    bench.memory.write(TABLE_L2, &block_pte(0x4000_0000));

    let window = bench.smmu.window_from_page_table(0x1800, DMA).unwrap();
    assert_eq!(window.start, 0);
    assert_eq!(window.end, 1 << 21);
    assert_eq!(window.offset, 0x4000_0000);
    assert_eq!(window.privileges, AccessFlags::READ | AccessFlags::WRITE);
}

#[test]
fn block_descriptor_at_the_last_level_fails() {
    let bench = bench();
    bench.configure_non_secure();
    bench.register_bus_stream(DMA, 0);
    // VMSAv8-32 walk ends at level 3; a block encoding there is invalid.
    install_aa32_stream(&bench, 0, block_pte(0x1000));

    assert!(bench.smmu.window_from_page_table(0, DMA).is_none());
}

#[test]
fn vmsa32_wide_output_address_fails() {
    let bench = bench();
    bench.configure_non_secure();
    bench.register_bus_stream(DMA, 0);
    // Output address field uses bit 28: legal on VMSAv8-64 only.
    install_aa32_stream(&bench, 0, page_pte(1u64 << 40, 0b01, false, false));

    assert!(bench.smmu.window_from_page_table(0, DMA).is_none());
}

#[test]
fn unprivileged_stream_respects_privileged_only_pages() {
    let bench = bench();
    bench.configure_non_secure();
    bench.register_bus_stream(DMA, 0);
    bench.install_ste(0, ste_stage1(CD_BASE, 0b10)); // PRIVCFG = unprivileged
    bench.memory.write(CD_BASE, &cd_stage1(TABLE_L1, false));
    // AP = 0b00: privileged read/write only.
    build_tables_aa32(&bench.memory, page_pte(0x1000, 0b00, false, false));

    let window = bench.smmu.window_from_page_table(0, DMA).unwrap();
    assert_eq!(window.privileges, AccessFlags::EXECUTE);
}

#[test]
fn invalid_entry_fails_the_walk() {
    let bench = bench();
    bench.configure_non_secure();
    bench.register_bus_stream(DMA, 0);
    install_aa32_stream(&bench, 0, [0u8; 8]);

    assert!(bench.smmu.window_from_page_table(0, DMA).is_none());
}

#[test]
fn stream_outside_the_table_fails() {
    let bench = bench();
    bench.configure_non_secure();
    // Table configured with 2^8 entries; stream 300 is out of range.
    bench.register_bus_stream(DMA, 300);
    assert!(bench.smmu.window_from_page_table(0, DMA).is_none());
}

#[test]
fn ste_fetch_bus_error_fails_the_walk() {
    let bench = bench();
    bench.configure_non_secure();
    bench.register_bus_stream(DMA, 0);
    install_aa32_stream(&bench, 0, page_pte(0x1000, 0b01, false, false));
    bench
        .memory
        .fail_accesses_in(STREAM_TABLE_BASE, STREAM_TABLE_BASE + 64);

    assert!(bench.smmu.window_from_page_table(0, DMA).is_none());
}
