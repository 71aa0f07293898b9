//! Shared test fixtures: guest memory, interrupt lines, CPU window tables
//! and builders for the guest-visible structures.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use vm_smmu::bits::{deposit, deposit_bit};
use vm_smmu::registers::offsets;
use vm_smmu::{
    ExternalMmu, GuestMemory, InterruptLine, MemoryContext, MemoryError, MmuWindow, PeripheralId,
    SecurityState, Smmu, SmmuInterrupts, StreamBackend, StreamPoint,
};

pub const STREAM_TABLE_BASE: u64 = 0x1000;
pub const CD_BASE: u64 = 0x2000;
pub const TABLE_L0: u64 = 0x4000;
pub const TABLE_L1: u64 = 0x5000;
pub const TABLE_L2: u64 = 0x6000;
pub const TABLE_L3: u64 = 0x7000;
pub const CMDQ_BASE_ADDR: u64 = 0x10000;
pub const EVTQ_BASE_ADDR: u64 = 0x20000;

/// Flat guest memory with optional fault injection.
pub struct MockMemory {
    cells: Mutex<Vec<u8>>,
    fail_range: Mutex<Option<(u64, u64)>>,
}

impl MockMemory {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            cells: Mutex::new(vec![0; size]),
            fail_range: Mutex::new(None),
        })
    }

    pub fn write(&self, address: u64, bytes: &[u8]) {
        let mut cells = self.cells.lock();
        let start = address as usize;
        cells[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_vec(&self, address: u64, len: usize) -> Vec<u8> {
        let cells = self.cells.lock();
        let start = address as usize;
        cells[start..start + len].to_vec()
    }

    /// Make `[start, end)` fail with a bus error.
    pub fn fail_accesses_in(&self, start: u64, end: u64) {
        *self.fail_range.lock() = Some((start, end));
    }

    fn check(&self, address: u64, len: usize) -> Result<(), MemoryError> {
        if let Some((start, end)) = *self.fail_range.lock() {
            if address < end && address + len as u64 > start {
                return Err(MemoryError { address, len });
            }
        }
        if (address as usize + len) > self.cells.lock().len() {
            return Err(MemoryError { address, len });
        }
        Ok(())
    }
}

impl GuestMemory for MockMemory {
    fn read_bytes(
        &self,
        address: u64,
        dest: &mut [u8],
        _context: MemoryContext,
    ) -> Result<(), MemoryError> {
        self.check(address, dest.len())?;
        let cells = self.cells.lock();
        let start = address as usize;
        dest.copy_from_slice(&cells[start..start + dest.len()]);
        Ok(())
    }

    fn write_bytes(
        &self,
        address: u64,
        src: &[u8],
        _context: MemoryContext,
    ) -> Result<(), MemoryError> {
        self.check(address, src.len())?;
        let mut cells = self.cells.lock();
        let start = address as usize;
        cells[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }
}

/// Interrupt line counting rising edges.
#[derive(Default)]
pub struct PulseLine {
    rising: AtomicU32,
}

impl PulseLine {
    pub fn pulses(&self) -> u32 {
        self.rising.load(Ordering::SeqCst)
    }
}

impl InterruptLine for PulseLine {
    fn set(&self, high: bool) {
        if high {
            self.rising.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// CPU window table recording installs and removals.
#[derive(Default)]
pub struct MockCpu {
    pub windows: Mutex<Vec<MmuWindow>>,
    pub remove_all_calls: AtomicU32,
}

impl MockCpu {
    pub fn installed(&self) -> Vec<MmuWindow> {
        self.windows.lock().clone()
    }
}

impl ExternalMmu for MockCpu {
    fn install_window(&self, window: &MmuWindow) {
        self.windows.lock().push(*window);
    }

    fn remove_window(&self, virtual_address: u64) {
        self.windows.lock().retain(|w| !w.contains(virtual_address));
    }

    fn remove_all_windows(&self) {
        self.windows.lock().clear();
        self.remove_all_calls.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct TestBench {
    pub memory: Arc<MockMemory>,
    pub smmu: Smmu,
    pub eventq_line: Arc<PulseLine>,
    pub gerror_line: Arc<PulseLine>,
}

pub fn bench() -> TestBench {
    let _ = env_logger::builder().is_test(true).try_init();
    let memory = MockMemory::new(0x40000);
    let eventq_line = Arc::new(PulseLine::default());
    let gerror_line = Arc::new(PulseLine::default());
    let interrupts = SmmuInterrupts {
        gerror: gerror_line.clone(),
        eventq: eventq_line.clone(),
        ..Default::default()
    };
    let smmu = Smmu::new(memory.clone(), interrupts);
    TestBench {
        memory,
        smmu,
        eventq_line,
        gerror_line,
    }
}

pub fn ns_point(stream_id: u32) -> StreamPoint {
    StreamPoint {
        stream_id,
        security_state: SecurityState::NonSecure,
    }
}

impl TestBench {
    /// Program the non-secure stream table, queues, interrupts and master
    /// enable: the state most tests start from.
    pub fn configure_non_secure(&self) {
        let s = &self.smmu;
        s.write_register64(offsets::STRTAB_BASE, STREAM_TABLE_BASE, None);
        s.write_register32(offsets::STRTAB_BASE_CFG, 8, None);
        s.write_register64(offsets::CMDQ_BASE, CMDQ_BASE_ADDR | 4, None);
        s.write_register64(offsets::EVENTQ_BASE, EVTQ_BASE_ADDR | 4, None);
        s.write_register32(offsets::IRQ_CTRL, 0b101, None);
        // SMMUEN | EVENTQEN | CMDQEN
        s.write_register32(offsets::CR0, 0b1101, None);
    }

    pub fn register_bus_stream(&self, peripheral: PeripheralId, stream_id: u32) {
        self.smmu
            .register_stream(peripheral, ns_point(stream_id), StreamBackend::Bus)
            .unwrap();
    }

    pub fn register_cpu_stream(&self, peripheral: PeripheralId, stream_id: u32) -> Arc<MockCpu> {
        let cpu = Arc::new(MockCpu::default());
        self.smmu
            .register_stream(
                peripheral,
                ns_point(stream_id),
                StreamBackend::ExternalMmu(cpu.clone()),
            )
            .unwrap();
        cpu
    }

    pub fn install_ste(&self, stream_id: u32, ste: [u8; 64]) {
        self.memory.write(STREAM_TABLE_BASE + u64::from(stream_id) * 64, &ste);
    }

    /// Append `commands` to the command ring and trigger a drain. The
    /// bench ring holds 16 entries; tests stay below one lap.
    pub fn run_commands(&self, commands: &[[u8; 16]]) {
        let prod = self.smmu.read_register32(offsets::CMDQ_PROD, None);
        let index = prod & 0xF;
        assert!(
            index as usize + commands.len() <= 16,
            "test command ring exhausted"
        );
        for (i, command) in commands.iter().enumerate() {
            self.memory
                .write(CMDQ_BASE_ADDR + (u64::from(index) + i as u64) * 16, command);
        }
        self.smmu
            .write_register32(offsets::CMDQ_PROD, prod + commands.len() as u32, None);
    }

    pub fn cmdq_cons(&self) -> u32 {
        self.smmu.read_register32(offsets::CMDQ_CONS, None)
    }

    pub fn eventq_prod(&self) -> u32 {
        self.smmu.read_register32(offsets::EVENTQ_PROD, None)
    }
}

// Structure builders.

pub fn ste_stage1(context_ptr: u64, privcfg: u8) -> [u8; 64] {
    let mut raw = [0u8; 64];
    deposit_bit(&mut raw, 0, true);
    deposit(&mut raw, 1, 3, 0b101);
    deposit(&mut raw, 6, 50, context_ptr >> 6);
    deposit(&mut raw, 112, 2, u64::from(privcfg));
    raw
}

pub fn ste_bypass() -> [u8; 64] {
    let mut raw = [0u8; 64];
    deposit_bit(&mut raw, 0, true);
    deposit(&mut raw, 1, 3, 0b100);
    raw
}

pub fn ste_abort() -> [u8; 64] {
    [0u8; 64]
}

/// Context descriptor: valid, 4 KiB granule on TTB0, walk enabled.
pub fn cd_stage1(ttb0: u64, aa64: bool) -> [u8; 64] {
    let mut raw = [0u8; 64];
    deposit(&mut raw, 0, 6, 16); // T0SZ
    deposit(&mut raw, 6, 2, 0b00); // TG0 = 4K
    deposit_bit(&mut raw, 31, true); // V
    deposit_bit(&mut raw, 41, aa64);
    deposit(&mut raw, 68, 52, ttb0 >> 4);
    raw
}

pub fn table_pte(next_table: u64) -> [u8; 8] {
    vm_smmu::structures::encode_table_descriptor(next_table >> 12, 0b01, false, false)
}

pub fn page_pte(physical: u64, ap: u8, pxn: bool, uxn: bool) -> [u8; 8] {
    vm_smmu::structures::encode_table_descriptor(physical >> 12, ap, pxn, uxn)
}

pub fn block_pte(physical: u64) -> [u8; 8] {
    vm_smmu::structures::encode_block_descriptor(physical >> 12)
}

/// 32-bit address space walk (three lookups): L1 -> L2 -> L3 with the final
/// entry supplied by the test. Covers virtual address zero.
pub fn build_tables_aa32(memory: &MockMemory, final_entry: [u8; 8]) {
    memory.write(TABLE_L1, &table_pte(TABLE_L2));
    memory.write(TABLE_L2, &table_pte(TABLE_L3));
    memory.write(TABLE_L3, &final_entry);
}

/// Stage-1 stream with a VMSAv8-32 context at virtual address zero.
pub fn install_aa32_stream(bench: &TestBench, stream_id: u32, final_entry: [u8; 8]) {
    bench.install_ste(stream_id, ste_stage1(CD_BASE, 0b00));
    bench.memory.write(CD_BASE, &cd_stage1(TABLE_L1, false));
    build_tables_aa32(&bench.memory, final_entry);
}

// Command builders.

pub fn cmd(opcode: u8) -> [u8; 16] {
    let mut raw = [0u8; 16];
    raw[0] = opcode;
    raw
}

pub fn cmd_cfgi_ste(stream_id: u32) -> [u8; 16] {
    let mut raw = cmd(0x03);
    deposit(&mut raw, 32, 32, u64::from(stream_id));
    raw
}

pub fn cmd_tlbi_all() -> [u8; 16] {
    cmd(0x10)
}

pub fn cmd_tlbi_va(address: u64) -> [u8; 16] {
    let mut raw = cmd(0x12);
    deposit(&mut raw, 76, 52, address >> 12);
    raw
}

pub fn cmd_sync() -> [u8; 16] {
    cmd(0x46)
}

pub fn cmd_with_ssec(opcode: u8) -> [u8; 16] {
    let mut raw = cmd(opcode);
    deposit_bit(&mut raw, 10, true);
    raw
}
