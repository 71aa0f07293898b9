//! Command decoding for the in-memory command queue.
//!
//! Commands are 16-byte records whose first byte selects the layout of the
//! rest. The decoder is a closed table from opcode to decode routine, built
//! once at module initialization from a static list; opcodes inside the
//! architected opcode space without a handler decode to
//! [`CommandKind::Unhandled`], everything else to [`CommandKind::Invalid`].
//! Execution lives with the device, which owns the state commands mutate.

use std::collections::HashMap;
use std::sync::LazyLock;

use log::warn;

use crate::SecurityState;
use crate::bits::{extract, extract_bit};
use crate::queue::{DecodeElement, QueueElement};

/// Encoded width of one command.
pub const COMMAND_BYTES: usize = 16;

/// The architected command opcode space. Listing an opcode here only means
/// the device recognizes it; most of the invalidation and stall machinery is
/// acknowledged without doing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    PrefetchConfig = 0x01,
    PrefetchAddr = 0x02,
    CfgiSte = 0x03,
    CfgiSteRange = 0x04,
    CfgiCd = 0x05,
    CfgiCdAll = 0x06,
    CfgiVmsPidm = 0x07,
    TlbiNhAll = 0x10,
    TlbiNhAsid = 0x11,
    TlbiNhVa = 0x12,
    TlbiNhVaa = 0x13,
    TlbiEl3All = 0x18,
    TlbiEl3Va = 0x1A,
    TlbiEl2All = 0x20,
    TlbiEl2Asid = 0x21,
    TlbiEl2Va = 0x22,
    TlbiEl2Vaa = 0x23,
    TlbiS12Vmall = 0x28,
    TlbiS2Ipa = 0x2A,
    TlbiNsnhAll = 0x30,
    AtcInv = 0x40,
    PriResp = 0x41,
    Resume = 0x44,
    StallTerm = 0x45,
    Sync = 0x46,
    TlbiSEl2All = 0x50,
    TlbiSEl2Asid = 0x51,
    TlbiSEl2Va = 0x52,
    TlbiSEl2Vaa = 0x53,
    TlbiSS12Vmall = 0x58,
    TlbiSS2Ipa = 0x5A,
    TlbiSnhAll = 0x60,
    DptiAll = 0x70,
    DptiPa = 0x73,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        use Opcode::*;
        Some(match byte {
            0x01 => PrefetchConfig,
            0x02 => PrefetchAddr,
            0x03 => CfgiSte,
            0x04 => CfgiSteRange,
            0x05 => CfgiCd,
            0x06 => CfgiCdAll,
            0x07 => CfgiVmsPidm,
            0x10 => TlbiNhAll,
            0x11 => TlbiNhAsid,
            0x12 => TlbiNhVa,
            0x13 => TlbiNhVaa,
            0x18 => TlbiEl3All,
            0x1A => TlbiEl3Va,
            0x20 => TlbiEl2All,
            0x21 => TlbiEl2Asid,
            0x22 => TlbiEl2Va,
            0x23 => TlbiEl2Vaa,
            0x28 => TlbiS12Vmall,
            0x2A => TlbiS2Ipa,
            0x30 => TlbiNsnhAll,
            0x40 => AtcInv,
            0x41 => PriResp,
            0x44 => Resume,
            0x45 => StallTerm,
            0x46 => Sync,
            0x50 => TlbiSEl2All,
            0x51 => TlbiSEl2Asid,
            0x52 => TlbiSEl2Va,
            0x53 => TlbiSEl2Vaa,
            0x58 => TlbiSS12Vmall,
            0x5A => TlbiSS2Ipa,
            0x60 => TlbiSnhAll,
            0x70 => DptiAll,
            0x73 => DptiPa,
            _ => return None,
        })
    }
}

/// Error code a command execution resolves to, written to the consumer
/// register's error field when non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    None,
    Illegal,
    Abort,
    AtcInvalidationSync,
}

impl CommandError {
    pub fn reason(self) -> u32 {
        match self {
            CommandError::None => 0,
            CommandError::Illegal => 1,
            CommandError::Abort => 2,
            CommandError::AtcInvalidationSync => 3,
        }
    }

    pub fn is_failure(self) -> bool {
        self != CommandError::None
    }
}

/// Decoded command payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Hint that a stream's configuration is about to be used. A no-op is a
    /// valid implementation.
    PrefetchConfig {
        ssv: bool,
        substream_id: u32,
        stream_id: u32,
    },
    /// Hint that a range of addresses is about to be used.
    PrefetchAddress {
        ssv: bool,
        substream_id: u32,
        stream_id: u32,
        size: u8,
        stride: u8,
        ns: bool,
        address: u64,
    },
    /// Drop the cached stream table entry for one stream.
    InvalidateSte { stream_id: u32, leaf: bool },
    /// Drop the cached stream table entries for a power-of-two aligned
    /// range of streams.
    InvalidateSteRange { stream_id: u32, range: u8 },
    /// Invalidate all cached translations. The VMID qualifier is decoded
    /// but not used to narrow the invalidation.
    InvalidateTlbAll { vmid: u16 },
    /// ASID-qualified variant; degrades to invalidate-all.
    InvalidateTlbByAsid { vmid: u16, asid: u16 },
    /// Invalidate cached translations covering one address. The range and
    /// granule hints are decoded but not used to narrow the invalidation.
    InvalidateTlbByAddress {
        num: u8,
        scale: u8,
        vmid: u16,
        address: u64,
        leaf: bool,
        ttl128: bool,
        ttl: u8,
        granule: u8,
    },
    /// ASID-qualified variant of the by-address invalidation.
    InvalidateTlbByAddressAsid {
        num: u8,
        scale: u8,
        vmid: u16,
        asid: u16,
        address: u64,
        leaf: bool,
        ttl128: bool,
        ttl: u8,
        granule: u8,
    },
    /// Completion barrier for preceding commands.
    Sync {
        completion_signal: u8,
        msi_shareability: u8,
        msi_attributes: u8,
        msi_data: u32,
        msi_address: u64,
        msi_ns: bool,
    },
    /// Recognized opcode without a handler.
    Unhandled { opcode: Opcode },
    /// Opcode outside the architected space.
    Invalid { opcode: u8 },
}

/// A decoded command: the security tag common to all layouts plus the
/// opcode-specific payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Secure-world tag (bit 10). Not every layout architecturally carries
    /// it, but the bit position is common to those that do.
    pub ssec: bool,
    pub kind: CommandKind,
}

impl Command {
    /// Security screen applied before dispatch: a command tagged for the
    /// secure world must not arrive through the non-secure queue.
    pub fn validate_security(&self, state: SecurityState) -> CommandError {
        if state != SecurityState::Secure && self.ssec {
            warn!(
                "SSec set on a command executed from the non-secure queue ({:?})",
                self.kind
            );
            return CommandError::Illegal;
        }
        CommandError::None
    }
}

type KindDecoder = fn(&[u8]) -> CommandKind;

/// Handled opcodes and their decode routines. The supported command list is
/// fixed for all device instances.
const HANDLED_COMMANDS: &[(Opcode, KindDecoder)] = &[
    (Opcode::PrefetchConfig, decode_prefetch_config),
    (Opcode::PrefetchAddr, decode_prefetch_address),
    (Opcode::CfgiSte, decode_invalidate_ste),
    (Opcode::CfgiSteRange, decode_invalidate_ste_range),
    (Opcode::TlbiNhAll, decode_tlbi_all),
    (Opcode::TlbiNhAsid, decode_tlbi_by_asid),
    (Opcode::TlbiNhVa, decode_tlbi_by_address),
    (Opcode::TlbiNhVaa, decode_tlbi_by_address_asid),
    (Opcode::Sync, decode_sync),
];

static DECODERS: LazyLock<HashMap<u8, KindDecoder>> = LazyLock::new(|| {
    HANDLED_COMMANDS
        .iter()
        .map(|&(opcode, decoder)| (opcode as u8, decoder))
        .collect()
});

fn decode_prefetch_config(raw: &[u8]) -> CommandKind {
    CommandKind::PrefetchConfig {
        ssv: extract_bit(raw, 11),
        substream_id: extract(raw, 12, 20) as u32,
        stream_id: extract(raw, 32, 32) as u32,
    }
}

fn decode_prefetch_address(raw: &[u8]) -> CommandKind {
    CommandKind::PrefetchAddress {
        ssv: extract_bit(raw, 11),
        substream_id: extract(raw, 12, 20) as u32,
        stream_id: extract(raw, 32, 32) as u32,
        size: extract(raw, 64, 5) as u8,
        stride: extract(raw, 69, 5) as u8,
        ns: extract_bit(raw, 75),
        address: extract(raw, 76, 52) << 12,
    }
}

fn decode_invalidate_ste(raw: &[u8]) -> CommandKind {
    CommandKind::InvalidateSte {
        stream_id: extract(raw, 32, 32) as u32,
        leaf: extract_bit(raw, 64),
    }
}

fn decode_invalidate_ste_range(raw: &[u8]) -> CommandKind {
    CommandKind::InvalidateSteRange {
        stream_id: extract(raw, 32, 32) as u32,
        range: extract(raw, 64, 5) as u8,
    }
}

fn decode_tlbi_all(raw: &[u8]) -> CommandKind {
    CommandKind::InvalidateTlbAll {
        vmid: extract(raw, 32, 16) as u16,
    }
}

fn decode_tlbi_by_asid(raw: &[u8]) -> CommandKind {
    CommandKind::InvalidateTlbByAsid {
        vmid: extract(raw, 32, 16) as u16,
        asid: extract(raw, 48, 16) as u16,
    }
}

fn decode_tlbi_by_address(raw: &[u8]) -> CommandKind {
    CommandKind::InvalidateTlbByAddress {
        num: extract(raw, 12, 5) as u8,
        scale: extract(raw, 20, 6) as u8,
        vmid: extract(raw, 32, 16) as u16,
        address: extract(raw, 76, 52) << 12,
        leaf: extract_bit(raw, 64),
        ttl128: extract_bit(raw, 71),
        ttl: extract(raw, 72, 2) as u8,
        granule: extract(raw, 74, 2) as u8,
    }
}

fn decode_tlbi_by_address_asid(raw: &[u8]) -> CommandKind {
    CommandKind::InvalidateTlbByAddressAsid {
        num: extract(raw, 12, 5) as u8,
        scale: extract(raw, 20, 6) as u8,
        vmid: extract(raw, 32, 16) as u16,
        asid: extract(raw, 48, 16) as u16,
        address: extract(raw, 76, 52) << 12,
        leaf: extract_bit(raw, 64),
        ttl128: extract_bit(raw, 71),
        ttl: extract(raw, 72, 2) as u8,
        granule: extract(raw, 74, 2) as u8,
    }
}

fn decode_sync(raw: &[u8]) -> CommandKind {
    CommandKind::Sync {
        completion_signal: extract(raw, 12, 2) as u8,
        msi_shareability: extract(raw, 22, 2) as u8,
        msi_attributes: extract(raw, 24, 4) as u8,
        msi_data: extract(raw, 32, 32) as u32,
        msi_address: extract(raw, 66, 54) << 2,
        msi_ns: extract_bit(raw, 127),
    }
}

impl QueueElement for Command {
    const WIDTH: usize = COMMAND_BYTES;
}

impl DecodeElement for Command {
    fn decode(raw: &[u8]) -> Self {
        let opcode = raw[0];
        let ssec = extract_bit(raw, 10);
        let kind = match DECODERS.get(&opcode) {
            Some(decoder) => decoder(raw),
            None => match Opcode::from_byte(opcode) {
                Some(opcode) => CommandKind::Unhandled { opcode },
                None => CommandKind::Invalid { opcode },
            },
        };
        Command { ssec, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{deposit, deposit_bit};

    fn raw_command(opcode: u8) -> [u8; COMMAND_BYTES] {
        let mut raw = [0u8; COMMAND_BYTES];
        raw[0] = opcode;
        raw
    }

    #[test]
    fn decode_invalidate_ste_fields() {
        let mut raw = raw_command(0x03);
        deposit(&mut raw, 32, 32, 0x17);
        deposit_bit(&mut raw, 64, true);

        let cmd = Command::decode(&raw);
        assert!(!cmd.ssec);
        assert_eq!(
            cmd.kind,
            CommandKind::InvalidateSte {
                stream_id: 0x17,
                leaf: true
            }
        );
    }

    #[test]
    fn decode_tlbi_by_address_shifts_address() {
        let mut raw = raw_command(0x12);
        deposit(&mut raw, 76, 52, 0x1234);
        deposit(&mut raw, 32, 16, 7);

        let cmd = Command::decode(&raw);
        let CommandKind::InvalidateTlbByAddress { vmid, address, .. } = cmd.kind else {
            panic!("wrong variant: {:?}", cmd.kind);
        };
        assert_eq!(vmid, 7);
        assert_eq!(address, 0x1234 << 12);
    }

    #[test]
    fn decode_sync_fields() {
        let mut raw = raw_command(0x46);
        deposit(&mut raw, 12, 2, 0b01);
        deposit(&mut raw, 32, 32, 0xCAFE);
        deposit(&mut raw, 66, 54, 0x4000 >> 2);
        deposit_bit(&mut raw, 127, true);

        let cmd = Command::decode(&raw);
        let CommandKind::Sync {
            completion_signal,
            msi_data,
            msi_address,
            msi_ns,
            ..
        } = cmd.kind
        else {
            panic!("wrong variant: {:?}", cmd.kind);
        };
        assert_eq!(completion_signal, 0b01);
        assert_eq!(msi_data, 0xCAFE);
        assert_eq!(msi_address, 0x4000);
        assert!(msi_ns);
    }

    #[test]
    fn recognized_opcode_without_handler_decodes_as_unhandled() {
        let cmd = Command::decode(&raw_command(0x05));
        assert_eq!(
            cmd.kind,
            CommandKind::Unhandled {
                opcode: Opcode::CfgiCd
            }
        );
    }

    #[test]
    fn unknown_opcode_decodes_as_invalid() {
        let cmd = Command::decode(&raw_command(0x7F));
        assert_eq!(cmd.kind, CommandKind::Invalid { opcode: 0x7F });
    }

    #[test]
    fn ssec_rejected_on_the_non_secure_queue() {
        let mut raw = raw_command(0x03);
        deposit_bit(&mut raw, 10, true);

        let cmd = Command::decode(&raw);
        assert!(cmd.ssec);
        assert_eq!(
            cmd.validate_security(SecurityState::NonSecure),
            CommandError::Illegal
        );
        assert_eq!(
            cmd.validate_security(SecurityState::Secure),
            CommandError::None
        );
    }

    #[test]
    fn error_reasons_match_the_register_encoding() {
        assert_eq!(CommandError::None.reason(), 0);
        assert_eq!(CommandError::Illegal.reason(), 1);
        assert_eq!(CommandError::Abort.reason(), 2);
        assert_eq!(CommandError::AtcInvalidationSync.reason(), 3);
    }
}
