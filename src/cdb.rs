//! SCSI READ/WRITE CDB construction (spec §4.1).
//!
//! Byte-layout rules are taken straight from SBC; the zero-fill + big-endian
//! slice-write style mirrors `control_block/{read,common}.rs` in the
//! `iscsi-client-rs` reference crate, generalized to cover all four CDB
//! sizes from one opcode table instead of one function per size.

use crate::error::{Error, Result};

/// Opcode tables indexed by `[6, 10, 12, 16]` (spec.md §4.1).
const READ_OPCODES: [u8; 4] = [0x08, 0x28, 0xA8, 0x88];
const WRITE_OPCODES: [u8; 4] = [0x0A, 0x2A, 0xAA, 0x8A];

const SIZES: [u8; 4] = [6, 10, 12, 16];

fn size_index(cdbsz: u8) -> Result<usize> {
    SIZES
        .iter()
        .position(|&s| s == cdbsz)
        .ok_or(Error::CdbOverflow {
            cdbsz,
            lba: 0,
            blocks: 0,
        })
}

/// Parameters accepted by [`build`].
#[derive(Debug, Clone, Copy)]
pub struct CdbParams {
    pub cdbsz: u8,
    pub blocks: u32,
    pub start_lba: u64,
    pub is_write: bool,
    pub fua: bool,
    pub dpo: bool,
}

/// Builds a zero-padded CDB of length `cdbsz` into a fresh `Vec<u8>`.
///
/// - byte 1 bit 4 = DPO, byte 1 bit 3 = FUA (sizes >= 10 only).
/// - 6-byte form: 21-bit LBA packed into bytes 1-3, 1-byte count in byte 4
///   (count==256 encoded as 0). Overflows if `blocks>256`, if
///   `start_lba+blocks-1` exceeds 21 bits, or if FUA/DPO was requested.
/// - 10-byte form: 32-bit big-endian LBA, 16-bit big-endian count;
///   overflows if `blocks>0xFFFF`.
/// - 12/16-byte forms: 32/64-bit big-endian LBA, 32-bit big-endian count.
pub fn build(p: CdbParams) -> Result<Vec<u8>> {
    let idx = size_index(p.cdbsz)?;
    let opcode = if p.is_write {
        WRITE_OPCODES[idx]
    } else {
        READ_OPCODES[idx]
    };

    let mut cdb = vec![0u8; p.cdbsz as usize];
    cdb[0] = opcode;

    match p.cdbsz {
        6 => {
            if p.fua || p.dpo {
                return Err(overflow(p));
            }
            if p.blocks > 256 {
                return Err(overflow(p));
            }
            let last = p
                .start_lba
                .checked_add(p.blocks.saturating_sub(1) as u64)
                .ok_or_else(|| overflow(p))?;
            if last >> 21 != 0 {
                return Err(overflow(p));
            }
            let lba21 = (p.start_lba as u32) & 0x1F_FFFF;
            cdb[1] = ((lba21 >> 16) & 0xFF) as u8;
            cdb[2] = ((lba21 >> 8) & 0xFF) as u8;
            cdb[3] = (lba21 & 0xFF) as u8;
            cdb[4] = if p.blocks == 256 { 0 } else { p.blocks as u8 };
        },
        10 => {
            if p.blocks > 0xFFFF {
                return Err(overflow(p));
            }
            cdb[1] = flags_byte(p.dpo, p.fua);
            cdb[2..6].copy_from_slice(&(p.start_lba as u32).to_be_bytes());
            cdb[7..9].copy_from_slice(&(p.blocks as u16).to_be_bytes());
        },
        12 => {
            cdb[1] = flags_byte(p.dpo, p.fua);
            cdb[2..6].copy_from_slice(&(p.start_lba as u32).to_be_bytes());
            cdb[6..10].copy_from_slice(&p.blocks.to_be_bytes());
        },
        16 => {
            cdb[1] = flags_byte(p.dpo, p.fua);
            cdb[2..10].copy_from_slice(&p.start_lba.to_be_bytes());
            cdb[10..14].copy_from_slice(&p.blocks.to_be_bytes());
        },
        _ => unreachable!("size_index validated cdbsz"),
    }

    Ok(cdb)
}

#[inline]
fn flags_byte(dpo: bool, fua: bool) -> u8 {
    (u8::from(dpo) << 4) | (u8::from(fua) << 3)
}

fn overflow(p: CdbParams) -> Error {
    Error::CdbOverflow {
        cdbsz: p.cdbsz,
        lba: p.start_lba,
        blocks: p.blocks as u64,
    }
}

/// Auto-promotes `cdbsz` to 16 when the LBA/count range would not fit a
/// 32-bit CDB (spec.md §6 `cdbsz=` / §8 boundary cases).
pub fn promote_if_needed(cdbsz: u8, start_lba: u64, blocks: u64) -> u8 {
    if cdbsz == 16 {
        return 16;
    }
    let last = start_lba.saturating_add(blocks.saturating_sub(1));
    if last > u32::from(u32::MAX) as u64 || blocks > u32::from(u16::MAX) as u64 {
        16
    } else {
        cdbsz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read10_layout() {
        let cdb = build(CdbParams {
            cdbsz: 10,
            blocks: 4,
            start_lba: 0x1234_5678,
            is_write: false,
            fua: false,
            dpo: false,
        })
        .unwrap();
        assert_eq!(cdb.len(), 10);
        assert_eq!(cdb[0], 0x28);
        assert_eq!(&cdb[2..6], &0x1234_5678u32.to_be_bytes());
        assert_eq!(&cdb[7..9], &4u16.to_be_bytes());
    }

    #[test]
    fn write16_layout() {
        let cdb = build(CdbParams {
            cdbsz: 16,
            blocks: 0x1_0001,
            start_lba: 0x1_0000_0000,
            is_write: true,
            fua: true,
            dpo: true,
        })
        .unwrap();
        assert_eq!(cdb[0], 0x8A);
        assert_eq!(cdb[1], 0b0001_1000);
        assert_eq!(&cdb[2..10], &0x1_0000_0000u64.to_be_bytes());
        assert_eq!(&cdb[10..14], &0x1_0001u32.to_be_bytes());
    }

    #[test]
    fn cdb6_overflow_on_range() {
        let err = build(CdbParams {
            cdbsz: 6,
            blocks: 1,
            start_lba: 1 << 21,
            is_write: false,
            fua: false,
            dpo: false,
        })
        .unwrap_err();
        assert!(matches!(err, Error::CdbOverflow { .. }));
    }

    #[test]
    fn cdb6_overflow_on_blocks() {
        let err = build(CdbParams {
            cdbsz: 6,
            blocks: 257,
            start_lba: 0,
            is_write: false,
            fua: false,
            dpo: false,
        })
        .unwrap_err();
        assert!(matches!(err, Error::CdbOverflow { .. }));
    }

    #[test]
    fn cdb6_zero_blocks_encodes_256() {
        let cdb = build(CdbParams {
            cdbsz: 6,
            blocks: 256,
            start_lba: 0,
            is_write: false,
            fua: false,
            dpo: false,
        })
        .unwrap();
        assert_eq!(cdb[4], 0);
    }

    #[test]
    fn cdb6_fua_is_overflow() {
        let err = build(CdbParams {
            cdbsz: 6,
            blocks: 1,
            start_lba: 0,
            is_write: false,
            fua: true,
            dpo: false,
        })
        .unwrap_err();
        assert!(matches!(err, Error::CdbOverflow { .. }));
    }

    #[test]
    fn cdb10_overflow_on_blocks() {
        let err = build(CdbParams {
            cdbsz: 10,
            blocks: 0x1_0000,
            start_lba: 0,
            is_write: false,
            fua: false,
            dpo: false,
        })
        .unwrap_err();
        assert!(matches!(err, Error::CdbOverflow { .. }));
    }

    #[test]
    fn promotion_triggers_on_large_lba() {
        assert_eq!(promote_if_needed(10, 0, 1), 10);
        assert_eq!(promote_if_needed(10, u32::MAX as u64, 2), 16);
        assert_eq!(promote_if_needed(10, 0, 0x1_0000), 16);
    }
}
