//! Error taxonomy for the copy engine (spec §7).
//!
//! Mirrors the error kinds spec.md enumerates: CDB overflow, the sg
//! transport's submit/receive failure modes, the per-side retry-or-fatal
//! completions, ordinary-fd I/O errors, and cooperative cancellation.

use thiserror::Error;

/// Sense key of a SCSI completion, used only for `Outcome` classification.
/// Sense-data *text* formatting is out of scope (spec.md §1); only the key
/// byte is threaded through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SenseKey {
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    BlankCheck = 0x8,
    VendorSpecific = 0x9,
    CopyAborted = 0xA,
    AbortedCommand = 0xB,
    Other = 0xC,
    VolumeOverflow = 0xD,
    Miscompare = 0xE,
    Completed = 0xF,
}

impl From<u8> for SenseKey {
    fn from(v: u8) -> Self {
        match v & 0x0F {
            0x0 => SenseKey::NoSense,
            0x1 => SenseKey::RecoveredError,
            0x2 => SenseKey::NotReady,
            0x3 => SenseKey::MediumError,
            0x4 => SenseKey::HardwareError,
            0x5 => SenseKey::IllegalRequest,
            0x6 => SenseKey::UnitAttention,
            0x7 => SenseKey::DataProtect,
            0x8 => SenseKey::BlankCheck,
            0x9 => SenseKey::VendorSpecific,
            0xA => SenseKey::CopyAborted,
            0xB => SenseKey::AbortedCommand,
            0xD => SenseKey::VolumeOverflow,
            0xE => SenseKey::Miscompare,
            0xF => SenseKey::Completed,
            _ => SenseKey::Other,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// CDB byte layout cannot represent the requested LBA/block-count/flag
    /// combination (spec.md §4.1).
    #[error("CDB overflow: cdbsz={cdbsz} lba={lba} blocks={blocks}")]
    CdbOverflow { cdbsz: u8, lba: u64, blocks: u64 },

    /// sg submit failed with ENOMEM.
    #[error("sg submit out of memory")]
    OutOfMemory,

    /// sg submit failed for any other reason, or the completion could not
    /// be classified into a known outcome.
    #[error("sg transport error: {0}")]
    TransportFatal(String),

    /// ABORTED COMMAND sense key; caller should retry the same segment.
    #[error("aborted command (retryable)")]
    AbortedCommand,

    /// UNIT ATTENTION sense key; caller should retry the same segment.
    #[error("unit attention (retryable)")]
    UnitAttention,

    /// Medium or hardware error; fatal unless the side has `coe` set.
    #[error("medium/hardware error (sense key {0:?})")]
    MediumHard(SenseKey),

    /// Device not ready or any other unclassified sense; always fatal.
    #[error("device not ready or unclassified error (sense key {0:?})")]
    NotReady(SenseKey),

    /// Ordinary file/pipe I/O error (non-EINTR/EAGAIN).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stop flag was observed; the worker is unwinding cooperatively.
    #[error("cancelled")]
    Cancelled,

    /// Configuration is invalid (ambient: not part of spec.md's error
    /// taxonomy, but validation has to report something).
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Process-wide exit category (spec.md §6 "Exit codes").
///
/// A nonzero sg library category (sense-based) propagates as the exit
/// status; if blocks remain uncopied and no other error was set, exit with
/// a generic "other" category; unrecoverable setup errors return a syntax
/// or file-error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCategory {
    Success = 0,
    SyntaxError = 1,
    FileError = 2,
    NotReady = 3,
    MediumHard = 4,
    AbortedCommand = 5,
    Other = 9,
}

impl ExitCategory {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<&Error> for ExitCategory {
    fn from(e: &Error) -> Self {
        match e {
            Error::CdbOverflow { .. } | Error::Config(_) => ExitCategory::SyntaxError,
            Error::Io(_) => ExitCategory::FileError,
            Error::NotReady(_) => ExitCategory::NotReady,
            Error::MediumHard(_) => ExitCategory::MediumHard,
            Error::AbortedCommand | Error::UnitAttention => ExitCategory::AbortedCommand,
            Error::OutOfMemory | Error::TransportFatal(_) | Error::Cancelled => {
                ExitCategory::Other
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sense_key_roundtrip() {
        assert_eq!(SenseKey::from(0x3), SenseKey::MediumError);
        assert_eq!(SenseKey::from(0xB), SenseKey::AbortedCommand);
        assert_eq!(SenseKey::from(0xFF), SenseKey::Completed);
    }

    #[test]
    fn exit_category_mapping() {
        assert_eq!(
            ExitCategory::from(&Error::MediumHard(SenseKey::MediumError)).code(),
            4
        );
        assert_eq!(ExitCategory::from(&Error::Cancelled).code(), 9);
    }
}
