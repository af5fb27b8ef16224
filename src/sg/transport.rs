//! Completion classification (spec.md §4.2): turns a raw [`Completion`]
//! into one of six outcomes a worker can act on without re-deriving SCSI
//! status semantics at every call site.

use libc::c_int;

use crate::{error::SenseKey, sg::device::Completion};

/// Host-status values this crate distinguishes (from `<scsi/scsi.h>`'s
/// `DID_*` family); everything else falls into `NotReadyOther`.
const DID_OK: u16 = 0x00;
const DID_NO_CONNECT: u16 = 0x01;
const DID_BUS_BUSY: u16 = 0x02;
const DID_TIME_OUT: u16 = 0x03;
const DID_ABORT: u16 = 0x05;

/// Driver-status values (`DRIVER_*`); only the sense flag matters here.
const DRIVER_SENSE: u16 = 0x08;

const SAM_STAT_GOOD: u8 = 0x00;
const SAM_STAT_CHECK_CONDITION: u8 = 0x02;

/// One completed command's disposition, per spec.md §4.2's classification
/// table. Workers branch on this rather than re-inspecting host/driver
/// status and sense keys themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed with no error of any kind.
    Clean,
    /// Completed with a recovered error (sense key `RecoveredError`);
    /// treated as success but worth noting.
    Recovered,
    /// `ABORTED COMMAND` sense key or `DID_ABORT`/timeout host status;
    /// caller should retry the same segment.
    AbortedCommand,
    /// `UNIT ATTENTION` sense key; caller should retry the same segment.
    UnitAttention,
    /// Medium or hardware error; fatal unless the side has `coe` set.
    MediumHard(SenseKey),
    /// Device not ready, transport-level failure, or any other
    /// unclassified condition; always fatal.
    NotReadyOther(SenseKey),
    /// A regular-file read or write transferred fewer bytes than the
    /// segment asked for (spec.md §4.2 "Ordinary read": short read sets
    /// `stop_after_write` and rounds the segment into `in_partial`/
    /// `out_partial` instead of `in_full`/`out_full`). Never produced by
    /// [`classify`]; only the `Regular` backend's own I/O loop detects
    /// this, since `sg` completions carry residual-byte accounting
    /// instead.
    ShortTransfer,
}

/// Classifies a raw completion, following spec.md §4.2's precedence:
/// transport-level host-status failures first, then sense-key-driven
/// classification of a `CHECK CONDITION` status, then the clean path.
pub fn classify(c: &Completion) -> Outcome {
    match c.host_status {
        DID_OK => {},
        DID_ABORT | DID_TIME_OUT => return Outcome::AbortedCommand,
        DID_NO_CONNECT | DID_BUS_BUSY => {
            return Outcome::NotReadyOther(SenseKey::NotReady)
        },
        _ => return Outcome::NotReadyOther(SenseKey::Other),
    }

    if c.masked_status != SAM_STAT_CHECK_CONDITION
        && (c.driver_status & 0x0F) != DRIVER_SENSE
    {
        return if c.masked_status == SAM_STAT_GOOD {
            Outcome::Clean
        } else {
            Outcome::NotReadyOther(SenseKey::Other)
        };
    }

    let key = c.sense_key().unwrap_or(SenseKey::NoSense);
    match key {
        SenseKey::NoSense => Outcome::Clean,
        SenseKey::RecoveredError => Outcome::Recovered,
        SenseKey::AbortedCommand | SenseKey::CopyAborted => Outcome::AbortedCommand,
        SenseKey::UnitAttention => Outcome::UnitAttention,
        SenseKey::MediumError | SenseKey::HardwareError => Outcome::MediumHard(key),
        other => Outcome::NotReadyOther(other),
    }
}

/// Whether a completion's `resid` indicates a direct-I/O command that the
/// driver serviced via bounce buffering instead (spec.md §4.2 "dio
/// incomplete" counter).
pub fn dio_fell_back(c: &Completion, dio_requested: bool) -> bool {
    dio_requested && !c.dio_serviced
}

/// Residual byte count as a signed delta (spec.md §8 "partial transfer"
/// accounting): positive means fewer bytes were transferred than
/// requested.
pub fn residual_blocks(c: &Completion, block_size: u32) -> c_int {
    if block_size == 0 {
        return 0;
    }
    c.resid / block_size as c_int
}
