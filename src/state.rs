//! Shared in-process state: per-run flags, per-side counters, and the
//! buffer types workers move data through (spec.md §3).

use std::{
    fs::File,
    sync::atomic::{AtomicI64, AtomicU32, AtomicU64},
    sync::Mutex,
};

use bitflags::bitflags;

use crate::worker::Transfer;

bitflags! {
    /// `iflag=`/`oflag=` and top-level boolean switches (spec.md §6),
    /// modeled as one bitset per side the way `iscsi-client-rs` models its
    /// CDB option bytes as `bitflags!` sets instead of a field per switch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u32 {
        /// Open the output with `O_APPEND` (output-side only).
        const APPEND    = 1 << 0;
        /// Continue on error (`coe=`): degrade MediumHard to a logged skip
        /// instead of a fatal abort.
        const COE       = 1 << 1;
        /// Use the driver's default reserved-buffer size instead of
        /// sizing it from `bs*bpt`.
        const DEFRES    = 1 << 2;
        /// Request `SG_FLAG_DIRECT_IO`.
        const DIO       = 1 << 3;
        /// Open with `O_DIRECT`.
        const DIRECT    = 1 << 4;
        /// Set the CDB's DPO bit.
        const DPO       = 1 << 5;
        /// Open with `O_DSYNC`.
        const DSYNC     = 1 << 6;
        /// Open with `O_EXCL`.
        const EXCL      = 1 << 7;
        /// Set the CDB's FUA bit.
        const FUA       = 1 << 8;
        /// Map this side's buffer with `SG_FLAG_MMAP_IO` instead of a
        /// user-space `Vec<u8>`.
        const MMAP      = 1 << 9;
        /// Disallow kernel buffer sharing even if both sides qualify.
        const NOSHARE   = 1 << 10;
        /// Submit with `SG_FLAG_NO_DXFER` (used by the shared-buffer fast
        /// path's write leg).
        const NOXFER    = 1 << 11;
        /// Treat this side as `/dev/null`-equivalent (output only).
        const NULL      = 1 << 12;
        /// All worker threads issue this side's I/O on one shared fd
        /// instead of one fd per thread.
        const SAME_FDS  = 1 << 13;
        /// Interleave this side's read and write legs instead of
        /// completing the read before issuing the write (`swait=`).
        const SWAIT     = 1 << 14;
        /// Force the sg v3 interface even if v4 is available.
        const V3        = 1 << 15;
        /// Prefer the sg v4 interface.
        const V4        = 1 << 16;
    }
}

impl Flags {
    /// Parses a comma-separated flag list (spec.md §6's `iflag=a,b,c`
    /// syntax), case-insensitively, rejecting unknown tokens.
    pub fn from_csv(s: &str) -> Result<Self, crate::error::Error> {
        let mut flags = Flags::empty();
        for tok in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let bit = match tok.to_ascii_lowercase().as_str() {
                "append" => Flags::APPEND,
                "coe" => Flags::COE,
                "defres" => Flags::DEFRES,
                "dio" => Flags::DIO,
                "direct" => Flags::DIRECT,
                "dpo" => Flags::DPO,
                "dsync" => Flags::DSYNC,
                "excl" => Flags::EXCL,
                "fua" => Flags::FUA,
                "mmap" => Flags::MMAP,
                "noshare" => Flags::NOSHARE,
                "noxfer" => Flags::NOXFER,
                "null" => Flags::NULL,
                "same_fds" => Flags::SAME_FDS,
                "swait" => Flags::SWAIT,
                "v3" => Flags::V3,
                "v4" => Flags::V4,
                other => {
                    return Err(crate::error::Error::Config(format!(
                        "unknown flag '{other}'"
                    )))
                },
            };
            flags |= bit;
        }
        Ok(flags)
    }
}

/// A worker's data buffer for one segment: either a plain heap allocation
/// or a region mapped from the sg driver's reserved buffer (`mmap=`).
pub enum Buffer {
    Owned(Vec<u8>),
    Mapped(MappedBuf),
}

impl Buffer {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Buffer::Owned(v) => v.as_slice(),
            Buffer::Mapped(m) => m.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Buffer::Owned(v) => v.as_mut_slice(),
            Buffer::Mapped(m) => m.as_mut_slice(),
        }
    }
}

/// A region mapped via `mmap(2)` over an sg device fd's reserved buffer
/// (`SG_FLAG_MMAP_IO`); unmapped on drop.
pub struct MappedBuf {
    ptr: *mut u8,
    len: usize,
}

impl MappedBuf {
    /// # Safety
    /// `fd` must be an sg device fd with a reserved buffer of at least
    /// `len` bytes already negotiated via `SG_SET_RESERVED_SIZE`.
    pub unsafe fn new(fd: std::os::fd::RawFd, len: usize) -> std::io::Result<Self> {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(MappedBuf { ptr: ptr as *mut u8, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for MappedBuf {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// SAFETY: the mapping is only ever read/written through `&`/`&mut`
// borrows that respect Rust's aliasing rules at the Rust level; the
// kernel is the only other writer and only while no Rust reference is
// live across a syscall boundary that hands it the buffer.
unsafe impl Send for MappedBuf {}

/// Per-side running counters (spec.md §3, §8 final-report fields).
#[derive(Debug, Default)]
pub struct SideCounters {
    pub full_blocks: AtomicU64,
    pub partial_blocks: AtomicU64,
    pub residual_blocks: AtomicU64,
    pub dio_incomplete: AtomicU64,
    pub retries: AtomicU64,
}

/// Configuration and counters for one side of the copy (input or output).
pub struct SideState {
    pub flags: Flags,
    pub block_size: u32,
    pub cdbsz: u8,
    pub counters: SideCounters,
}

impl SideState {
    pub fn new(flags: Flags, block_size: u32, cdbsz: u8) -> Self {
        SideState { flags, block_size, cdbsz, counters: SideCounters::default() }
    }
}

/// Process-wide state shared across all worker threads (spec.md §3).
pub struct GlobalState {
    pub input: SideState,
    pub output: SideState,
    pub stop: std::sync::atomic::AtomicBool,
    pub pack_id_seq: AtomicU32,
    /// Highest segment sequence number observed to fail fatally; used by
    /// the final report to decide the exit category when multiple
    /// workers fail concurrently (lowest `seq` wins, spec.md §8).
    pub first_failed_seq: AtomicI64,

    /// Secondary destination (`of2=`, spec.md §3 "Secondary output"):
    /// counters plus the single shared transfer, guarded the way spec.md
    /// §4.6 step 6 guards it under one `out2_mutex` rather than one fd per
    /// worker.
    pub output2: Option<SideState>,
    pub out2_transfer: Option<Mutex<Transfer>>,

    /// Register output (`ofreg=`, spec.md §3 "Register output"): an
    /// ordinary file or pipe that receives a copy of every read payload.
    /// Never an sg device, so a plain `Mutex<File>` suffices.
    pub outreg: Option<Mutex<File>>,
}

impl GlobalState {
    pub fn new(input: SideState, output: SideState) -> Self {
        GlobalState {
            input,
            output,
            stop: std::sync::atomic::AtomicBool::new(false),
            pack_id_seq: AtomicU32::new(0),
            first_failed_seq: AtomicI64::new(-1),
            output2: None,
            out2_transfer: None,
            outreg: None,
        }
    }

    /// Attaches a secondary destination and/or register file (spec.md §6
    /// `of2=`/`ofreg=`), built once up front and shared across every
    /// worker thread instead of opened per-thread.
    pub fn with_secondary(
        mut self,
        output2: Option<(SideState, Transfer)>,
        outreg: Option<File>,
    ) -> Self {
        if let Some((side, transfer)) = output2 {
            self.output2 = Some(side);
            self.out2_transfer = Some(Mutex::new(transfer));
        }
        self.outreg = outreg.map(Mutex::new);
        self
    }

    pub fn next_pack_id(&self) -> i32 {
        self.pack_id_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed) as i32
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Records a fatal failure at `seq`, keeping only the earliest one
    /// (spec.md §8: the final exit category reflects the first segment
    /// that failed, not the last one reported).
    pub fn record_failure(&self, seq: u64) {
        let seq = seq as i64;
        loop {
            let cur = self.first_failed_seq.load(std::sync::atomic::Ordering::SeqCst);
            if cur != -1 && cur <= seq {
                return;
            }
            if self
                .first_failed_seq
                .compare_exchange(
                    cur,
                    seq,
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                )
                .is_ok()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_csv_parses_known_tokens() {
        let f = Flags::from_csv("dio, Fua ,excl").unwrap();
        assert!(f.contains(Flags::DIO));
        assert!(f.contains(Flags::FUA));
        assert!(f.contains(Flags::EXCL));
        assert!(!f.contains(Flags::COE));
    }

    #[test]
    fn flags_csv_rejects_unknown_token() {
        assert!(Flags::from_csv("bogus").is_err());
    }

    #[test]
    fn flags_csv_empty_is_empty() {
        assert_eq!(Flags::from_csv("").unwrap(), Flags::empty());
    }

    #[test]
    fn record_failure_keeps_earliest() {
        let s = SideState::new(Flags::empty(), 512, 10);
        let o = SideState::new(Flags::empty(), 512, 10);
        let g = GlobalState::new(s, o);
        g.record_failure(5);
        g.record_failure(2);
        g.record_failure(9);
        assert_eq!(g.first_failed_seq.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
