//! Raw sg-driver uapi surface: header struct shapes and ioctl numbers.
//!
//! This module is the "external collaborator" layer spec.md §1 describes —
//! the byte-for-byte kernel interface that a sense-data decoder, a capacity
//! prober, or a flag parser would also depend on. It deliberately knows
//! nothing about retry policy or outcome classification; that lives in
//! `sg::transport`.
//!
//! The `sg_io_hdr`-shaped struct below generalizes the teacher's
//! `SgTaskHdr<BT>` (`pakr-rawata/src/linux.rs`), which wrapped the same sg
//! v3 header for ATA-over-SG passthrough, to plain SCSI CDBs. `SG_IO` keeps
//! the teacher's literal value (`0x2285`).

#![allow(non_camel_case_types, dead_code)]

use libc::{c_int, c_void};

/// `ioctl(2)` request numbers understood by `/dev/sg*` character devices
/// (mirrors `<scsi/sg.h>`).
pub const SG_IO: libc::c_ulong = 0x2285;
pub const SG_GET_RESERVED_SIZE: libc::c_ulong = 0x2272;
pub const SG_SET_RESERVED_SIZE: libc::c_ulong = 0x2275;
pub const SG_GET_VERSION_NUM: libc::c_ulong = 0x2282;
pub const SG_SET_FORCE_PACK_ID: libc::c_ulong = 0x227B;
pub const SG_GET_PACK_ID: libc::c_ulong = 0x227C;
pub const SG_SET_GET_EXTENDED: libc::c_ulong = 0x2276;
pub const SG_EMULATED_HOST: libc::c_ulong = 0x2203;

/// Minimum sg driver version (30000 == v3) we require before attempting any
/// submit/receive traffic.
pub const SG_MIN_VERSION_NUM: i32 = 30000;
/// Version floor at which the v4 (`sg_io_v4`) interface is available.
pub const SG_MIN_VERSION_NUM_V4: i32 = 40000;

pub const SG_DXFER_NONE: c_int = -1;
pub const SG_DXFER_TO_DEV: c_int = -2;
pub const SG_DXFER_FROM_DEV: c_int = -3;
pub const SG_DXFER_TO_FROM_DEV: c_int = -4;

pub const SG_FLAG_DIRECT_IO: u32 = 0x01;
pub const SG_FLAG_MMAP_IO: u32 = 0x04;
pub const SG_FLAG_NO_DXFER: u32 = 0x10;

pub const SG_INFO_OK_MASK: u32 = 0x1;
pub const SG_INFO_OK: u32 = 0x0;
pub const SG_INFO_DIRECT_IO_MASK: u32 = 0x6;
pub const SG_INFO_DIRECT_IO: u32 = 0x2;

/// v3 interface magic (`interface_id` field == `'S'`).
pub const SG_INTERFACE_ID_V3: i32 = b'S' as i32;
/// v4 interface magic (`guard` field, distinguishing it from v3's header on
/// the shared `SG_IO` ioctl path).
pub const SG_IO_V4_GUARD: i32 = b'Q' as i32;

/// sg v3 command header, laid out exactly like the teacher's `SgTaskHdr`.
#[repr(C)]
#[derive(Debug)]
pub struct sg_io_hdr {
    pub interface_id: i32,
    pub dxfer_direction: c_int,
    pub cmd_len: u8,
    pub mx_sb_len: u8,
    pub iovec_count: u16,
    pub dxfer_len: u32,
    pub dxferp: *mut c_void,
    pub cmdp: *mut u8,
    pub sbp: *mut u8,
    pub timeout: u32,
    pub flags: u32,
    pub pack_id: i32,
    pub usr_ptr: *mut c_void,
    pub status: u8,
    pub masked_status: u8,
    pub msg_status: u8,
    pub sb_len_wr: u8,
    pub host_status: u16,
    pub driver_status: u16,
    pub resid: i32,
    pub duration: u32,
    pub info: u32,
}

impl Default for sg_io_hdr {
    fn default() -> Self {
        // SAFETY: all-zero is a valid bit pattern for every field (raw
        // pointers included — null is the "unused" sentinel the driver
        // expects when e.g. no sense buffer is supplied).
        unsafe { std::mem::zeroed() }
    }
}

/// sg v4 command header (multiplexed/bidirectional variant); mirrors the
/// subset of `<linux/bsg.h>`'s `sg_io_v4` that this crate drives.
#[repr(C)]
#[derive(Debug)]
pub struct sg_io_v4 {
    pub guard: i32,
    pub protocol: u32,
    pub subprotocol: u32,

    pub request_len: u32,
    pub request: u64,
    pub request_tag: u64,
    pub request_attr: u32,
    pub request_priority: u32,
    pub request_extra: u32,
    pub max_response_len: u32,

    pub response: u64,

    pub dout_iovec_count: u32,
    pub dout_xfer_len: u32,
    pub din_iovec_count: u32,
    pub din_xfer_len: u32,
    pub dout_xferp: u64,
    pub din_xferp: u64,

    pub timeout: u32,
    pub flags: u32,
    pub usr_ptr: u64,
    pub spare_in: u32,

    pub driver_status: u32,
    pub transport_status: u32,
    pub device_status: u32,
    pub retry_delay: u32,
    pub info: u32,
    pub duration: u32,
    pub response_len: u32,
    pub din_resid: i32,
    pub dout_resid: i32,
    pub generated_tag: u64,
    pub spare_out: u32,
    pub padding: u32,
}

impl Default for sg_io_v4 {
    fn default() -> Self {
        // SAFETY: every field is a plain integer; all-zero is valid.
        unsafe { std::mem::zeroed() }
    }
}

/// Buffer-share sub-ioctl payload for `SG_SET_GET_EXTENDED`.
pub const SG_SEIM_SHARE_FD: u32 = 0x10;
pub const SG_SEIM_RESERVED_SIZE: u32 = 0x02;
pub const SG_CTL_FLAGM_NO_DXFER: u32 = 0x40;

#[repr(C)]
#[derive(Debug, Default)]
pub struct sg_extended_info {
    pub sei_wr_mask: u32,
    pub sei_rd_mask: u32,
    pub ctl_flags_wr_mask: u32,
    pub ctl_flags_rd_mask: u32,
    pub ctl_flags: u32,
    pub read_value: u32,
    pub share_fd: i32,
    pub reserved_sz: u32,
    pub tot_fd_thresh: u32,
    pub minor_index: u32,
    pub share_locked: u32,
    pub reserved: [u32; 38],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_zero_initializable() {
        let h = sg_io_hdr::default();
        assert_eq!(h.interface_id, 0);
        let h4 = sg_io_v4::default();
        assert_eq!(h4.guard, 0);
    }
}
