//! Kernel-side buffer sharing between a "master" (reading) sg fd and a
//! "slave" (writing) sg fd, via `SG_SET_GET_EXTENDED`/`SEIM_SHARE_FD`
//! (spec.md §4.3). Lets a worker skip the user-space copy between the
//! read leg and the write leg of a segment when both sides are `sg` and
//! neither requests `mmap` on its own buffer.

use std::os::fd::RawFd;

use libc::ioctl;

use crate::{
    error::{Error, Result},
    sg::uapi::{sg_extended_info, SG_SEIM_SHARE_FD, SG_SET_GET_EXTENDED},
};

/// Links `slave_fd`'s data buffer to `master_fd`'s reserved buffer so a
/// write submitted on `slave_fd` with `SG_FLAG_NO_DXFER` consumes the data
/// the master's last read already placed in the kernel, without a
/// userspace bounce (spec.md §4.3 "prepare").
pub fn prepare(master_fd: RawFd, slave_fd: RawFd) -> Result<()> {
    set_share_fd(slave_fd, master_fd)
}

/// Repoints an already-shared slave fd at a different master, used when a
/// retry resubmits the read leg on a fresh fd (spec.md §4.3 "swap_to").
/// Retries a handful of times on transient `EBUSY`, since the driver can
/// briefly refuse re-linking while the previous share is still draining.
pub fn swap_to(slave_fd: RawFd, new_master_fd: RawFd) -> Result<()> {
    const MAX_ATTEMPTS: u32 = 5;
    let mut attempt = 0;
    loop {
        match set_share_fd(slave_fd, new_master_fd) {
            Ok(()) => return Ok(()),
            Err(Error::Io(e)) if e.raw_os_error() == Some(libc::EBUSY) && attempt < MAX_ATTEMPTS => {
                attempt += 1;
                std::thread::yield_now();
            },
            Err(e) => return Err(e),
        }
    }
}

/// Breaks an existing share link, returning `slave_fd` to driving its own
/// buffer (used when falling back off the shared-buffer fast path after a
/// retry moves either side off `sg`).
pub fn release(slave_fd: RawFd) -> Result<()> {
    set_share_fd(slave_fd, -1)
}

fn set_share_fd(slave_fd: RawFd, master_fd: RawFd) -> Result<()> {
    let mut info = sg_extended_info {
        sei_wr_mask: SG_SEIM_SHARE_FD,
        share_fd: master_fd,
        ..sg_extended_info::default()
    };

    let rc = unsafe {
        ioctl(
            slave_fd,
            SG_SET_GET_EXTENDED,
            &mut info as *mut sg_extended_info,
        )
    };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_rejects_bad_fd() {
        // fd -1 can never be a valid sg device; the ioctl must fail rather
        // than silently succeed.
        let err = prepare(-1, -1).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
