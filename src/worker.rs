//! Worker Engine (spec.md §4.6): the per-thread state machine that pulls
//! segments from the [`Dispatcher`](crate::dispatcher::Dispatcher), reads
//! the input side, waits its turn at the [`OrderingGate`], writes the
//! output side, and folds the result into the shared counters.
//!
//! Three interchangeable I/O backends satisfy the same `Transfer` trait
//! (spec.md §9: "closed tagged variant... uniform transfer() operation")
//! so the state machine itself never branches on device kind.

use std::{
    fs::File,
    io::{self, Write},
    os::fd::{AsRawFd, RawFd},
    os::unix::fs::FileExt,
    sync::{atomic::Ordering, Arc},
};

use tracing::{debug, warn};

use crate::{
    cdb::{self, CdbParams},
    dispatcher::{Dispatcher, Segment},
    error::{Error, Result},
    ordering::{OrderingGate, OrderingGuardDrop},
    share,
    sg::{self, transport::Outcome, SgDevice},
    state::{Buffer, Flags, GlobalState, SideState},
};

const MAX_RETRIES: u32 = 5;
const SENSE_LEN: usize = 64;
const DEFAULT_TIMEOUT_MS: u32 = 60_000;

/// One side's I/O backend, selected once at startup from its path/flags
/// (spec.md §9's "closed tagged variant" resolution of the original
/// open-ended `RawAta`/`Device` abstraction).
pub enum Transfer {
    Sg(SgDevice),
    Regular(File),
    Null,
}

impl Transfer {
    /// Reads `seg.blocks` blocks at `seg.iblk` into `buf` (input side) or
    /// writes `buf` to `seg.oblk` (output side), returning the
    /// classified outcome. `pack_id` is only meaningful for the `Sg`
    /// variant.
    pub fn perform(
        &self,
        side: &SideState,
        is_write: bool,
        seg: &Segment,
        buf: &mut Buffer,
        pack_id: i32,
    ) -> Result<Outcome> {
        self.perform_ex(side, is_write, seg, buf, pack_id, false)
    }

    /// As [`perform`](Self::perform), but `force_noxfer` overrides `side`'s
    /// own `NOXFER` flag — used by the shared-buffer fast paths (`swait`'s
    /// interleaved write, and a secondary write riding the primary's
    /// share) where the submission must not hand the driver a userspace
    /// pointer regardless of how this side was configured.
    pub fn perform_ex(
        &self,
        side: &SideState,
        is_write: bool,
        seg: &Segment,
        buf: &mut Buffer,
        pack_id: i32,
        force_noxfer: bool,
    ) -> Result<Outcome> {
        match self {
            Transfer::Sg(dev) => sg_perform(dev, side, is_write, seg, buf, pack_id, force_noxfer),
            Transfer::Regular(file) => regular_perform(file, side, is_write, seg, buf),
            Transfer::Null => null_perform(is_write, seg, buf),
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Transfer::Sg(dev) => Some(dev.raw_fd()),
            Transfer::Regular(f) => Some(f.as_raw_fd()),
            Transfer::Null => None,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn sg_perform(
    dev: &SgDevice,
    side: &SideState,
    is_write: bool,
    seg: &Segment,
    buf: &mut Buffer,
    pack_id: i32,
    force_noxfer: bool,
) -> Result<Outcome> {
    let lba = if is_write { seg.oblk } else { seg.iblk };
    let cdb = cdb::build(CdbParams {
        cdbsz: side.cdbsz,
        blocks: seg.blocks,
        start_lba: lba,
        is_write,
        fua: side.flags.contains(Flags::FUA),
        dpo: side.flags.contains(Flags::DPO),
    })?;

    let dir = if is_write {
        sg::uapi::SG_DXFER_TO_DEV
    } else {
        sg::uapi::SG_DXFER_FROM_DEV
    };

    let mut flags = 0u32;
    if side.flags.contains(Flags::DIO) {
        flags |= sg::uapi::SG_FLAG_DIRECT_IO;
    }
    if side.flags.contains(Flags::MMAP) {
        flags |= sg::uapi::SG_FLAG_MMAP_IO;
    }
    if force_noxfer || side.flags.contains(Flags::NOXFER) {
        flags |= sg::uapi::SG_FLAG_NO_DXFER;
    }

    let mut sense = [0u8; SENSE_LEN];
    dev.submit(
        &cdb,
        dir,
        Some(buf.as_mut_slice()),
        &mut sense,
        DEFAULT_TIMEOUT_MS,
        flags,
        pack_id,
    )?;
    let completion = dev.receive(pack_id, SENSE_LEN)?;
    let outcome = sg::transport::classify(&completion);

    if sg::transport::dio_fell_back(&completion, side.flags.contains(Flags::DIO)) {
        side.counters.dio_incomplete.fetch_add(1, Ordering::Relaxed);
    }
    let resid = sg::transport::residual_blocks(&completion, side.block_size);
    if resid > 0 {
        side.counters.residual_blocks.fetch_add(resid as u64, Ordering::Relaxed);
    }

    Ok(outcome)
}

/// Performs one leg of a segment against an ordinary file, tolerating a
/// short transfer instead of treating it as an I/O error (spec.md §4.2
/// "Ordinary read"): `read_at`/`write_at` already report how many bytes
/// actually moved rather than erroring on a partial result the way
/// `read_exact_at`/`write_all_at` do, so a source shorter than
/// `blocks*bs` (or a destination that can't take the full buffer) simply
/// rounds this segment into `ShortTransfer` instead of aborting the job.
fn regular_perform(
    file: &File,
    side: &SideState,
    is_write: bool,
    seg: &Segment,
    buf: &mut Buffer,
) -> Result<Outcome> {
    let offset = (if is_write { seg.oblk } else { seg.iblk }) * side.block_size as u64;
    let wanted = buf.as_slice().len();

    let transferred = if is_write {
        positional_write(file, buf.as_slice(), offset)?
    } else {
        let n = positional_read(file, buf.as_mut_slice(), offset)?;
        if n < wanted {
            buf.as_mut_slice()[n..].fill(0);
        }
        n
    };

    if transferred < wanted {
        Ok(Outcome::ShortTransfer)
    } else {
        Ok(Outcome::Clean)
    }
}

/// Reads into `buf` starting at `offset`, looping past `EINTR`-style
/// partial reads but stopping at the first zero-byte read (true EOF).
fn positional_read(file: &File, buf: &mut [u8], mut offset: u64) -> io::Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], offset)? {
            0 => break,
            n => {
                total += n;
                offset += n as u64;
            },
        }
    }
    Ok(total)
}

/// Writes `buf` starting at `offset`, looping past partial writes but
/// stopping if the underlying file stops accepting bytes.
fn positional_write(file: &File, buf: &[u8], mut offset: u64) -> io::Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        match file.write_at(&buf[total..], offset)? {
            0 => break,
            n => {
                total += n;
                offset += n as u64;
            },
        }
    }
    Ok(total)
}

fn null_perform(is_write: bool, _seg: &Segment, buf: &mut Buffer) -> Result<Outcome> {
    if !is_write {
        buf.as_mut_slice().fill(0);
    }
    Ok(Outcome::Clean)
}

/// Runs one worker thread's share of the job to completion (or until the
/// shared state is told to stop). Returns `Ok(())` on a clean or
/// gracefully-stopped finish; `Err` propagates a fatal, non-`coe`-covered
/// failure so the caller can set the process exit category.
pub fn run(
    global: &GlobalState,
    dispatcher: &Dispatcher,
    gate: &OrderingGate,
    input: &Transfer,
    output: &Transfer,
    share_enabled: bool,
) -> Result<()> {
    while !global.is_stopping() {
        let Some(seg) = dispatcher.next() else {
            break;
        };

        match run_segment(global, gate, input, output, share_enabled, seg) {
            Ok(()) => {},
            Err(Error::Cancelled) => break,
            Err(e) => {
                global.record_failure(seg.seq);
                global.request_stop();
                gate.stop();
                return Err(e);
            },
        }
    }
    Ok(())
}

fn run_segment(
    global: &GlobalState,
    gate: &OrderingGate,
    input: &Transfer,
    output: &Transfer,
    share_enabled: bool,
    seg: Segment,
) -> Result<()> {
    let in_bytes = seg.blocks as usize * global.input.block_size as usize;
    let mut read_buf = Buffer::Owned(vec![0u8; in_bytes]);

    // share::prepare failing is not fatal to the job (spec.md §4.3): this
    // segment just falls back to an unshared write, paying the userspace
    // copy it would otherwise have skipped.
    let effective_share = if share_enabled {
        match (input.raw_fd(), output.raw_fd()) {
            (Some(in_fd), Some(out_fd)) => match share::prepare(in_fd, out_fd) {
                Ok(()) => true,
                Err(e) => {
                    warn!(seq = seg.seq, error = %e, "share setup failed, falling back to unshared write");
                    false
                },
            },
            _ => false,
        }
    } else {
        false
    };

    // Skip-ordering exception (spec.md §4.5): when both sides are `sg`,
    // the buffer is shared, and no register output needs this segment's
    // data in order, the kernel's single in-flight buffer already
    // serializes the write behind the read, so no condvar turn is needed.
    let skip_ordering = effective_share
        && matches!(input, Transfer::Sg(_))
        && matches!(output, Transfer::Sg(_))
        && global.outreg.is_none();

    let want_swait = skip_ordering
        && (global.input.flags.contains(Flags::SWAIT) || global.output.flags.contains(Flags::SWAIT));

    if want_swait {
        if let (Transfer::Sg(in_dev), Transfer::Sg(out_dev)) = (input, output) {
            match swait_interleaved(global, in_dev, out_dev, &seg, &mut read_buf) {
                Ok((read_outcome, write_outcome))
                    if !is_retryable(read_outcome) && !is_retryable(write_outcome) =>
                {
                    let read_outcome = finalize_outcome(&global.input, seg, read_outcome)?;
                    account(&global.input, read_outcome);
                    if matches!(read_outcome, Outcome::ShortTransfer) {
                        global.request_stop();
                    }
                    let write_outcome = finalize_outcome(&global.output, seg, write_outcome)?;
                    account(&global.output, write_outcome);
                    if matches!(write_outcome, Outcome::ShortTransfer) {
                        global.request_stop();
                    }
                    write_secondary(global, input, output, seg, &read_buf);
                    return Ok(());
                },
                _ => {
                    debug!(seq = seg.seq, "swait interleave not usable, falling back to sequential path");
                },
            }
        }
    }

    let read_outcome = retrying(&global.input, seg, || {
        let pack_id = global.next_pack_id();
        input.perform(&global.input, false, &seg, &mut read_buf, pack_id)
    })?;
    account(&global.input, read_outcome);
    if matches!(read_outcome, Outcome::ShortTransfer) {
        global.request_stop();
    }

    write_register(global, seg, &read_buf);

    if skip_ordering {
        let write_outcome = retrying(&global.output, seg, || {
            let pack_id = global.next_pack_id();
            output.perform(&global.output, true, &seg, &mut read_buf, pack_id)
        })?;
        account(&global.output, write_outcome);
        if matches!(write_outcome, Outcome::ShortTransfer) {
            global.request_stop();
        }
        write_secondary(global, input, output, seg, &read_buf);
        return Ok(());
    }

    let guard = match OrderingGuardDrop::acquire(gate, seg.seq) {
        Some(g) => g,
        None => return Err(Error::Cancelled),
    };

    let write_outcome = retrying(&global.output, seg, || {
        let pack_id = global.next_pack_id();
        output.perform(&global.output, true, &seg, &mut read_buf, pack_id)
    });

    drop(guard);

    let write_outcome = write_outcome?;
    account(&global.output, write_outcome);
    if matches!(write_outcome, Outcome::ShortTransfer) {
        global.request_stop();
    }
    write_secondary(global, input, output, seg, &read_buf);
    Ok(())
}

/// Whether `outcome` warrants another attempt of the same segment rather
/// than a terminal disposition.
fn is_retryable(outcome: Outcome) -> bool {
    matches!(outcome, Outcome::AbortedCommand | Outcome::UnitAttention)
}

/// Turns a non-retryable outcome into this side's final `Result`:
/// degrades a `MediumHard` outcome to a logged skip when the side has
/// `coe` set, otherwise propagates it (and any other non-clean terminal
/// outcome) as fatal. `ShortTransfer` passes through unchanged — the
/// caller decides whether a short transfer should stop the job.
fn finalize_outcome(side: &SideState, seg: Segment, outcome: Outcome) -> Result<Outcome> {
    match outcome {
        Outcome::Clean | Outcome::Recovered | Outcome::ShortTransfer => Ok(outcome),
        Outcome::MediumHard(key) if side.flags.contains(Flags::COE) => {
            warn!(seq = seg.seq, ?key, "medium/hardware error, continuing (coe)");
            Ok(outcome)
        },
        Outcome::MediumHard(key) => Err(Error::MediumHard(key)),
        Outcome::NotReadyOther(key) => Err(Error::NotReady(key)),
        Outcome::AbortedCommand => Err(Error::AbortedCommand),
        Outcome::UnitAttention => Err(Error::UnitAttention),
    }
}

/// Retries `AbortedCommand`/`UnitAttention` outcomes up to `MAX_RETRIES`
/// times (spec.md §4.2/§4.6), then hands the terminal outcome to
/// [`finalize_outcome`].
fn retrying<F>(side: &SideState, seg: Segment, mut attempt: F) -> Result<Outcome>
where
    F: FnMut() -> Result<Outcome>,
{
    for try_n in 0..=MAX_RETRIES {
        let outcome = attempt()?;
        if is_retryable(outcome) && try_n < MAX_RETRIES {
            side.counters.retries.fetch_add(1, Ordering::Relaxed);
            debug!(seq = seg.seq, attempt = try_n, ?outcome, "retrying segment");
            continue;
        }
        return finalize_outcome(side, seg, outcome);
    }
    unreachable!("loop always returns by MAX_RETRIES")
}

fn account(side: &SideState, outcome: Outcome) {
    match outcome {
        Outcome::Clean | Outcome::Recovered => {
            side.counters.full_blocks.fetch_add(1, Ordering::Relaxed);
        },
        Outcome::MediumHard(_) | Outcome::ShortTransfer => {
            side.counters.partial_blocks.fetch_add(1, Ordering::Relaxed);
        },
        _ => {},
    }
}

/// Submits both legs of a segment before receiving either (spec.md §4.6
/// step 2, `swait=`): valid only on the skip-ordering fast path, where
/// both sides are `sg` and share one kernel buffer. The write leg is
/// forced `SG_FLAG_NO_DXFER` since it consumes the buffer the read leg
/// is filling rather than transferring a payload of its own. The caller
/// falls back to the plain sequential path on any retryable outcome or
/// submit/receive error rather than re-attempting interleaving.
fn swait_interleaved(
    global: &GlobalState,
    in_dev: &SgDevice,
    out_dev: &SgDevice,
    seg: &Segment,
    buf: &mut Buffer,
) -> Result<(Outcome, Outcome)> {
    let read_cdb = cdb::build(CdbParams {
        cdbsz: global.input.cdbsz,
        blocks: seg.blocks,
        start_lba: seg.iblk,
        is_write: false,
        fua: global.input.flags.contains(Flags::FUA),
        dpo: global.input.flags.contains(Flags::DPO),
    })?;
    let write_cdb = cdb::build(CdbParams {
        cdbsz: global.output.cdbsz,
        blocks: seg.blocks,
        start_lba: seg.oblk,
        is_write: true,
        fua: global.output.flags.contains(Flags::FUA),
        dpo: global.output.flags.contains(Flags::DPO),
    })?;

    let read_pack_id = global.next_pack_id();
    let write_pack_id = global.next_pack_id();

    let mut read_flags = 0u32;
    if global.input.flags.contains(Flags::DIO) {
        read_flags |= sg::uapi::SG_FLAG_DIRECT_IO;
    }
    if global.input.flags.contains(Flags::MMAP) {
        read_flags |= sg::uapi::SG_FLAG_MMAP_IO;
    }

    let mut read_sense = [0u8; SENSE_LEN];
    in_dev.submit(
        &read_cdb,
        sg::uapi::SG_DXFER_FROM_DEV,
        Some(buf.as_mut_slice()),
        &mut read_sense,
        DEFAULT_TIMEOUT_MS,
        read_flags,
        read_pack_id,
    )?;

    let mut write_sense = [0u8; SENSE_LEN];
    out_dev.submit(
        &write_cdb,
        sg::uapi::SG_DXFER_TO_DEV,
        None,
        &mut write_sense,
        DEFAULT_TIMEOUT_MS,
        sg::uapi::SG_FLAG_NO_DXFER,
        write_pack_id,
    )?;

    let read_completion = in_dev.receive(read_pack_id, SENSE_LEN)?;
    let read_outcome = sg::transport::classify(&read_completion);
    if sg::transport::dio_fell_back(&read_completion, global.input.flags.contains(Flags::DIO)) {
        global.input.counters.dio_incomplete.fetch_add(1, Ordering::Relaxed);
    }
    let read_resid = sg::transport::residual_blocks(&read_completion, global.input.block_size);
    if read_resid > 0 {
        global.input.counters.residual_blocks.fetch_add(read_resid as u64, Ordering::Relaxed);
    }

    let write_completion = out_dev.receive(write_pack_id, SENSE_LEN)?;
    let write_outcome = sg::transport::classify(&write_completion);
    let write_resid = sg::transport::residual_blocks(&write_completion, global.output.block_size);
    if write_resid > 0 {
        global.output.counters.residual_blocks.fetch_add(write_resid as u64, Ordering::Relaxed);
    }

    Ok((read_outcome, write_outcome))
}

/// Writes a copy of the read payload to the register file (`ofreg=`,
/// spec.md §4.6 step 4), if one is configured. A failure here is logged
/// and never aborts the segment — the register stream is a best-effort
/// side channel, not the primary output.
fn write_register(global: &GlobalState, seg: Segment, read_buf: &Buffer) {
    let Some(outreg) = &global.outreg else { return };
    let mut file = outreg.lock().unwrap();
    if let Err(e) = file.write_all(read_buf.as_slice()) {
        warn!(seq = seg.seq, error = %e, "register write failed");
    }
}

/// Writes a copy of the just-read payload to the secondary destination
/// (`of2=`, spec.md §4.6 step 6), if one is configured. `out2_transfer`
/// is a single resource shared by every worker thread, so each write
/// takes its mutex; when both the primary input and `of2` are `sg`, the
/// secondary's share link is repointed at this thread's own input fd
/// before the write (`swap_to(out2_fd, before=true)`) and the primary
/// output's link is restored afterward (`swap_to(out_fd, before=false)`),
/// since the two slaves otherwise leave the link pointed wherever the
/// last secondary write put it. A failure here is logged and never
/// fails the segment.
fn write_secondary(
    global: &GlobalState,
    input: &Transfer,
    output: &Transfer,
    seg: Segment,
    read_buf: &Buffer,
) {
    let (Some(out2_side), Some(out2_transfer)) = (&global.output2, &global.out2_transfer) else {
        return;
    };
    let mut out2 = out2_transfer.lock().unwrap();
    let mut buf = Buffer::Owned(read_buf.as_slice().to_vec());

    let mut force_noxfer = false;
    if matches!(&*out2, Transfer::Sg(_)) && matches!(input, Transfer::Sg(_)) {
        if let (Transfer::Sg(out2_dev), Some(in_fd)) = (&*out2, input.raw_fd()) {
            match share::swap_to(out2_dev.raw_fd(), in_fd) {
                Ok(()) => force_noxfer = true,
                Err(e) => {
                    warn!(seq = seg.seq, error = %e, "of2 share swap failed, using unshared write");
                },
            }
        }
    }

    let result = retrying(out2_side, seg, || {
        let pack_id = global.next_pack_id();
        out2.perform_ex(out2_side, true, &seg, &mut buf, pack_id, force_noxfer)
    });
    match result {
        Ok(outcome) => account(out2_side, outcome),
        Err(e) => warn!(seq = seg.seq, error = %e, "secondary write failed"),
    }

    if force_noxfer {
        if let (Some(in_fd), Some(out_fd)) = (input.raw_fd(), output.raw_fd()) {
            if matches!(output, Transfer::Sg(_)) {
                if let Err(e) = share::prepare(in_fd, out_fd) {
                    warn!(seq = seg.seq, error = %e, "failed to restore primary share link after secondary write");
                }
            }
        }
    }
}

/// Spawns `thr` worker threads sharing `global`/`dispatcher`/`gate`, and
/// joins them, returning the first fatal error observed (if any).
pub fn run_pool(
    global: Arc<GlobalState>,
    dispatcher: Arc<Dispatcher>,
    gate: Arc<OrderingGate>,
    make_input: impl Fn() -> Result<Transfer> + Send + Sync + 'static,
    make_output: impl Fn() -> Result<Transfer> + Send + Sync + 'static,
    share_enabled: bool,
    thr: u32,
) -> Result<()> {
    let make_input = Arc::new(make_input);
    let make_output = Arc::new(make_output);
    let mut handles = Vec::with_capacity(thr as usize);

    for _ in 0..thr {
        let global = Arc::clone(&global);
        let dispatcher = Arc::clone(&dispatcher);
        let gate = Arc::clone(&gate);
        let make_input = Arc::clone(&make_input);
        let make_output = Arc::clone(&make_output);

        handles.push(std::thread::spawn(move || -> Result<()> {
            let input = make_input()?;
            let output = make_output()?;
            run(&global, &dispatcher, &gate, &input, &output, share_enabled)
        }));
    }

    let mut first_err = None;
    for h in handles {
        match h.join() {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            },
            Err(_) => {
                if first_err.is_none() {
                    first_err = Some(Error::TransportFatal("worker thread panicked".into()));
                }
            },
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::ordering::OrderingGate;
    use crate::state::SideState;
    use std::sync::Arc;

    fn side(flags: Flags) -> SideState {
        SideState::new(flags, 512, 10)
    }

    #[test]
    fn null_to_null_completes_without_error() {
        let global = GlobalState::new(side(Flags::empty()), side(Flags::empty()));
        let dispatcher = Dispatcher::new(Some(16), 4, 0, 0);
        let gate = OrderingGate::new();
        let input = Transfer::Null;
        let output = Transfer::Null;

        run(&global, &dispatcher, &gate, &input, &output, false).unwrap();
        assert_eq!(global.output.counters.full_blocks.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn regular_file_roundtrip() {
        let mut src = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        src.write_all(&[0xAB; 2048]).unwrap();
        let dst = tempfile::NamedTempFile::new().unwrap();

        let global = GlobalState::new(side(Flags::empty()), side(Flags::empty()));
        let dispatcher = Dispatcher::new(Some(4), 4, 0, 0);
        let gate = OrderingGate::new();
        let input = Transfer::Regular(File::open(src.path()).unwrap());
        let output = Transfer::Regular(
            std::fs::OpenOptions::new().write(true).open(dst.path()).unwrap(),
        );

        run(&global, &dispatcher, &gate, &input, &output, false).unwrap();

        let written = std::fs::read(dst.path()).unwrap();
        assert_eq!(written, vec![0xAB; 2048]);
    }

    #[test]
    fn coe_degrades_medium_hard_to_partial() {
        let side_with_coe = side(Flags::COE);
        let seg = Segment { seq: 0, iblk: 0, oblk: 0, blocks: 1 };
        let mut calls = 0;
        let outcome = retrying(&side_with_coe, seg, || {
            calls += 1;
            Ok(Outcome::MediumHard(crate::error::SenseKey::MediumError))
        })
        .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(outcome, Outcome::MediumHard(crate::error::SenseKey::MediumError));
    }

    #[test]
    fn without_coe_medium_hard_is_fatal() {
        let plain = side(Flags::empty());
        let seg = Segment { seq: 0, iblk: 0, oblk: 0, blocks: 1 };
        let err = retrying(&plain, seg, || {
            Ok(Outcome::MediumHard(crate::error::SenseKey::HardwareError))
        })
        .unwrap_err();
        assert!(matches!(err, Error::MediumHard(_)));
    }

    #[test]
    fn aborted_command_retries_then_succeeds() {
        let plain = side(Flags::empty());
        let seg = Segment { seq: 0, iblk: 0, oblk: 0, blocks: 1 };
        let mut calls = 0;
        let outcome = retrying(&plain, seg, || {
            calls += 1;
            if calls < 3 {
                Ok(Outcome::AbortedCommand)
            } else {
                Ok(Outcome::Clean)
            }
        })
        .unwrap();
        assert_eq!(calls, 3);
        assert_eq!(outcome, Outcome::Clean);
    }

    #[test]
    fn worker_pool_splits_work_across_threads() {
        let global = Arc::new(GlobalState::new(side(Flags::empty()), side(Flags::empty())));
        let dispatcher = Arc::new(Dispatcher::new(Some(64), 4, 0, 0));
        let gate = Arc::new(OrderingGate::new());

        run_pool(
            global.clone(),
            dispatcher,
            gate,
            || Ok(Transfer::Null),
            || Ok(Transfer::Null),
            false,
            4,
        )
        .unwrap();

        assert_eq!(global.output.counters.full_blocks.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn short_read_is_accounted_partial_and_stops_the_job() {
        let mut src = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        // 3 blocks of 512 bytes plus a short 200-byte tail.
        src.write_all(&[0xCD; 512 * 3 + 200]).unwrap();
        let dst = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(dst.path(), vec![0u8; 512 * 4]).unwrap();

        let global = GlobalState::new(side(Flags::empty()), side(Flags::empty()));
        // bpt=4 so the whole file lands in a single short segment; discover
        // mode means the dispatcher never stops on its own.
        let dispatcher = Dispatcher::new(None, 4, 0, 0);
        let gate = OrderingGate::new();
        let input = Transfer::Regular(File::open(src.path()).unwrap());
        let output = Transfer::Regular(
            std::fs::OpenOptions::new().write(true).open(dst.path()).unwrap(),
        );

        run(&global, &dispatcher, &gate, &input, &output, false).unwrap();

        assert_eq!(global.input.counters.partial_blocks.load(Ordering::SeqCst), 1);
        // The read's unread tail is zero-filled before the write, so the
        // write leg itself transfers a full buffer and lands in out_full.
        assert_eq!(global.output.counters.full_blocks.load(Ordering::SeqCst), 1);
        assert!(global.is_stopping());

        let written = std::fs::read(dst.path()).unwrap();
        assert_eq!(&written[..512 * 3 + 200], &[0xCD; 512 * 3 + 200][..]);
        // The unread tail of the final (short) block is zero-filled rather
        // than carrying over whatever garbage was already in the buffer.
        assert_eq!(&written[512 * 3 + 200..512 * 4], &[0u8; 512 - 200][..]);
    }

    #[test]
    fn secondary_output_and_register_receive_every_segment() {
        let mut src = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        src.write_all(&[0x5A; 2048]).unwrap();
        let dst = tempfile::NamedTempFile::new().unwrap();
        let dst2 = tempfile::NamedTempFile::new().unwrap();
        let reg = tempfile::NamedTempFile::new().unwrap();

        let global = GlobalState::new(side(Flags::empty()), side(Flags::empty())).with_secondary(
            Some((
                side(Flags::empty()),
                Transfer::Regular(
                    std::fs::OpenOptions::new().write(true).open(dst2.path()).unwrap(),
                ),
            )),
            Some(std::fs::OpenOptions::new().write(true).open(reg.path()).unwrap()),
        );
        let dispatcher = Dispatcher::new(Some(4), 4, 0, 0);
        let gate = OrderingGate::new();
        let input = Transfer::Regular(File::open(src.path()).unwrap());
        let output = Transfer::Regular(
            std::fs::OpenOptions::new().write(true).open(dst.path()).unwrap(),
        );

        run(&global, &dispatcher, &gate, &input, &output, false).unwrap();

        assert_eq!(std::fs::read(dst.path()).unwrap(), vec![0x5A; 2048]);
        assert_eq!(std::fs::read(dst2.path()).unwrap(), vec![0x5A; 2048]);
        assert_eq!(std::fs::read(reg.path()).unwrap(), vec![0x5A; 2048]);
    }
}
