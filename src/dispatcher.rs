//! Segment Dispatcher (spec.md §4.4): hands out disjoint, monotonically
//! increasing block ranges to worker threads via a single atomic
//! fetch-add, so no two workers ever claim the same segment and no
//! separate locking is needed for allocation itself.

use std::sync::atomic::{AtomicI64, Ordering};

/// One unit of work: `blocks` device blocks starting at `iblk`
/// (input-relative) / `oblk` (output-relative, same count, different
/// origin once `skip`/`seek` differ).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Zero-based sequence number of this segment; doubles as the write
    /// order key the Ordering Gate waits on.
    pub seq: u64,
    pub iblk: u64,
    pub oblk: u64,
    pub blocks: u32,
}

/// Allocates segments of up to `bpt` blocks from a `total`-block job,
/// offsetting input/output LBAs by `skip`/`seek` (spec.md §6). `total`
/// mirrors spec.md §4.4's `total == -1` sentinel as `None`: "discover"
/// mode, where the job runs until a short read stops it rather than a
/// fixed block count (`count=-1`, or any non-regular input with no
/// `count=` given).
pub struct Dispatcher {
    next_pos: AtomicI64,
    total: Option<i64>,
    bpt: u32,
    skip: u64,
    seek: u64,
}

impl Dispatcher {
    pub fn new(total_blocks: Option<u64>, bpt: u32, skip: u64, seek: u64) -> Self {
        Dispatcher {
            next_pos: AtomicI64::new(0),
            total: total_blocks.map(|t| t as i64),
            bpt,
            skip,
            seek,
        }
    }

    /// Claims the next segment, or `None` once every block in a bounded
    /// job has been handed out. In discover mode (`total == None`) this
    /// never returns `None` on its own; the caller must stop pulling once
    /// a short read (spec.md §4.2) signals the input is exhausted.
    pub fn next(&self) -> Option<Segment> {
        let blocks_per_seg = self.bpt as i64;
        let start = self.next_pos.fetch_add(blocks_per_seg, Ordering::SeqCst);

        let blocks = match self.total {
            Some(total) => {
                if start >= total {
                    return None;
                }
                (total - start).min(blocks_per_seg) as u32
            },
            None => self.bpt,
        };
        let seq = (start / blocks_per_seg) as u64;

        Some(Segment {
            seq,
            iblk: self.skip + start as u64,
            oblk: self.seek + start as u64,
            blocks,
        })
    }

    /// Total number of segments this job will ever hand out (useful for
    /// progress reporting and for sizing the Ordering Gate's expected
    /// final sequence number). `None` in discover mode, since the job's
    /// length isn't known in advance.
    pub fn segment_count(&self) -> Option<u64> {
        let total = self.total?;
        let bpt = self.bpt as i64;
        Some(((total + bpt - 1) / bpt).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_disjoint_segments() {
        let d = Dispatcher::new(Some(10), 3, 0, 0);
        let mut segs = vec![];
        while let Some(s) = d.next() {
            segs.push(s);
        }
        assert_eq!(segs.len(), 4);
        assert_eq!(segs[0], Segment { seq: 0, iblk: 0, oblk: 0, blocks: 3 });
        assert_eq!(segs[3], Segment { seq: 3, iblk: 9, oblk: 9, blocks: 1 });
    }

    #[test]
    fn applies_skip_and_seek_offsets() {
        let d = Dispatcher::new(Some(4), 4, 100, 200);
        let s = d.next().unwrap();
        assert_eq!(s.iblk, 100);
        assert_eq!(s.oblk, 200);
        assert!(d.next().is_none());
    }

    #[test]
    fn concurrent_claims_never_overlap() {
        use std::sync::Arc;
        let d = Arc::new(Dispatcher::new(Some(1000), 7, 0, 0));
        let mut handles = vec![];
        for _ in 0..8 {
            let d = Arc::clone(&d);
            handles.push(std::thread::spawn(move || {
                let mut claimed = vec![];
                while let Some(s) = d.next() {
                    claimed.push(s.seq);
                }
                claimed
            }));
        }
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), d.segment_count().unwrap() as usize);
    }

    #[test]
    fn zero_total_yields_nothing() {
        let d = Dispatcher::new(Some(0), 4, 0, 0);
        assert!(d.next().is_none());
    }

    #[test]
    fn discover_mode_never_exhausts_on_its_own() {
        let d = Dispatcher::new(None, 4, 0, 0);
        assert!(d.segment_count().is_none());
        for expected_seq in 0..5 {
            let s = d.next().unwrap();
            assert_eq!(s.seq, expected_seq);
            assert_eq!(s.blocks, 4);
        }
    }
}
