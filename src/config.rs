//! Validated run configuration (spec.md §6): the `name=value` operand set
//! parsed, defaulted, and cross-checked before any device is opened.

use std::path::PathBuf;

use crate::{
    cdb,
    error::{Error, Result},
    state::Flags,
};

const DEFAULT_BLOCK_SIZE: u32 = 512;
const DEFAULT_BPT_SMALL_BS: u32 = 128;
const DEFAULT_BPT_LARGE_BS: u32 = 32;
const LARGE_BS_THRESHOLD: u32 = 2048;
const DEFAULT_CDBSZ: u8 = 10;
const DEFAULT_THREADS: u32 = 4;
const MAX_THREADS: u32 = 16;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the input device/file; `None` is invalid (there is always
    /// an input side).
    pub input_path: PathBuf,
    /// Path to the output device/file; `None` means `of=` was omitted and
    /// defaults to the Null backend (spec.md §6 `of=` default).
    pub output_path: Option<PathBuf>,
    /// Secondary destination (`of2=`, spec.md §3/§6): every block written
    /// to `output_path` is also written here.
    pub output2_path: Option<PathBuf>,
    /// Register output (`ofreg=`, spec.md §3/§6): receives a copy of every
    /// block *read*, regardless of what happens on the output side.
    pub outreg_path: Option<PathBuf>,

    pub block_size: u32,
    pub bpt: u32,
    /// Total blocks to copy; `None` means "discover" (spec.md §4.4's
    /// `total == -1`): keep going until a short read stops the job, rather
    /// than a fixed count.
    pub total_blocks: Option<u64>,
    pub skip: u64,
    pub seek: u64,
    pub cdbsz: u8,
    pub threads: u32,

    pub in_flags: Flags,
    pub out_flags: Flags,

    pub ae: bool,
    pub elemsz_kb: Option<u32>,
    pub deb: u8,
    pub dry_run: bool,
}

impl Config {
    /// Builds a `Config` from parsed `name=value` operand fields,
    /// applying spec.md §6's defaults, then validates it.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        input_path: PathBuf,
        output_path: Option<PathBuf>,
        output2_path: Option<PathBuf>,
        outreg_path: Option<PathBuf>,
        block_size: Option<u32>,
        bpt: Option<u32>,
        total_blocks: Option<u64>,
        skip: u64,
        seek: u64,
        cdbsz: Option<u8>,
        threads: Option<u32>,
        in_flags: Flags,
        out_flags: Flags,
        ae: bool,
        elemsz_kb: Option<u32>,
        deb: u8,
        dry_run: bool,
    ) -> Result<Self> {
        let block_size = block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        let bpt = bpt.unwrap_or(if block_size >= LARGE_BS_THRESHOLD {
            DEFAULT_BPT_LARGE_BS
        } else {
            DEFAULT_BPT_SMALL_BS
        });
        let cdbsz = cdbsz.unwrap_or(DEFAULT_CDBSZ);
        let threads = threads.unwrap_or(DEFAULT_THREADS).clamp(1, MAX_THREADS);

        let cfg = Config {
            input_path,
            output_path,
            output2_path,
            outreg_path,
            block_size,
            bpt,
            total_blocks,
            skip,
            seek,
            cdbsz,
            threads,
            in_flags,
            out_flags,
            ae,
            elemsz_kb,
            deb,
            dry_run,
        };
        cfg.validate()
    }

    /// Cross-field checks that depend on more than one operand (spec.md
    /// §6/§9): block size sanity, `cdbsz` auto-promotion, and the
    /// `mmap`/`same_fds` mutual exclusion documented in DESIGN.md's Open
    /// Question decision #2.
    fn validate(mut self) -> Result<Self> {
        if self.block_size == 0 {
            return Err(Error::Config("bs must be nonzero".into()));
        }
        if self.bpt == 0 {
            return Err(Error::Config("bpt must be nonzero".into()));
        }

        if let Some(total) = self.total_blocks {
            self.cdbsz = cdb::promote_if_needed(
                self.cdbsz,
                self.skip.max(self.seek),
                total,
            );
        }

        if self.in_flags.contains(Flags::MMAP) && self.in_flags.contains(Flags::SAME_FDS) {
            return Err(Error::Config(
                "iflag=mmap is incompatible with iflag=same_fds".into(),
            ));
        }
        if self.out_flags.contains(Flags::MMAP) && self.out_flags.contains(Flags::SAME_FDS) {
            return Err(Error::Config(
                "oflag=mmap is incompatible with oflag=same_fds".into(),
            ));
        }

        if self.output_path.is_none() && !self.out_flags.contains(Flags::NULL) {
            self.out_flags |= Flags::NULL;
        }

        Ok(self)
    }

    /// Whether the destination is the Null backend (no `of=` given or
    /// `oflag=null` explicitly requested).
    pub fn output_is_null(&self) -> bool {
        self.output_path.is_none() || self.out_flags.contains(Flags::NULL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> (PathBuf, Option<PathBuf>) {
        (PathBuf::from("/dev/sg0"), Some(PathBuf::from("/dev/sg1")))
    }

    #[test]
    fn defaults_pick_small_bpt_for_small_bs() {
        let (i, o) = base();
        let c = Config::build(
            i, o, None, None, None, None, None, 0, 0, None, None,
            Flags::empty(), Flags::empty(), false, None, 0, false,
        )
        .unwrap();
        assert_eq!(c.block_size, 512);
        assert_eq!(c.bpt, DEFAULT_BPT_SMALL_BS);
    }

    #[test]
    fn defaults_pick_large_bpt_for_large_bs() {
        let (i, o) = base();
        let c = Config::build(
            i, o, None, None, Some(4096), None, None, 0, 0, None, None,
            Flags::empty(), Flags::empty(), false, None, 0, false,
        )
        .unwrap();
        assert_eq!(c.bpt, DEFAULT_BPT_LARGE_BS);
    }

    #[test]
    fn missing_output_defaults_to_null() {
        let (i, _) = base();
        let c = Config::build(
            i, None, None, None, None, None, None, 0, 0, None, None,
            Flags::empty(), Flags::empty(), false, None, 0, false,
        )
        .unwrap();
        assert!(c.output_is_null());
    }

    #[test]
    fn mmap_and_same_fds_conflict_rejected() {
        let (i, o) = base();
        let err = Config::build(
            i, o, None, None, None, None, None, 0, 0, None, None,
            Flags::MMAP | Flags::SAME_FDS, Flags::empty(), false, None, 0, false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn thread_count_clamped_to_max() {
        let (i, o) = base();
        let c = Config::build(
            i, o, None, None, None, None, None, 0, 0, None, Some(64),
            Flags::empty(), Flags::empty(), false, None, 0, false,
        )
        .unwrap();
        assert_eq!(c.threads, MAX_THREADS);
    }

    #[test]
    fn cdbsz_promotes_for_large_total() {
        let (i, o) = base();
        let c = Config::build(
            i, o, None, None, None, None, Some(1u64 << 40), 0, 0, Some(10), None,
            Flags::empty(), Flags::empty(), false, None, 0, false,
        )
        .unwrap();
        assert_eq!(c.cdbsz, 16);
    }
}
