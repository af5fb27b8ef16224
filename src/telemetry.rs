//! Structured logging setup (ambient stack, SPEC_FULL.md §6), grounded on
//! `iscsi-client-rs/src/cfg/logger.rs` but trimmed down: no JSON
//! formatting and no file-rotation sink, since spec.md never calls for a
//! log file — only for the `deb=`/`verbose=` level spec.md's operands
//! already define.

use tracing_subscriber::{fmt, EnvFilter};

/// Numeric verbosity levels accepted by `deb=`/`verbose=` (spec.md §6),
/// mapped onto `tracing` levels.
pub fn level_from_deb(deb: u8) -> &'static str {
    match deb {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Installs the global subscriber. `deb` sets the default level;
/// `RUST_LOG`, if set, overrides it entirely (spec.md's ambient logging
/// stack should not fight an operator's explicit environment override).
pub fn init(deb: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_from_deb(deb)));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deb_levels_map_as_expected() {
        assert_eq!(level_from_deb(0), "warn");
        assert_eq!(level_from_deb(1), "info");
        assert_eq!(level_from_deb(2), "debug");
        assert_eq!(level_from_deb(9), "trace");
    }
}
