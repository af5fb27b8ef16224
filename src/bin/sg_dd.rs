//! Demo CLI front-end: accepts `dd`-style `name=value` operands and drives
//! [`sg_dd::run`]. Argument parsing is spec.md §1's "external
//! collaborator" surface, so only a thin operand splitter lives here;
//! `clap` is used for the handful of conventional `--help`/`--version`
//! affordances wrapped around it, the way the corpus's other CLI demos
//! (e.g. a clap-derive front end over a library crate) keep the library
//! oblivious to argv.

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;

use sg_dd::{config::Config, state::Flags};

/// SCSI-aware, multi-threaded block copier (`dd`-style operands).
#[derive(Parser, Debug)]
#[command(name = "sg-dd", version, about)]
struct Cli {
    /// `name=value` operands: if=, of=, of2=, ofreg=, bs=, bpt=, count=,
    /// skip=, seek=, cdbsz=, thr=, iflag=, oflag=, ae=, elemsz=, deb=,
    /// dry_run=.
    operands: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match parse_operands(&cli.operands) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("sg-dd: {e}");
            return ExitCode::from(1);
        },
    };

    sg_dd::telemetry::init(cfg.deb);

    match sg_dd::run(cfg) {
        Ok(stats) => {
            eprintln!(
                "{}+{} records in\n{}+{} records out\n{} residual blocks, {} dio incomplete",
                stats.in_full,
                stats.in_partial,
                stats.out_full,
                stats.out_partial,
                stats.residual_blocks,
                stats.dio_incomplete,
            );
            ExitCode::from(stats.exit.code() as u8)
        },
        Err(e) => {
            eprintln!("sg-dd: {e}");
            ExitCode::from(sg_dd::ExitCategory::from(&e).code() as u8)
        },
    }
}

fn parse_operands(operands: &[String]) -> sg_dd::Result<Config> {
    let mut input_path = None;
    let mut output_path = None;
    let mut output2_path = None;
    let mut outreg_path = None;
    let mut block_size = None;
    let mut bpt = None;
    let mut total_blocks = None;
    let mut skip = 0u64;
    let mut seek = 0u64;
    let mut cdbsz = None;
    let mut threads = None;
    let mut in_flags = Flags::empty();
    let mut out_flags = Flags::empty();
    let mut ae = false;
    let mut elemsz_kb = None;
    let mut deb = 0u8;
    let mut dry_run = false;

    for op in operands {
        let Some((key, value)) = op.split_once('=') else {
            return Err(sg_dd::Error::Config(format!(
                "operand '{op}' is not in name=value form"
            )));
        };

        match key {
            "if" => input_path = Some(PathBuf::from(value)),
            "of" => output_path = Some(PathBuf::from(value)),
            "of2" => output2_path = Some(PathBuf::from(value)),
            "ofreg" => outreg_path = Some(PathBuf::from(value)),
            "bs" => block_size = Some(parse_num(key, value)?),
            "bpt" => bpt = Some(parse_num(key, value)?),
            "count" => total_blocks = parse_count(key, value)?,
            "skip" => skip = parse_num64(key, value)?,
            "seek" => seek = parse_num64(key, value)?,
            "cdbsz" => cdbsz = Some(parse_num::<u8>(key, value)?),
            "thr" => threads = Some(parse_num(key, value)?),
            "iflag" => in_flags = Flags::from_csv(value)?,
            "oflag" => out_flags = Flags::from_csv(value)?,
            "ae" => ae = parse_bool(value),
            "elemsz" => elemsz_kb = Some(parse_num(key, value)?),
            "deb" | "verbose" => deb = parse_num(key, value)?,
            "dry_run" => dry_run = parse_bool(value),
            other => {
                return Err(sg_dd::Error::Config(format!("unknown operand '{other}'")))
            },
        }
    }

    let input_path = input_path
        .ok_or_else(|| sg_dd::Error::Config("if= is required".into()))?;

    Config::build(
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
    )
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> sg_dd::Result<T> {
    value
        .parse()
        .map_err(|_| sg_dd::Error::Config(format!("{key}={value} is not a valid number")))
}

fn parse_num64(key: &str, value: &str) -> sg_dd::Result<u64> {
    parse_num(key, value)
}

/// Parses `count=`, which spec.md §6 gives a sentinel meaning alongside its
/// ordinary numeric one: the literal value `-1` requests "discover" mode
/// (spec.md §4.4's `total == -1`, surfaced here as `None`) rather than a
/// fixed block count. Any other negative value is rejected; `u64::parse`
/// would already reject it, but parsing as `i64` first lets us recognize
/// `-1` before that rejection happens.
fn parse_count(key: &str, value: &str) -> sg_dd::Result<Option<u64>> {
    if let Ok(signed) = value.parse::<i64>() {
        if signed == -1 {
            return Ok(None);
        }
        if signed < 0 {
            return Err(sg_dd::Error::Config(format!(
                "{key}={value} must be -1 (discover) or a non-negative count"
            )));
        }
    }
    Ok(Some(parse_num64(key, value)?))
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_minus_one_means_discover() {
        assert_eq!(parse_count("count", "-1").unwrap(), None);
    }

    #[test]
    fn count_rejects_other_negatives() {
        assert!(parse_count("count", "-2").is_err());
    }

    #[test]
    fn count_parses_ordinary_value() {
        assert_eq!(parse_count("count", "42").unwrap(), Some(42));
    }

    #[test]
    fn of2_and_ofreg_operands_are_recognized() {
        let cfg = parse_operands(&[
            "if=/tmp/in".into(),
            "of=/tmp/out".into(),
            "of2=/tmp/out2".into(),
            "ofreg=/tmp/reg".into(),
        ])
        .unwrap();
        assert_eq!(cfg.output2_path, Some(PathBuf::from("/tmp/out2")));
        assert_eq!(cfg.outreg_path, Some(PathBuf::from("/tmp/reg")));
    }
}
