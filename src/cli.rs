//! Command-line interface definitions for dupedog.
//!
//! All arguments are defined with the clap derive API. Validation that can
//! fail (size strings, glob patterns, worker counts) happens here, before
//! any pipeline stage runs, so configuration errors exit nonzero without
//! touching the filesystem.
//!
//! # Example
//!
//! ```bash
//! # Deduplicate a directory, previewing first
//! dupedog dedupe --dry-run ~/archive
//!
//! # Skip small files and editor backups, keep a hash cache between runs
//! dupedog dedupe --min-size 4KiB --exclude '*~' --cache-file ~/.cache/dupedog.db ~/archive
//!
//! # Across two mounts, letting the second one hold symlinks
//! dupedog dedupe --symlink-fallback --trust-device-boundaries /primary /secondary
//! ```

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::thread;

use clap::{Args, Parser, Subcommand};
use glob::{Pattern, PatternError};

/// Find and deduplicate files.
#[derive(Debug, Parser)]
#[command(name = "dupedog")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan for duplicates and replace them with hardlinks
    Dedupe(DedupeArgs),
}

/// Arguments for the dedupe subcommand.
#[derive(Debug, Args)]
#[command(
    long_about = "Scans for duplicates and replaces them with hardlinks (or symlinks as fallback).

When using --symlink-fallback, path order determines which location keeps actual
data (symlink source) vs which become symlinks. For example:
  dupedog dedupe /primary /secondary --symlink-fallback
keeps files in /primary, with /secondary containing symlinks pointing to them.

Use --dry-run to preview without making changes."
)]
pub struct DedupeArgs {
    /// Directories to scan; order defines source priority
    #[arg(value_name = "PATH", num_args = 1.., required = true)]
    pub paths: Vec<PathBuf>,

    /// Minimum file size (e.g. 100, 1k, 10M, 1GiB)
    #[arg(
        short = 'm',
        long,
        value_name = "SIZE",
        default_value = "1",
        value_parser = parse_size
    )]
    pub min_size: u64,

    /// Glob patterns to exclude, matched against file and directory names
    #[arg(short = 'e', long = "exclude", value_name = "PATTERN")]
    pub excludes: Vec<String>,

    /// Number of parallel workers
    #[arg(
        short = 'w',
        long,
        value_name = "N",
        default_value_t = default_workers(),
        value_parser = parse_workers
    )]
    pub workers: usize,

    /// Preview changes without executing
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Print each replacement to stdout
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Disable progress output
    #[arg(long)]
    pub no_progress: bool,

    /// Path to the hash cache file (caching disabled when omitted)
    #[arg(long, value_name = "FILE")]
    pub cache_file: Option<PathBuf>,

    /// Fall back to relative symlinks when deduplicating across device boundaries
    #[arg(long)]
    pub symlink_fallback: bool,

    /// Assume devices have independent inode spaces. WARNING: unsafe if the
    /// same filesystem is mounted at multiple paths (e.g. NFS)
    #[arg(long)]
    pub trust_device_boundaries: bool,
}

/// Default worker count: one per available CPU.
#[must_use]
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn parse_workers(s: &str) -> Result<usize, String> {
    let n: usize = s
        .parse()
        .map_err(|_| format!("invalid worker count: '{s}'"))?;
    if n == 0 {
        return Err("worker count must be positive".to_string());
    }
    Ok(n)
}

/// Parse a human-readable size string into bytes.
///
/// SI suffixes (`k`, `M`, `G`, `T`, and their `B` forms) are 1000-based;
/// IEC suffixes (`KiB`, `MiB`, `GiB`, `TiB`) are 1024-based. Suffixes are
/// case-insensitive and bare numbers are bytes.
///
/// # Errors
///
/// Returns an error for empty input, malformed numbers, negative values,
/// unknown suffixes, and results that overflow `u64`.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("size cannot be empty".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => (&s[..idx], s[idx..].trim().to_uppercase()),
        None => (s, String::new()),
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number: '{num_str}'"))?;
    if num < 0.0 {
        return Err("size cannot be negative".to_string());
    }

    let multiplier: u64 = match suffix.as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1_000,
        "KIB" => 1_024,
        "MB" | "M" => 1_000_000,
        "MIB" => 1_048_576,
        "GB" | "G" => 1_000_000_000,
        "GIB" => 1_073_741_824,
        "TB" | "T" => 1_000_000_000_000,
        "TIB" => 1_099_511_627_776,
        _ => return Err(format!("unknown size suffix: '{suffix}'")),
    };

    let bytes = num * multiplier as f64;
    if bytes > u64::MAX as f64 {
        return Err(format!("size overflows: '{s}'"));
    }
    Ok(bytes as u64)
}

/// Compile exclude patterns, failing fast on the first invalid one.
///
/// # Errors
///
/// Returns the underlying [`PatternError`] for the first pattern that does
/// not parse.
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>, PatternError> {
    patterns.iter().map(|p| Pattern::new(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_size_bytes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1024B").unwrap(), 1024);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_size_si_is_1000_based() {
        assert_eq!(parse_size("1k").unwrap(), 1_000);
        assert_eq!(parse_size("1K").unwrap(), 1_000);
        assert_eq!(parse_size("1M").unwrap(), 1_000_000);
        assert_eq!(parse_size("1GB").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("1T").unwrap(), 1_000_000_000_000);
    }

    #[test]
    fn test_parse_size_iec_is_1024_based() {
        assert_eq!(parse_size("1KiB").unwrap(), 1_024);
        assert_eq!(parse_size("1kib").unwrap(), 1_024);
        assert_eq!(parse_size("1MiB").unwrap(), 1_048_576);
        assert_eq!(parse_size("1GiB").unwrap(), 1_073_741_824);
        assert_eq!(parse_size("1TiB").unwrap(), 1_099_511_627_776);
    }

    #[test]
    fn test_parse_size_fractional() {
        assert_eq!(parse_size("1.5M").unwrap(), 1_500_000);
        assert_eq!(parse_size("0.5GiB").unwrap(), 536_870_912);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("1XB").is_err());
        assert!(parse_size("-1M").is_err());
        assert!(parse_size("999999999999999999999T").is_err());
    }

    #[test]
    fn test_compile_patterns_validates() {
        assert!(compile_patterns(&["*.bak".to_string(), "cache-?".to_string()]).is_ok());
        assert!(compile_patterns(&["[".to_string()]).is_err());
    }

    #[test]
    fn test_dedupe_args_parse() {
        let cli = Cli::try_parse_from([
            "dupedog", "dedupe", "-m", "1KiB", "-e", "*.bak", "-w", "4", "-n", "-v", "/tmp",
        ])
        .unwrap();
        let Commands::Dedupe(args) = cli.command;
        assert_eq!(args.min_size, 1024);
        assert_eq!(args.excludes, vec!["*.bak".to_string()]);
        assert_eq!(args.workers, 4);
        assert!(args.dry_run);
        assert!(args.verbose);
        assert_eq!(args.paths, vec![PathBuf::from("/tmp")]);
    }

    #[test]
    fn test_dedupe_requires_a_path() {
        assert!(Cli::try_parse_from(["dupedog", "dedupe"]).is_err());
    }

    #[test]
    fn test_workers_must_be_positive() {
        assert!(Cli::try_parse_from(["dupedog", "dedupe", "-w", "0", "/tmp"]).is_err());
    }
}
