//! dupedog CLI entry point.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use dupedog::{
    cache::Cache,
    cli::{compile_patterns, Cli, Commands, DedupeArgs},
    deduper::{DedupeOptions, Deduper},
    errors, logging,
    scanner::Scanner,
    screener::Screener,
    signal,
    verifier::Verifier,
};

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Dedupe(args) => run_dedupe(args),
    };

    match result {
        Ok(interrupted) => {
            if interrupted {
                ExitCode::from(signal::EXIT_CODE_INTERRUPTED as u8)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Execute the pipeline: scan → screen → verify → dedupe.
///
/// Returns whether the run was interrupted. Configuration failures (bad
/// globs, unopenable cache) are fatal; per-file trouble flows through the
/// error sink and never affects the exit code.
fn run_dedupe(args: DedupeArgs) -> Result<bool> {
    let excludes = compile_patterns(&args.excludes).context("invalid --exclude")?;

    let handler = signal::install_handler();
    let show_progress = !args.no_progress;
    let (sink, drain) = errors::spawn_sink();

    let outcome = (|| -> Result<()> {
        // Phase 1: scan the filesystem.
        let files = Scanner::new(
            args.paths.clone(),
            args.min_size,
            excludes,
            args.workers,
            show_progress,
            sink.clone(),
        )
        .with_shutdown_flag(handler.flag())
        .run()?;
        if files.is_empty() || handler.is_shutdown_requested() {
            return Ok(());
        }

        // Phase 2: screen for candidates.
        let candidates = Screener::new(files, args.trust_device_boundaries, show_progress).run();
        if candidates.is_empty() {
            return Ok(());
        }

        // Phase 3: verify duplicates, with the cache if configured.
        let cache = Arc::new(Cache::open(args.cache_file.as_deref()).context("open cache")?);
        let duplicates = Verifier::new(
            candidates,
            args.workers,
            show_progress,
            sink.clone(),
            Arc::clone(&cache),
        )
        .with_shutdown_flag(handler.flag())
        .run();
        match Arc::try_unwrap(cache) {
            Ok(cache) => {
                if let Err(err) = cache.close() {
                    sink.report(anyhow!("close cache: {err}"));
                }
            }
            Err(_) => sink.report(anyhow!("cache still referenced at close")),
        }
        if handler.is_shutdown_requested() {
            return Ok(());
        }

        // Phase 4: replace duplicates; CLI path order defines source priority.
        Deduper::new(
            duplicates,
            args.paths.clone(),
            DedupeOptions {
                dry_run: args.dry_run,
                symlink_fallback: args.symlink_fallback,
                verbose: args.verbose,
            },
            show_progress,
            sink.clone(),
        )
        .with_shutdown_flag(handler.flag())
        .run();

        Ok(())
    })();

    // All sink clones are gone once the stages return; joining the drain
    // flushes any queued diagnostics before the summary exit.
    drop(sink);
    drain.join();

    outcome?;
    Ok(handler.is_shutdown_requested())
}
