//! Stage 3: progressive content verification.
//!
//! # Overview
//!
//! For every candidate group the verifier confirms which sibling groups are
//! byte-for-byte identical by hashing file content in stages (head probe,
//! tail probe, then large chunks), splitting groups whenever hashes diverge
//! and discarding sub-groups that fall below two members. Non-duplicates
//! are eliminated after at most two small reads; confirmed duplicates have
//! every byte read exactly once.
//!
//! # Sibling Group Optimization
//!
//! Paths in one sibling group are hardlinks: identical content by
//! definition. Only the lexicographically first path of each group is
//! hashed; the rest ride along with its result.
//!
//! # Concurrency Model
//!
//! - A fixed pool of `workers` threads consumes jobs (a candidate group
//!   plus one byte range) from a shared queue.
//! - Each job fans out one scoped task per sibling group, gated by a
//!   counting semaphore of capacity `workers` that bounds open descriptors
//!   and outstanding reads. All hashes for a range complete before the
//!   group is partitioned and the next range dispatched.
//! - A pending-work counter (initial groups plus every requeued follow-up)
//!   closes the job queue when it reaches zero; worker exit closes the
//!   results channel, which the calling thread drains.
//!
//! The *set* of emitted duplicate groups is deterministic, but emission
//! order depends on scheduling; the result is re-sorted before return.

pub mod hash;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use anyhow::anyhow;
use bytesize::ByteSize;

use crate::cache::Cache;
use crate::errors::ErrorSink;
use crate::progress::Bar;
use crate::types::{
    new_candidate_group, new_duplicate_group, new_duplicate_groups, CandidateGroup,
    CandidateGroups, DuplicateGroup, DuplicateGroups, Semaphore, SiblingGroup,
};

use self::hash::hash_range;

/// Size of the head and tail probes (1 MiB).
const PROBE_SIZE: u64 = 1 << 20;

/// Chunk size for hashing file middles (1 GiB).
const CHUNK_SIZE: u64 = 1 << 30;

/// Buffered capacity of the results channel.
const RESULTS_BUFFER: usize = 100;

/// A unit of verification work: sibling groups to hash at one byte range.
#[derive(Debug, Clone)]
struct Job {
    siblings: CandidateGroup,
    start: u64,
    size: u64,
    /// Cumulative bytes hashed per file including this job.
    total_bytes: u64,
}

/// First range for a candidate group: the head probe, or the entire file
/// when it fits inside one probe.
fn initial_job(siblings: CandidateGroup) -> Job {
    let file_size = siblings.first().first().size;
    let size = PROBE_SIZE.min(file_size);
    Job {
        siblings,
        start: 0,
        size,
        total_bytes: size,
    }
}

/// Outcome of advancing the verification state machine by one range.
#[derive(Debug)]
enum NextStep {
    /// Every byte of the file has been hashed; the group is confirmed.
    Done(CandidateGroup),
    /// More ranges remain; requeue this job.
    Continue(Job),
}

/// Advance the schedule past `prev` for the surviving `siblings`.
///
/// The schedule never reads the same byte twice:
///
/// - `DONE`: cumulative bytes equal the file size.
/// - `AFTER_HEAD`: medium files get the non-overlapping remainder, large
///   files get the tail probe.
/// - `IN_CHUNKS`: successive chunks cover the span between the probes.
fn next_job(prev: &Job, siblings: CandidateGroup) -> NextStep {
    let file_size = siblings.first().first().size;

    if prev.total_bytes == file_size {
        return NextStep::Done(siblings);
    }

    if prev.total_bytes == PROBE_SIZE {
        let remaining = file_size - PROBE_SIZE;
        let size = PROBE_SIZE.min(remaining);
        let start = PROBE_SIZE.max(remaining);
        return NextStep::Continue(Job {
            siblings,
            start,
            size,
            total_bytes: PROBE_SIZE + size,
        });
    }

    let start = prev.total_bytes - PROBE_SIZE;
    let size = CHUNK_SIZE.min(file_size - prev.total_bytes);
    NextStep::Continue(Job {
        siblings,
        start,
        size,
        total_bytes: prev.total_bytes + size,
    })
}

/// Verification progress counters.
struct VerifyStats {
    total_candidate_bytes: u64,
    verified_bytes: AtomicU64,
    skipped_bytes: AtomicU64,
    cached_bytes: AtomicU64,
    confirmed_candidates: AtomicU64,
    confirmed_bytes: AtomicU64,
    confirmed_sets: AtomicU64,
    start: Instant,
}

impl VerifyStats {
    fn new(total_candidate_bytes: u64) -> Self {
        Self {
            total_candidate_bytes,
            verified_bytes: AtomicU64::new(0),
            skipped_bytes: AtomicU64::new(0),
            cached_bytes: AtomicU64::new(0),
            confirmed_candidates: AtomicU64::new(0),
            confirmed_bytes: AtomicU64::new(0),
            confirmed_sets: AtomicU64::new(0),
            start: Instant::now(),
        }
    }
}

impl fmt::Display for VerifyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verified = self.verified_bytes.load(Ordering::Relaxed);
        let skipped = self.skipped_bytes.load(Ordering::Relaxed);
        let cached = self.cached_bytes.load(Ordering::Relaxed);
        let done = verified + skipped + cached;
        let pct = if self.total_candidate_bytes > 0 {
            done as f64 / self.total_candidate_bytes as f64 * 100.0
        } else {
            0.0
        };
        let fmt_bytes = |n: u64| ByteSize::b(n).to_string_as(true);

        if cached > 0 {
            write!(
                f,
                "Verified {} + cached {} + skipped {} out of {} ({pct:.0}%), \
                 confirmed {} duplicates ({}) in {} sets in {:.1}s",
                fmt_bytes(verified),
                fmt_bytes(cached),
                fmt_bytes(skipped),
                fmt_bytes(self.total_candidate_bytes),
                self.confirmed_candidates.load(Ordering::Relaxed),
                fmt_bytes(self.confirmed_bytes.load(Ordering::Relaxed)),
                self.confirmed_sets.load(Ordering::Relaxed),
                self.start.elapsed().as_secs_f64(),
            )
        } else {
            write!(
                f,
                "Verified {} + skipped {} out of {} ({pct:.0}%), \
                 confirmed {} duplicates ({}) in {} sets in {:.1}s",
                fmt_bytes(verified),
                fmt_bytes(skipped),
                fmt_bytes(self.total_candidate_bytes),
                self.confirmed_candidates.load(Ordering::Relaxed),
                fmt_bytes(self.confirmed_bytes.load(Ordering::Relaxed)),
                self.confirmed_sets.load(Ordering::Relaxed),
                self.start.elapsed().as_secs_f64(),
            )
        }
    }
}

/// Job queue shared by the worker pool.
///
/// The pending counter tracks every queued job, initial and requeued; when
/// it reaches zero the sender is dropped, the channel disconnects, and
/// workers drain out.
struct JobQueue {
    tx: Mutex<Option<Sender<Job>>>,
    rx: Mutex<Receiver<Job>>,
    pending: AtomicUsize,
}

impl JobQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
        }
    }

    /// Account for `n` jobs that will be pushed. Must happen before the
    /// matching [`JobQueue::push`] so the queue cannot close in between.
    fn add_pending(&self, n: usize) {
        self.pending.fetch_add(n, Ordering::SeqCst);
    }

    fn push(&self, job: Job) {
        if let Some(tx) = &*self.tx.lock().unwrap() {
            let _ = tx.send(job);
        }
    }

    /// Blocks for the next job; `None` once the queue is closed and empty.
    fn pop(&self) -> Option<Job> {
        self.rx.lock().unwrap().recv().ok()
    }

    fn job_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tx.lock().unwrap().take();
        }
    }
}

/// Shared state for verifier workers.
struct VerifyState {
    queue: JobQueue,
    sem: Semaphore,
    cache: Arc<Cache>,
    errors: ErrorSink,
    stats: VerifyStats,
    bar: Bar,
    shutdown: Option<Arc<AtomicBool>>,
}

impl VerifyState {
    fn is_shutdown(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }
}

/// Confirms duplicates among candidate groups using progressive hashing.
///
/// Single-use: create with [`Verifier::new`], call [`Verifier::run`] once.
pub struct Verifier {
    groups: CandidateGroups,
    workers: usize,
    show_progress: bool,
    errors: ErrorSink,
    cache: Arc<Cache>,
    shutdown: Option<Arc<AtomicBool>>,
}

impl Verifier {
    /// Create a verifier over the screener output.
    ///
    /// Use `Cache::open(None)` for a disabled cache.
    #[must_use]
    pub fn new(
        groups: CandidateGroups,
        workers: usize,
        show_progress: bool,
        errors: ErrorSink,
        cache: Arc<Cache>,
    ) -> Self {
        Self {
            groups,
            workers,
            show_progress,
            errors,
            cache,
            shutdown: None,
        }
    }

    /// Set a shutdown flag checked at every read-buffer boundary.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Execute verification and return the confirmed duplicate groups,
    /// sorted by their first path.
    pub fn run(self) -> DuplicateGroups {
        if self.groups.is_empty() {
            return new_duplicate_groups(Vec::new());
        }

        let total_candidate_bytes: u64 = self
            .groups
            .iter()
            .map(|cg| cg.first().first().size * cg.len() as u64)
            .sum();

        let state = Arc::new(VerifyState {
            queue: JobQueue::new(),
            sem: Semaphore::new(self.workers),
            cache: self.cache,
            errors: self.errors,
            stats: VerifyStats::new(total_candidate_bytes),
            bar: Bar::spinner(self.show_progress),
            shutdown: self.shutdown,
        });
        state.bar.describe(&state.stats);

        // Account for all initial jobs before the first push so the queue
        // cannot close while seeding.
        state.queue.add_pending(self.groups.len());

        let (results_tx, results_rx) = mpsc::sync_channel(RESULTS_BUFFER);
        let handles: Vec<_> = (0..self.workers)
            .map(|_| {
                let state = Arc::clone(&state);
                let results_tx = results_tx.clone();
                thread::spawn(move || {
                    while let Some(job) = state.queue.pop() {
                        process_job(&state, job, &results_tx);
                    }
                })
            })
            .collect();
        drop(results_tx); // collector finishes once the workers exit

        for group in self.groups.iter() {
            state.queue.push(initial_job(group.clone()));
        }

        let mut duplicates = Vec::new();
        for group in results_rx {
            // Count only the files that will be replaced, not the kept one.
            let extra = group.len() as u64 - 1;
            state
                .stats
                .confirmed_candidates
                .fetch_add(extra, Ordering::Relaxed);
            state
                .stats
                .confirmed_bytes
                .fetch_add(group.first().first().size * extra, Ordering::Relaxed);
            state.stats.confirmed_sets.fetch_add(1, Ordering::Relaxed);
            state.bar.describe(&state.stats);
            duplicates.push(group);
        }

        for handle in handles {
            let _ = handle.join();
        }

        state.bar.finish(&state.stats);
        new_duplicate_groups(duplicates)
    }
}

/// Hash every sibling group in the job, split the survivors by digest, and
/// route each partition: done groups to the results channel, unfinished
/// ones back onto the queue, singletons dropped.
fn process_job(state: &VerifyState, job: Job, results: &SyncSender<DuplicateGroup>) {
    for (_, siblings) in hash_job(state, &job) {
        let candidate = new_candidate_group(siblings);
        if candidate.len() < 2 {
            // Eliminated early: credit the bytes we never had to read.
            let file_size = candidate.first().first().size;
            state
                .stats
                .skipped_bytes
                .fetch_add(file_size - job.total_bytes, Ordering::Relaxed);
            state.bar.describe(&state.stats);
            continue;
        }
        match next_job(&job, candidate) {
            NextStep::Done(confirmed) => {
                let _ = results.send(new_duplicate_group(confirmed.items().to_vec()));
            }
            NextStep::Continue(next) => {
                state.queue.add_pending(1);
                state.queue.push(next);
            }
        }
    }
    state.queue.job_done();
}

/// Hash one representative path per sibling group for the job's range,
/// consulting the cache first, and partition sibling groups by digest.
///
/// Groups whose representative cannot be read are dropped here (the error
/// is reported); conservatively, a file that cannot be fully hashed never
/// reaches a duplicate group.
fn hash_job(state: &VerifyState, job: &Job) -> HashMap<[u8; 32], Vec<SiblingGroup>> {
    let results = Mutex::new(Vec::with_capacity(job.siblings.len()));

    thread::scope(|scope| {
        for siblings in job.siblings.iter() {
            let results = &results;
            scope.spawn(move || {
                let _permit = state.sem.acquire();
                if state.is_shutdown() {
                    return;
                }

                // Only the first path is hashed; all siblings share the inode.
                let rep = siblings.first();

                match state.cache.lookup(rep, job.start, job.size) {
                    Ok(Some(cached)) => {
                        state.stats.cached_bytes.fetch_add(job.size, Ordering::Relaxed);
                        state.bar.describe(&state.stats);
                        results.lock().unwrap().push((cached, siblings.clone()));
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        // Cache trouble never blocks verification.
                        state
                            .errors
                            .report(anyhow!("cache lookup {}: {err}", rep.path.display()));
                    }
                }

                match hash_range(&rep.path, job.start, job.size, state.shutdown.as_deref()) {
                    Ok((digest, n)) => {
                        if let Err(err) = state.cache.store(rep, job.start, job.size, &digest) {
                            state
                                .errors
                                .report(anyhow!("cache store {}: {err}", rep.path.display()));
                        }
                        state.stats.verified_bytes.fetch_add(n, Ordering::Relaxed);
                        state.bar.describe(&state.stats);
                        results.lock().unwrap().push((digest, siblings.clone()));
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                        // Cancelled: partial hashes are discarded silently.
                    }
                    Err(err) => {
                        state
                            .errors
                            .report(anyhow!("{}: {err}", rep.path.display()));
                    }
                }
            });
        }
    });

    let mut by_hash: HashMap<[u8; 32], Vec<SiblingGroup>> = HashMap::new();
    for (digest, siblings) in results.into_inner().unwrap() {
        by_hash.entry(digest).or_default().push(siblings);
    }
    by_hash
}
