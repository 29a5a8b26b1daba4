#![forbid(unsafe_code)]

//! Fixed-size worker pool and the chunked map / for-each / reduce primitives
//! that bulk column operations are built on.
//!
//! The pool is an explicit value: construct one with [`WorkerPool::new`],
//! submit closures, [`WorkerPool::wait`] for them, then [`WorkerPool::close`].
//! [`global_pool`] is a process-wide convenience instance built from
//! [`PoolConfig::default`].

use std::cell::Cell;
use std::fmt;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use gf_types::ErrorKind;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Row count below which [`ExecutionOptions`] keeps work on the caller thread.
pub const DEFAULT_MIN_PARALLEL_ROWS: usize = 32_768;

const QUEUE_SLOTS_PER_WORKER: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// True when the current thread is a pool worker. Nested parallel calls made
/// from inside a task run inline so a saturated pool cannot deadlock on itself.
#[must_use]
pub fn in_worker() -> bool {
    IN_WORKER.with(Cell::get)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("invalid pool configuration: {field} {reason}")]
    InvalidConfig { field: &'static str, reason: String },
    #[error("worker pool is closed")]
    PoolClosed,
    #[error("failed to spawn worker thread: {reason}")]
    Spawn { reason: String },
    #[error("chunk {chunk} of {chunks} did not complete (task panicked or was abandoned)")]
    ChunkLost { chunk: usize, chunks: usize },
}

impl RuntimeError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig { .. } => ErrorKind::InvalidArgument,
            Self::PoolClosed | Self::Spawn { .. } | Self::ChunkLost { .. } => ErrorKind::Runtime,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of long-lived worker threads. Defaults to the available cores.
    pub workers: usize,
    /// Bounded task queue length; `submit` blocks while the queue is full.
    pub queue_capacity: usize,
    /// Thread name prefix; workers are named `{thread_name}-{idx}`.
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = num_cpus::get().max(1);
        Self {
            workers,
            queue_capacity: workers * QUEUE_SLOTS_PER_WORKER,
            thread_name: "gf-worker".to_owned(),
        }
    }
}

impl PoolConfig {
    /// Config with `workers` threads and the matching default queue size.
    #[must_use]
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            queue_capacity: workers.max(1) * QUEUE_SLOTS_PER_WORKER,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    #[must_use]
    pub fn thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.workers == 0 {
            return Err(RuntimeError::InvalidConfig {
                field: "workers",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(RuntimeError::InvalidConfig {
                field: "queue_capacity",
                reason: "must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}

/// Counting barrier: `add` before handing out work, `done` when a unit
/// finishes, `wait` blocks until the count drops back to zero.
#[derive(Debug, Default)]
pub struct WaitGroup {
    pending: Mutex<usize>,
    idle: Condvar,
}

impl WaitGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        *self.pending.lock() += n;
    }

    pub fn done(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.idle.wait(&mut pending);
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        *self.pending.lock()
    }
}

#[derive(Debug, Default)]
struct Shared {
    closed: AtomicBool,
    in_flight: WaitGroup,
    abandoned: AtomicUsize,
    panicked: AtomicUsize,
}

/// Decrements the in-flight count even when a task unwinds.
struct DoneGuard<'a>(&'a WaitGroup);

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.0.done();
    }
}

pub struct WorkerPool {
    config: PoolConfig,
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.config.workers)
            .field("queue_capacity", &self.config.queue_capacity)
            .field("closed", &self.is_closed())
            .field("pending", &self.shared.in_flight.pending())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        let (sender, receiver) = bounded::<Job>(config.queue_capacity);
        let shared = Arc::new(Shared::default());
        let mut handles = Vec::with_capacity(config.workers);

        for idx in 0..config.workers {
            let receiver = receiver.clone();
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-{idx}", config.thread_name))
                .spawn(move || run_worker(idx, &receiver, &shared));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Disconnect the queue so already-started workers exit.
                    drop(sender);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(RuntimeError::Spawn {
                        reason: err.to_string(),
                    });
                }
            }
        }

        debug!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "worker pool started"
        );

        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            shared,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.config.workers
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of tasks that unwound since the pool started.
    #[must_use]
    pub fn panicked_tasks(&self) -> usize {
        self.shared.panicked.load(Ordering::Relaxed)
    }

    /// Enqueue a task. Blocks only while the bounded queue is full.
    pub fn submit<F>(&self, task: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return Err(RuntimeError::PoolClosed);
        }
        // Clone out of the lock so a full queue never blocks `close`.
        let sender = self
            .sender
            .lock()
            .as_ref()
            .cloned()
            .ok_or(RuntimeError::PoolClosed)?;

        self.shared.in_flight.add(1);
        if sender.send(Box::new(task)).is_err() {
            self.shared.in_flight.done();
            return Err(RuntimeError::PoolClosed);
        }
        Ok(())
    }

    /// Block until every previously submitted task has finished or been abandoned.
    pub fn wait(&self) {
        self.shared.in_flight.wait();
    }

    /// Stop accepting work and shut the workers down.
    ///
    /// Tasks still queued when this is called are dropped without running;
    /// call [`WorkerPool::wait`] first when their completion matters. Returns
    /// the number of tasks abandoned over the pool's lifetime.
    pub fn close(&self) -> usize {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return self.shared.abandoned.load(Ordering::Relaxed);
        }
        drop(self.sender.lock().take());

        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("worker thread exited abnormally");
            }
        }

        let abandoned = self.shared.abandoned.load(Ordering::Relaxed);
        debug!(abandoned, "worker pool closed");
        abandoned
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker(idx: usize, receiver: &Receiver<Job>, shared: &Shared) {
    IN_WORKER.with(|flag| flag.set(true));
    debug!(worker = idx, "worker started");

    while let Ok(job) = receiver.recv() {
        let _done = DoneGuard(&shared.in_flight);
        if shared.closed.load(Ordering::Acquire) {
            shared.abandoned.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
            warn!(worker = idx, "task panicked");
        }
    }

    debug!(worker = idx, "worker stopped");
}

static GLOBAL_POOL: OnceLock<Result<WorkerPool, RuntimeError>> = OnceLock::new();

/// Process-wide pool built lazily from [`PoolConfig::default`].
pub fn global_pool() -> Result<&'static WorkerPool, RuntimeError> {
    GLOBAL_POOL
        .get_or_init(|| WorkerPool::new(PoolConfig::default()))
        .as_ref()
        .map_err(Clone::clone)
}

/// Split `0..len` into at most `workers` contiguous ranges of
/// `ceil(len / workers)` elements each.
#[must_use]
pub fn chunk_ranges(len: usize, workers: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let chunk = len.div_ceil(workers.max(1));
    (0..len)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(len))
        .collect()
}

/// Run `chunk_fn` once per range on the pool and return the outputs in range
/// order. Returns only after every submitted chunk has finished.
fn run_chunks<T, C>(
    pool: &WorkerPool,
    ranges: Vec<Range<usize>>,
    chunk_fn: C,
) -> Result<Vec<T>, RuntimeError>
where
    T: Send + 'static,
    C: Fn(Range<usize>) -> T + Send + Sync + 'static,
{
    let chunks = ranges.len();
    if chunks <= 1 || in_worker() {
        return Ok(ranges.into_iter().map(chunk_fn).collect());
    }

    trace!(chunks, "dispatching parallel chunks");
    let chunk_fn = Arc::new(chunk_fn);
    let (tx, rx) = bounded::<(usize, T)>(chunks);
    let mut submit_error = None;

    for (slot, range) in ranges.into_iter().enumerate() {
        let tx = tx.clone();
        let chunk_fn = Arc::clone(&chunk_fn);
        let submitted = pool.submit(move || {
            let out = (*chunk_fn)(range);
            let _ = tx.send((slot, out));
        });
        if let Err(err) = submitted {
            submit_error = Some(err);
            break;
        }
    }
    drop(tx);

    let mut parts: Vec<Option<T>> = (0..chunks).map(|_| None).collect();
    // Drain until every task has either reported or dropped its sender.
    while let Ok((slot, out)) = rx.recv() {
        parts[slot] = Some(out);
    }

    if let Some(err) = submit_error {
        return Err(err);
    }
    parts
        .into_iter()
        .enumerate()
        .map(|(chunk, part)| part.ok_or(RuntimeError::ChunkLost { chunk, chunks }))
        .collect()
}

/// Apply `f` to every position in `0..len`; output position `i` holds `f(i)`.
pub fn parallel_map<R, F>(pool: &WorkerPool, len: usize, f: F) -> Result<Vec<R>, RuntimeError>
where
    R: Send + 'static,
    F: Fn(usize) -> R + Send + Sync + 'static,
{
    let ranges = chunk_ranges(len, pool.workers());
    let parts = run_chunks(pool, ranges, move |range| range.map(&f).collect::<Vec<R>>())?;
    let mut out = Vec::with_capacity(len);
    for part in parts {
        out.extend(part);
    }
    Ok(out)
}

/// [`parallel_map`] over a shared slice.
pub fn parallel_map_slice<T, R, F>(
    pool: &WorkerPool,
    items: Arc<[T]>,
    f: F,
) -> Result<Vec<R>, RuntimeError>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(&T) -> R + Send + Sync + 'static,
{
    let len = items.len();
    parallel_map(pool, len, move |idx| f(&items[idx]))
}

pub fn parallel_for_each<F>(pool: &WorkerPool, len: usize, f: F) -> Result<(), RuntimeError>
where
    F: Fn(usize) + Send + Sync + 'static,
{
    let ranges = chunk_ranges(len, pool.workers());
    run_chunks(pool, ranges, move |range| range.for_each(&f))?;
    Ok(())
}

/// Fold each chunk from a copy of `init`, then combine the partials left to
/// right in chunk order.
///
/// `fold`/`combine` must be associative with `init` as identity: chunk
/// boundaries depend on the worker count.
pub fn parallel_reduce<A, Fo, Co>(
    pool: &WorkerPool,
    len: usize,
    init: A,
    fold: Fo,
    combine: Co,
) -> Result<A, RuntimeError>
where
    A: Clone + Send + Sync + 'static,
    Fo: Fn(A, usize) -> A + Send + Sync + 'static,
    Co: Fn(A, A) -> A,
{
    let ranges = chunk_ranges(len, pool.workers());
    let seed = init.clone();
    let partials = run_chunks(pool, ranges, move |range| range.fold(seed.clone(), &fold))?;
    Ok(partials.into_iter().fold(init, combine))
}

/// Per-call execution settings for bulk column operations.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Pool to run on; `None` uses [`global_pool`].
    pub pool: Option<Arc<WorkerPool>>,
    /// Inputs shorter than this run inline on the caller thread.
    pub min_parallel_rows: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            pool: None,
            min_parallel_rows: DEFAULT_MIN_PARALLEL_ROWS,
        }
    }
}

impl ExecutionOptions {
    /// Never leaves the caller thread.
    #[must_use]
    pub fn sequential() -> Self {
        Self {
            pool: None,
            min_parallel_rows: usize::MAX,
        }
    }

    #[must_use]
    pub fn with_pool(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool: Some(pool),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn min_parallel_rows(mut self, rows: usize) -> Self {
        self.min_parallel_rows = rows;
        self
    }

    pub fn pool(&self) -> Result<&WorkerPool, RuntimeError> {
        match self.pool.as_deref() {
            Some(pool) => Ok(pool),
            None => global_pool(),
        }
    }

    /// Pool to use for `rows` items, or `None` when the work stays inline.
    pub fn pool_for(&self, rows: usize) -> Result<Option<&WorkerPool>, RuntimeError> {
        if rows < self.min_parallel_rows.max(2) || in_worker() {
            return Ok(None);
        }
        let pool = self.pool()?;
        Ok((pool.workers() > 1).then_some(pool))
    }

    pub fn map<R, F>(&self, len: usize, f: F) -> Result<Vec<R>, RuntimeError>
    where
        R: Send + 'static,
        F: Fn(usize) -> R + Send + Sync + 'static,
    {
        match self.pool_for(len)? {
            Some(pool) => parallel_map(pool, len, f),
            None => Ok((0..len).map(f).collect()),
        }
    }

    pub fn for_each<F>(&self, len: usize, f: F) -> Result<(), RuntimeError>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        match self.pool_for(len)? {
            Some(pool) => parallel_for_each(pool, len, f),
            None => {
                (0..len).for_each(f);
                Ok(())
            }
        }
    }

    pub fn reduce<A, Fo, Co>(&self, len: usize, init: A, fold: Fo, combine: Co) -> Result<A, RuntimeError>
    where
        A: Clone + Send + Sync + 'static,
        Fo: Fn(A, usize) -> A + Send + Sync + 'static,
        Co: Fn(A, A) -> A,
    {
        match self.pool_for(len)? {
            Some(pool) => parallel_reduce(pool, len, init, fold, combine),
            None => Ok((0..len).fold(init, fold)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crossbeam_channel::bounded;
    use gf_types::ErrorKind;

    use super::{
        ExecutionOptions, PoolConfig, RuntimeError, WaitGroup, WorkerPool, chunk_ranges,
        parallel_for_each, parallel_map, parallel_map_slice, parallel_reduce,
    };

    fn pool(workers: usize) -> WorkerPool {
        WorkerPool::new(PoolConfig::with_workers(workers)).expect("pool should start")
    }

    #[test]
    fn chunk_ranges_use_ceiling_chunk_size() {
        assert_eq!(chunk_ranges(10, 3), vec![0..4, 4..8, 8..10]);
        assert_eq!(chunk_ranges(2, 8), vec![0..1, 1..2]);
        assert_eq!(chunk_ranges(5, 1), vec![0..5]);
        assert!(chunk_ranges(0, 4).is_empty());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = WorkerPool::new(PoolConfig::with_workers(0)).expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = PoolConfig::with_workers(2)
            .queue_capacity(0)
            .validate()
            .expect_err("must fail");
        assert!(matches!(err, RuntimeError::InvalidConfig { field: "queue_capacity", .. }));
    }

    #[test]
    fn submit_then_wait_runs_every_task() {
        let pool = pool(3);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit");
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn submit_after_close_fails() {
        let pool = pool(2);
        pool.close();
        let err = pool.submit(|| {}).expect_err("closed");
        assert_eq!(err, RuntimeError::PoolClosed);
    }

    #[test]
    fn close_abandons_queued_tasks() {
        let pool = Arc::new(pool(1));
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);
        let ran = Arc::new(AtomicUsize::new(0));

        pool.submit(move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
        })
        .expect("gate task");
        started_rx.recv().expect("gate task started");
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            pool.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .expect("queued task");
        }

        let closer = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.close())
        };
        while !pool.is_closed() {
            std::thread::yield_now();
        }
        gate_tx.send(()).expect("release gate");
        let abandoned = closer.join().expect("closer thread");

        assert_eq!(abandoned, 3);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        pool.wait();
    }

    #[test]
    fn map_is_identical_across_worker_counts() {
        let expected: Vec<u64> = (0..10_001_u64).map(|i| i * i).collect();
        for workers in [1, 2, 7] {
            let pool = pool(workers);
            let out = parallel_map(&pool, expected.len(), |i| (i as u64) * (i as u64))
                .expect("map");
            assert_eq!(out, expected, "workers={workers}");
        }
    }

    #[test]
    fn reduce_is_identical_across_worker_counts() {
        let values: Arc<[i64]> = (1..=5_000).collect::<Vec<i64>>().into();
        for workers in [1, 2, 8] {
            let pool = pool(workers);
            let data = Arc::clone(&values);
            let total = parallel_reduce(&pool, values.len(), 0_i64, move |acc, i| acc + data[i], |a, b| a + b)
                .expect("reduce");
            assert_eq!(total, 5_000 * 5_001 / 2, "workers={workers}");
        }
    }

    #[test]
    fn map_slice_preserves_positions() {
        let pool = pool(4);
        let words: Arc<[String]> = vec!["a".to_owned(), "bb".to_owned(), "ccc".to_owned()].into();
        let lens = parallel_map_slice(&pool, words, |w| w.len()).expect("map");
        assert_eq!(lens, vec![1, 2, 3]);
    }

    #[test]
    fn for_each_visits_every_position_once() {
        let pool = pool(4);
        let hits = Arc::new((0..1_000).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
        let seen = Arc::clone(&hits);
        parallel_for_each(&pool, 1_000, move |i| {
            seen[i].fetch_add(1, Ordering::SeqCst);
        })
        .expect("for_each");
        assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn panicking_chunk_is_reported_and_pool_survives() {
        let pool = pool(2);
        let err = parallel_map(&pool, 10, |i| {
            assert!(i != 7, "boom");
            i
        })
        .expect_err("chunk should be lost");
        assert!(matches!(err, RuntimeError::ChunkLost { chunk: 1, chunks: 2 }));
        assert_eq!(pool.panicked_tasks(), 1);

        let out = parallel_map(&pool, 4, |i| i + 1).expect("pool still usable");
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn nested_parallel_calls_run_inline() {
        let pool = Arc::new(pool(2));
        let inner = Arc::clone(&pool);
        let out = parallel_map(&pool, 4, move |i| {
            parallel_map(&inner, 3, move |j| i * 10 + j)
                .expect("inner map")
                .into_iter()
                .sum::<usize>()
        })
        .expect("outer map");
        assert_eq!(out, vec![3, 33, 63, 93]);
    }

    #[test]
    fn wait_group_counts_down() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(2);
        let a = Arc::clone(&wg);
        let handle = std::thread::spawn(move || {
            a.done();
            a.done();
        });
        wg.wait();
        handle.join().expect("thread");
        assert_eq!(wg.pending(), 0);
    }

    #[test]
    fn execution_options_stay_inline_below_threshold() {
        let options = ExecutionOptions::with_pool(Arc::new(pool(4))).min_parallel_rows(100);
        assert!(options.pool_for(99).expect("pool").is_none());
        assert!(options.pool_for(100).expect("pool").is_some());
        assert!(ExecutionOptions::sequential().pool_for(1_000_000).expect("pool").is_none());

        let squares = options.map(200, |i| i * i).expect("map");
        assert_eq!(squares[199], 199 * 199);
        let sum = options
            .reduce(200, 0_usize, |acc, i| acc + i, |a, b| a + b)
            .expect("reduce");
        assert_eq!(sum, 199 * 200 / 2);
    }
}
