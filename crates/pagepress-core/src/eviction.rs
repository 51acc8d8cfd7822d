//! The attack eviction set.
//!
//! A memory region the size of total system RAM that is walked page by page
//! to force the kernel's page replacement into evicting the target pages.
//! The walk periodically re-checks a caller-supplied stop condition, keeps
//! the working and suppress sets warm, and prefetches ahead of itself so
//! the pressure builds from efficient sequential I/O.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Instant;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::mapping::{Advice, FileMapping, create_random_file};
use crate::suppress::SuppressSet;
use crate::sys;
use crate::working::WorkingSetState;

/// Stop condition evaluated by the eviction driver. Returns `true` once the
/// targeted pages have left the page cache.
pub type StopFn = Arc<dyn Fn() -> Result<bool> + Send + Sync>;

/// Eviction-set configuration.
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Back the set with anonymous memory instead of a random file.
    pub use_anon_memory: bool,
    /// Touch pages through `pread` instead of dereferencing the mapping.
    pub use_file_api: bool,
    /// Path of the file-backed eviction set; created lazily, reused when
    /// already large enough.
    pub eviction_file_path: PathBuf,
    /// Evaluate the stop condition every this many accessed bytes. With a
    /// worker pool the period applies per worker.
    pub targets_check_stride: usize,
    /// Touch the working set every this many accessed bytes (0 disables).
    pub ws_access_stride: usize,
    /// Touch the suppress set every this many accessed bytes (0 disables).
    pub ss_access_stride: usize,
    /// Advise `WillNeed` for the next chunk every this many accessed bytes
    /// (0 disables).
    pub prefetch_stride: usize,
    /// Worker threads walking disjoint slices of the set; 0 walks on the
    /// calling thread.
    pub worker_count: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            use_anon_memory: false,
            use_file_api: false,
            eviction_file_path: PathBuf::from("eviction.ram"),
            targets_check_stride: 1024 * 4096,
            ws_access_stride: 0,
            ss_access_stride: 0,
            prefetch_stride: 1024 * 4096,
            worker_count: 0,
        }
    }
}

/// Statistics of the most recent eviction pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionStats {
    /// Wall-clock duration of the pass in nanoseconds.
    pub last_eviction_time_ns: u64,
    /// Bytes of the eviction set accessed during the pass (0 on failure).
    pub last_eviction_accessed_bytes: usize,
}

/// State shared between the driver and the worker threads.
struct EvictionShared {
    mapping: FileMapping,
    cfg: EvictionConfig,
    working_set: Option<Arc<WorkingSetState>>,
    /// Attached after the workers are spawned; the suppress set is built
    /// from the target registry once the eviction set exists.
    suppress_set: OnceLock<Arc<SuppressSet>>,
}

enum Pool {
    /// Walk the whole set on the calling thread.
    Inline,
    /// One job/result round trip per worker and eviction pass.
    Workers {
        job_txs: Vec<Sender<StopFn>>,
        result_rx: Receiver<Result<usize>>,
    },
}

pub(crate) struct EvictionSet {
    shared: Arc<EvictionShared>,
    pool: Pool,
    workers: Vec<JoinHandle<()>>,
    eviction_running: Arc<AtomicBool>,
    stats: Mutex<EvictionStats>,
}

impl EvictionSet {
    /// Create the backing mapping (≈ total RAM) and spawn the worker pool.
    ///
    /// `eviction_file_abs` is the resolved path for the file-backed variant;
    /// unused when `use_anon_memory` is set.
    pub(crate) fn create(
        cfg: EvictionConfig,
        total_memory: usize,
        eviction_file_abs: Option<PathBuf>,
        working_set: Option<Arc<WorkingSetState>>,
        eviction_running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let mapping = if cfg.use_anon_memory {
            FileMapping::map_anon(total_memory)?
        } else {
            let path = eviction_file_abs.ok_or_else(|| {
                Error::Environment("file-backed eviction set without a file path".into())
            })?;
            create_random_file(&path, total_memory)?;
            FileMapping::map_file(&path)?
        };

        let shared = Arc::new(EvictionShared {
            mapping,
            cfg,
            working_set,
            suppress_set: OnceLock::new(),
        });

        let mut workers = Vec::new();
        let pool = if shared.cfg.worker_count == 0 {
            Pool::Inline
        } else {
            let slices = partition(
                shared.mapping.size(),
                shared.mapping.size_pages(),
                shared.cfg.worker_count,
            );
            let (result_tx, result_rx) = channel();
            let mut job_txs = Vec::with_capacity(slices.len());
            for (offset, len) in slices {
                let (job_tx, job_rx) = channel::<StopFn>();
                let result_tx = result_tx.clone();
                let shared = Arc::clone(&shared);
                workers.push(std::thread::spawn(move || {
                    worker_loop(&shared, &job_rx, &result_tx, offset, len);
                }));
                job_txs.push(job_tx);
            }
            Pool::Workers { job_txs, result_rx }
        };

        Ok(Self {
            shared,
            pool,
            workers,
            eviction_running,
            stats: Mutex::new(EvictionStats::default()),
        })
    }

    /// Hand the suppress set to the walk loops. Called once, between
    /// worker spawn and the first eviction pass.
    pub(crate) fn attach_suppress_set(&self, suppress_set: Arc<SuppressSet>) {
        let _ = self.shared.suppress_set.set(suppress_set);
    }

    /// Statistics of the most recent eviction pass.
    pub(crate) fn stats(&self) -> EvictionStats {
        *self.stats.lock().unwrap()
    }

    /// Walk the eviction set until `stop` reports the targets as evicted.
    ///
    /// Returns the accessed byte count: positive on success, 0 when the
    /// whole set was walked without satisfying the stop condition.
    pub(crate) fn evict(&self, stop: StopFn) -> Result<usize> {
        let t0 = Instant::now();

        // Published before any worker starts so the working set can discard
        // re-profiling passes that overlap this eviction.
        self.eviction_running.store(true, Ordering::Release);
        let result = match &self.pool {
            Pool::Inline => evict_range(&self.shared, stop.as_ref(), 0, self.shared.mapping.size()),
            Pool::Workers { job_txs, result_rx } => {
                let mut dispatched = 0usize;
                let mut send_error = false;
                for job_tx in job_txs {
                    if job_tx.send(Arc::clone(&stop)).is_err() {
                        send_error = true;
                        break;
                    }
                    dispatched += 1;
                }
                let mut results = Vec::with_capacity(dispatched);
                for _ in 0..dispatched {
                    match result_rx.recv() {
                        Ok(r) => results.push(r),
                        Err(_) => {
                            send_error = true;
                            break;
                        }
                    }
                }
                if send_error {
                    Err(Error::Sys(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "eviction worker gone",
                    )))
                } else {
                    reduce_results(results)
                }
            }
        };
        self.eviction_running.store(false, Ordering::Release);

        let mut stats = self.stats.lock().unwrap();
        stats.last_eviction_time_ns = t0.elapsed().as_nanos() as u64;
        stats.last_eviction_accessed_bytes = *result.as_ref().unwrap_or(&0);
        drop(stats);

        result
    }

    /// Stop and join the worker pool.
    pub(crate) fn shutdown(&mut self) {
        // Dropping the job channels ends the worker loops.
        self.pool = Pool::Inline;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for EvictionSet {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Split the set into equal per-worker page ranges; the last worker takes
/// the remainder.
fn partition(size: usize, size_pages: usize, workers: usize) -> Vec<(usize, usize)> {
    let stride = (size_pages / workers) * sys::page_size();
    (0..workers)
        .map(|i| {
            let offset = i * stride;
            let len = if i == workers - 1 {
                size - offset
            } else {
                stride
            };
            (offset, len)
        })
        .collect()
}

/// Fold per-worker results: any error dominates, then any zero-progress
/// outcome, then the byte sum.
fn reduce_results(results: Vec<Result<usize>>) -> Result<usize> {
    let mut sum = 0usize;
    let mut saw_zero = false;
    for result in results {
        match result? {
            0 => saw_zero = true,
            bytes => sum += bytes,
        }
    }
    if saw_zero { Ok(0) } else { Ok(sum) }
}

fn worker_loop(
    shared: &EvictionShared,
    job_rx: &Receiver<StopFn>,
    result_tx: &Sender<Result<usize>>,
    offset: usize,
    len: usize,
) {
    debug!(target: "es", "worker spawned (offset {offset}, {len} bytes)");
    while let Ok(stop) = job_rx.recv() {
        let result = evict_range(shared, stop.as_ref(), offset, len);
        if let Ok(bytes) = &result {
            debug!(target: "es", "worker (offset {offset}) accessed {} kB", bytes / 1024);
        }
        if result_tx.send(result).is_err() {
            break;
        }
    }
}

/// Walk one slice of the eviction set. Always releases the pressure it
/// created by advising `DontNeed` over the slice afterwards.
fn evict_range(
    shared: &EvictionShared,
    stop: &(dyn Fn() -> Result<bool> + Send + Sync),
    offset: usize,
    len: usize,
) -> Result<usize> {
    let result = walk_range(shared, stop, offset, len);
    if let Err(e) = shared.mapping.advise(offset, len, Advice::DontNeed) {
        warn!(target: "es", "advise(DontNeed) failed: {e}");
    }
    result
}

fn walk_range(
    shared: &EvictionShared,
    stop: &(dyn Fn() -> Result<bool> + Send + Sync),
    offset: usize,
    len: usize,
) -> Result<usize> {
    let page = sys::page_size();
    let cfg = &shared.cfg;
    let mut accessed = 0usize;
    let mut pos = offset;

    while pos < offset + len {
        // Keep the working set hot while the pressure builds.
        if let Some(working_set) = &shared.working_set {
            if cfg.ws_access_stride != 0 && accessed % cfg.ws_access_stride == 0 {
                working_set.activate_resident_all();
            }
        }
        // Same for the readahead suppress set.
        if let Some(suppress_set) = shared.suppress_set.get() {
            if cfg.ss_access_stride != 0 && accessed % cfg.ss_access_stride == 0 {
                suppress_set.activate();
            }
        }
        // Prefetch the next chunk for efficient asynchronous reads.
        if cfg.prefetch_stride != 0 && accessed % cfg.prefetch_stride == 0 {
            if let Err(e) = shared
                .mapping
                .advise(pos, cfg.prefetch_stride, Advice::WillNeed)
            {
                warn!(target: "es", "advise(WillNeed) failed: {e}");
            }
        }

        if cfg.use_file_api {
            if let Err(e) = shared.mapping.read_page_twice(pos / page) {
                warn!(target: "es", "pread failed: {e}");
            }
        } else {
            shared.mapping.touch_page(pos / page);
        }
        accessed += page;
        pos += page;

        if cfg.targets_check_stride != 0
            && accessed % cfg.targets_check_stride == 0
            && stop()?
        {
            break;
        }
    }

    Ok(accessed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_the_whole_set_without_overlap() {
        let page = sys::page_size();
        let size = 10 * page + 123;
        let slices = partition(size, 11, 3);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0], (0, 3 * page));
        assert_eq!(slices[1], (3 * page, 3 * page));
        // Last worker takes the remainder, including the partial page.
        assert_eq!(slices[2], (6 * page, size - 6 * page));
        let total: usize = slices.iter().map(|&(_, len)| len).sum();
        assert_eq!(total, size);
    }

    #[test]
    fn reduce_sums_progress() {
        assert_eq!(reduce_results(vec![Ok(10), Ok(20)]).unwrap(), 30);
    }

    #[test]
    fn reduce_zero_progress_dominates_sum() {
        assert_eq!(reduce_results(vec![Ok(10), Ok(0), Ok(20)]).unwrap(), 0);
    }

    #[test]
    fn reduce_error_dominates_everything() {
        let results = vec![
            Ok(10),
            Err(Error::EvictionNotPossible),
            Ok(0),
        ];
        assert!(reduce_results(results).is_err());
    }

    #[test]
    fn inline_eviction_walks_a_small_anonymous_set() {
        let page = sys::page_size();
        let cfg = EvictionConfig {
            use_anon_memory: true,
            targets_check_stride: 4 * page,
            prefetch_stride: 0,
            ..EvictionConfig::default()
        };
        let shared = EvictionShared {
            mapping: FileMapping::map_anon(64 * page).unwrap(),
            cfg,
            working_set: None,
            suppress_set: OnceLock::new(),
        };
        let never_done: StopFn = Arc::new(|| Ok(false));
        let bytes = evict_range(&shared, &*never_done, 0, 64 * page).unwrap();
        assert_eq!(bytes, 64 * page);

        let instantly_done: StopFn = Arc::new(|| Ok(true));
        let bytes = evict_range(&shared, &*instantly_done, 0, 64 * page).unwrap();
        // Stops at the first check, after exactly one check stride.
        assert_eq!(bytes, 4 * page);
    }

    #[test]
    fn stop_condition_errors_propagate() {
        let page = sys::page_size();
        let cfg = EvictionConfig {
            use_anon_memory: true,
            targets_check_stride: page,
            prefetch_stride: 0,
            ..EvictionConfig::default()
        };
        let shared = EvictionShared {
            mapping: FileMapping::map_anon(8 * page).unwrap(),
            cfg,
            working_set: None,
            suppress_set: OnceLock::new(),
        };
        let failing: StopFn = Arc::new(|| Err(Error::EvictionNotPossible));
        assert!(evict_range(&shared, &*failing, 0, 8 * page).is_err());
    }
}
