//! The attack working set.
//!
//! Scans the configured search paths for files with cache-resident page
//! runs and keeps those runs alive against the memory reclaimer, so that
//! eviction pressure lands on the target pages instead of on unrelated hot
//! files. The file lists are double-buffered: readers always see either the
//! previous complete generation or the next one, never a half-rebuilt list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::mapping::{Advice, FileMapping};
use crate::profile::{PageSequence, profile_runs};
use crate::residency::CacheSampler;
use crate::sys;
use crate::target::{RaWindow, TargetFile};

/// Working-set configuration.
#[derive(Debug, Clone)]
pub struct WorkingSetConfig {
    /// Periodically re-profile the tracked files and swap in the fresh
    /// generation.
    pub evaluation: bool,
    /// Discard a re-profiling pass that overlapped an eviction pass, so the
    /// working set does not memorise the transient state the eviction
    /// itself caused.
    pub eviction_ignore_evaluation: bool,
    /// Touch pages through `pread` instead of dereferencing the mapping.
    pub use_file_api: bool,
    /// Filesystem roots scanned for cached files.
    pub search_paths: Vec<PathBuf>,
    /// Minimum resident run length (pages) for a run to be tracked.
    pub ps_add_threshold: usize,
    /// Sleep between two activation passes of a worker thread.
    pub access_period: Duration,
    /// Sleep between two re-profiling passes of the manager thread.
    pub evaluation_period: Duration,
    /// Number of activation worker threads.
    pub worker_count: usize,
}

impl Default for WorkingSetConfig {
    fn default() -> Self {
        Self {
            evaluation: true,
            eviction_ignore_evaluation: true,
            use_file_api: true,
            search_paths: [
                "/bin", "/dev/shm", "/etc", "/lib", "/opt", "/run", "/sbin", "/snap", "/tmp",
                "/usr", "/var",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            ps_add_threshold: 1,
            access_period: Duration::from_millis(15),
            evaluation_period: Duration::from_secs(30),
            worker_count: 6,
        }
    }
}

/// Profiling context shared by the initial scan and re-evaluation.
#[derive(Clone, Copy)]
pub(crate) struct WsContext {
    pub sampler: CacheSampler,
    pub window: RaWindow,
}

/// One file tracked by the working set.
pub(crate) struct CachedFile {
    mapping: Arc<FileMapping>,
    resident_memory: usize,
    sequences: Vec<PageSequence>,
    /// Set when the file is also a registered target; its pages and
    /// readahead window are masked out during profiling. The registry
    /// outlives the working set.
    target: Option<Arc<TargetFile>>,
}

#[derive(Default)]
pub(crate) struct WsGeneration {
    resident: Vec<CachedFile>,
    non_resident: Vec<CachedFile>,
    mem_in_ws: usize,
}

pub(crate) struct WorkingSetState {
    cfg: WorkingSetConfig,
    generations: RwLock<[WsGeneration; 2]>,
    live: AtomicUsize,
    checked_files: AtomicUsize,
    memory_checked: AtomicUsize,
}

impl WorkingSetState {
    /// Walk the search paths and build the initial generation. Per-file
    /// failures are skipped; running out of file descriptors ends the scan
    /// gracefully.
    pub(crate) fn profile(
        cfg: WorkingSetConfig,
        registry: &HashMap<PathBuf, Arc<TargetFile>>,
        ctx: WsContext,
        eviction_file: Option<&Path>,
    ) -> Result<Self> {
        let mut generation = WsGeneration::default();
        let mut checked_files = 0usize;
        let mut memory_checked = 0usize;

        'scan: for root in &cfg.search_paths {
            for entry in WalkDir::new(root).follow_links(false) {
                if !sys::running() {
                    break 'scan;
                }
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        if is_fd_exhaustion(e.io_error()) {
                            info!(target: "ws", "out of file descriptors, ending scan early");
                            break 'scan;
                        }
                        debug!(target: "ws", "skipping unreadable entry: {e}");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = match std::fs::canonicalize(entry.path()) {
                    Ok(p) => p,
                    Err(_) => entry.path().to_path_buf(),
                };
                if eviction_file == Some(path.as_path()) {
                    debug!(target: "ws", "{} is the eviction file, skipping", path.display());
                    continue;
                }
                let target = registry.get(&path);
                if target.is_some_and(|t| t.is_whole_file()) {
                    debug!(target: "ws", "{} is a whole-file target, skipping", path.display());
                    continue;
                }

                match profile_one(&path, target.cloned(), ctx, cfg.ps_add_threshold) {
                    Ok(cached) => {
                        checked_files += 1;
                        memory_checked += cached.mapping.size();
                        classify(&mut generation, cached);
                    }
                    Err(e) => {
                        if let Error::Io { source, .. } = &e {
                            if is_fd_exhaustion(Some(source)) {
                                info!(
                                    target: "ws",
                                    "out of file descriptors, ending scan early"
                                );
                                break 'scan;
                            }
                        }
                        debug!(target: "ws", "skipping {}: {e}", path.display());
                    }
                }
            }
        }

        info!(
            target: "ws",
            "profiled {} files, tracking {} with {} resident bytes",
            checked_files,
            generation.resident.len(),
            generation.mem_in_ws
        );
        Ok(Self {
            cfg,
            generations: RwLock::new([generation, WsGeneration::default()]),
            live: AtomicUsize::new(0),
            checked_files: AtomicUsize::new(checked_files),
            memory_checked: AtomicUsize::new(memory_checked),
        })
    }

    /// Number of tracked resident files and their resident bytes.
    pub(crate) fn resident_summary(&self) -> (usize, usize) {
        let generations = self.generations.read().unwrap();
        let live = &generations[self.live.load(Ordering::Acquire)];
        (live.resident.len(), live.mem_in_ws)
    }

    /// Files scanned and bytes mapped during the initial profile.
    pub(crate) fn scan_summary(&self) -> (usize, usize) {
        (
            self.checked_files.load(Ordering::Relaxed),
            self.memory_checked.load(Ordering::Relaxed),
        )
    }

    /// Touch every tracked resident run once. Used by the eviction inner
    /// loop to keep the working set warm while pressure builds.
    pub(crate) fn activate_resident_all(&self) -> usize {
        let generations = self.generations.read().unwrap();
        let live = &generations[self.live.load(Ordering::Acquire)];
        activate_files(&live.resident, self.cfg.use_file_api)
    }
}

fn classify(generation: &mut WsGeneration, cached: CachedFile) {
    if cached.sequences.is_empty() {
        generation.non_resident.push(cached);
    } else {
        generation.mem_in_ws += cached.resident_memory;
        generation.resident.push(cached);
    }
}

fn is_fd_exhaustion(err: Option<&std::io::Error>) -> bool {
    matches!(
        err.and_then(|e| e.raw_os_error()),
        Some(libc::EMFILE) | Some(libc::ENFILE)
    )
}

fn profile_one(
    path: &Path,
    target: Option<Arc<TargetFile>>,
    ctx: WsContext,
    ps_add_threshold: usize,
) -> Result<CachedFile> {
    let mapping = FileMapping::map_file(path)?;
    // Keep the scan itself from distorting what we are measuring.
    if let Err(e) = mapping.advise(0, 0, Advice::Random) {
        debug!(target: "ws", "advise(Random) failed for {}: {e}", path.display());
    }

    let mapping = Arc::new(mapping);
    let (sequences, resident_memory) = profile_sequences(&mapping, target.as_deref(), ctx, ps_add_threshold)?;
    Ok(CachedFile {
        mapping,
        resident_memory,
        sequences,
        target,
    })
}

/// Query residency, mask out target pages and their readahead trigger
/// windows, and collapse the rest into page sequences.
fn profile_sequences(
    mapping: &FileMapping,
    target: Option<&TargetFile>,
    ctx: WsContext,
    ps_add_threshold: usize,
) -> Result<(Vec<PageSequence>, usize)> {
    let mut status = ctx.sampler.status_range(mapping, 0, mapping.size_pages())?;
    if let Some(target) = target {
        // Keeping these pages "hot" would defeat the later eviction.
        target.mask_readahead(&mut status, ctx.window, 0);
        target.mask_target_pages(&mut status, 0);
    }
    let runs = profile_runs(&status, ps_add_threshold);
    Ok((
        runs.sequences,
        runs.resident_pages * sys::page_size(),
    ))
}

fn activate_files(files: &[CachedFile], use_file_api: bool) -> usize {
    let mut accessed_pages = 0usize;
    for file in files {
        for seq in &file.sequences {
            for page in seq.offset..seq.offset + seq.length {
                if use_file_api {
                    if let Err(e) = file.mapping.read_page_twice(page) {
                        debug!(target: "ws", "pread failed: {e}");
                    }
                } else {
                    file.mapping.touch_page(page);
                }
                accessed_pages += 1;
            }
        }
    }
    accessed_pages * sys::page_size()
}

/// Spawn the manager thread, which owns the activation workers and runs the
/// periodic double-buffered re-evaluation.
pub(crate) fn spawn_manager(
    state: Arc<WorkingSetState>,
    ctx: WsContext,
    alive: Arc<AtomicBool>,
    eviction_running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let worker_count = state.cfg.worker_count;
        if worker_count == 0 {
            return;
        }

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let state = Arc::clone(&state);
            let alive = Arc::clone(&alive);
            workers.push(std::thread::spawn(move || worker_loop(&state, id, &alive)));
        }

        while sys::running() && alive.load(Ordering::Relaxed) {
            if state.cfg.evaluation {
                match reevaluate(&state, ctx, &eviction_running) {
                    Ok(true) => {
                        let (files, bytes) = state.resident_summary();
                        debug!(
                            target: "ws",
                            "rescanned working set: {files} files, {bytes} resident bytes"
                        );
                    }
                    Ok(false) => {
                        warn!(target: "ws", "eviction overlapped re-evaluation, result discarded");
                    }
                    Err(e) => {
                        warn!(target: "ws", "re-evaluation aborted: {e}");
                    }
                }
            }
            sys::sleep_while(state.cfg.evaluation_period, &alive);
        }

        for worker in workers {
            let _ = worker.join();
        }
    })
}

fn worker_loop(state: &WorkingSetState, id: usize, alive: &AtomicBool) {
    let worker_count = state.cfg.worker_count;
    let mut seen_generation = usize::MAX;
    let mut start = 0usize;
    let mut count = 0usize;

    while sys::running() && alive.load(Ordering::Relaxed) {
        {
            let generations = state.generations.read().unwrap();
            let live_idx = state.live.load(Ordering::Acquire);
            let live = &generations[live_idx];
            if live_idx != seen_generation {
                seen_generation = live_idx;
                count = live.resident.len() / worker_count;
                start = id * count;
                debug!(
                    target: "ws",
                    "worker {id} reconfigured: {count} files starting at {start}"
                );
            }
            let end = (start + count).min(live.resident.len());
            let slice = &live.resident[start.min(end)..end];
            activate_files(slice, state.cfg.use_file_api);
        }
        sys::sleep_while(state.cfg.access_period, alive);
    }
}

/// Rebuild the inactive generation from the live one and flip the live
/// index. Returns `Ok(false)` when the result was discarded because an
/// eviction pass ran concurrently; the live generation is untouched in
/// every non-`Ok(true)` case.
fn reevaluate(
    state: &WorkingSetState,
    ctx: WsContext,
    eviction_running: &AtomicBool,
) -> Result<bool> {
    // Snapshot mapping handles so the slow residency queries run without
    // holding the lock.
    let snapshot: Vec<(Arc<FileMapping>, Option<Arc<TargetFile>>)> = {
        let generations = state.generations.read().unwrap();
        let live = &generations[state.live.load(Ordering::Acquire)];
        live.resident
            .iter()
            .chain(live.non_resident.iter())
            .map(|f| (Arc::clone(&f.mapping), f.target.clone()))
            .collect()
    };

    let mut fresh = WsGeneration::default();
    for (mapping, target) in snapshot {
        let (sequences, resident_memory) =
            profile_sequences(&mapping, target.as_deref(), ctx, state.cfg.ps_add_threshold)?;
        if state.cfg.eviction_ignore_evaluation && eviction_running.load(Ordering::Acquire) {
            return Ok(false);
        }
        classify(
            &mut fresh,
            CachedFile {
                mapping,
                resident_memory,
                sequences,
                target,
            },
        );
    }

    let mut generations = state.generations.write().unwrap();
    let inactive = state.live.load(Ordering::Acquire) ^ 1;
    generations[inactive] = fresh;
    state.live.store(inactive, Ordering::Release);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn mapped_scratch(dir: &tempfile::TempDir, name: &str, pages: usize) -> Arc<FileMapping> {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![1u8; pages * sys::page_size()]).unwrap();
        f.sync_all().unwrap();
        Arc::new(FileMapping::map_file(&path).unwrap())
    }

    fn cached(mapping: Arc<FileMapping>, sequences: Vec<PageSequence>) -> CachedFile {
        let resident: usize = sequences.iter().map(|s| s.length).sum();
        CachedFile {
            mapping,
            resident_memory: resident * sys::page_size(),
            sequences,
            target: None,
        }
    }

    #[test]
    fn classify_separates_resident_and_non_resident() {
        let dir = tempfile::tempdir().unwrap();
        let mut generation = WsGeneration::default();
        classify(
            &mut generation,
            cached(
                mapped_scratch(&dir, "a", 4),
                vec![PageSequence {
                    offset: 0,
                    length: 2,
                }],
            ),
        );
        classify(&mut generation, cached(mapped_scratch(&dir, "b", 4), vec![]));

        assert_eq!(generation.resident.len(), 1);
        assert_eq!(generation.non_resident.len(), 1);
        assert_eq!(generation.mem_in_ws, 2 * sys::page_size());
        // Resident entries always carry runs and memory; non-resident never do.
        assert!(generation.resident[0].resident_memory > 0);
        assert!(generation.non_resident[0].sequences.is_empty());
        assert_eq!(generation.non_resident[0].resident_memory, 0);
    }

    #[test]
    fn resident_memory_matches_sequence_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let file = cached(
            mapped_scratch(&dir, "c", 8),
            vec![
                PageSequence {
                    offset: 0,
                    length: 3,
                },
                PageSequence {
                    offset: 5,
                    length: 2,
                },
            ],
        );
        let total: usize = file.sequences.iter().map(|s| s.length).sum();
        assert_eq!(file.resident_memory, total * sys::page_size());
    }

    #[test]
    fn activate_files_touches_every_sequence_page() {
        let dir = tempfile::tempdir().unwrap();
        let file = cached(
            mapped_scratch(&dir, "d", 8),
            vec![PageSequence {
                offset: 2,
                length: 3,
            }],
        );
        let bytes = activate_files(&[file], true);
        assert_eq!(bytes, 3 * sys::page_size());
    }

    #[test]
    fn profile_scan_tracks_recently_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let _m = mapped_scratch(&dir, "hot", 4);
        let cfg = WorkingSetConfig {
            search_paths: vec![dir.path().to_path_buf()],
            worker_count: 0,
            ..WorkingSetConfig::default()
        };
        let ctx = WsContext {
            sampler: CacheSampler::Mincore,
            window: RaWindow::from_total(32),
        };
        let state = WorkingSetState::profile(cfg, &HashMap::new(), ctx, None).unwrap();
        let (checked, _) = state.scan_summary();
        assert!(checked >= 1);
    }

    #[test]
    fn reevaluation_is_discarded_while_an_eviction_runs() {
        let dir = tempfile::tempdir().unwrap();
        let _m = mapped_scratch(&dir, "hot", 4);
        let cfg = WorkingSetConfig {
            search_paths: vec![dir.path().to_path_buf()],
            worker_count: 0,
            ..WorkingSetConfig::default()
        };
        let ctx = WsContext {
            sampler: CacheSampler::Mincore,
            window: RaWindow::from_total(32),
        };
        let state = WorkingSetState::profile(cfg, &HashMap::new(), ctx, None).unwrap();
        assert_eq!(state.live.load(Ordering::Acquire), 0);

        let eviction_running = AtomicBool::new(true);
        assert_eq!(reevaluate(&state, ctx, &eviction_running).unwrap(), false);
        assert_eq!(
            state.live.load(Ordering::Acquire),
            0,
            "a discarded re-evaluation must not flip the live generation"
        );

        eviction_running.store(false, Ordering::Release);
        assert_eq!(reevaluate(&state, ctx, &eviction_running).unwrap(), true);
        assert_eq!(state.live.load(Ordering::Acquire), 1);
    }

    #[test]
    fn profile_scan_skips_the_eviction_file() {
        let dir = tempfile::tempdir().unwrap();
        let _m = mapped_scratch(&dir, "eviction.ram", 4);
        let eviction_path = std::fs::canonicalize(dir.path().join("eviction.ram")).unwrap();
        let cfg = WorkingSetConfig {
            search_paths: vec![dir.path().to_path_buf()],
            worker_count: 0,
            ..WorkingSetConfig::default()
        };
        let ctx = WsContext {
            sampler: CacheSampler::Mincore,
            window: RaWindow::from_total(32),
        };
        let state =
            WorkingSetState::profile(cfg, &HashMap::new(), ctx, Some(&eviction_path)).unwrap();
        let (checked, _) = state.scan_summary();
        assert_eq!(checked, 0);
    }
}
