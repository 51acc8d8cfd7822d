//! The attack root container.
//!
//! Owns the eviction, blocking, working and suppress sets plus the target
//! registry, wires them together at `start`, and exposes the three
//! sample-then-evict entry points. Teardown is deterministic and runs in
//! reverse order of setup.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info};

use crate::blocking::{BlockingSet, BlockingSetConfig};
use crate::error::{Error, Result};
use crate::eviction::{EvictionConfig, EvictionSet, EvictionStats, StopFn};
use crate::residency::{CacheSampler, count_cached};
use crate::suppress::{SuppressSet, SuppressSetConfig};
use crate::sys;
use crate::target::{RaWindow, TargetFile, parse_targets_config};
use crate::working::{self, WorkingSetConfig, WorkingSetState, WsContext};

/// Attack configuration. The defaults mirror a pages-monitoring setup with
/// the blocking set enabled and `mincore` as the residency source.
#[derive(Debug, Clone)]
pub struct AttackConfig {
    /// Run the blocking set.
    pub use_blocking_set: bool,
    /// Run the working set.
    pub use_working_set: bool,
    /// Run the suppress set.
    pub use_suppress_set: bool,
    /// Residency source, fixed for the whole run.
    pub sampler: CacheSampler,
    /// Kernel readahead window span in pages
    /// (`/sys/block/<dev>/queue/read_ahead_kb` in pages).
    pub ra_window_pages: usize,
    pub eviction: EvictionConfig,
    pub blocking: BlockingSetConfig,
    pub working: WorkingSetConfig,
    pub suppress: SuppressSetConfig,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            use_blocking_set: true,
            use_working_set: false,
            use_suppress_set: false,
            sampler: CacheSampler::Mincore,
            ra_window_pages: 32,
            eviction: EvictionConfig::default(),
            blocking: BlockingSetConfig::default(),
            working: WorkingSetConfig::default(),
            suppress: SuppressSetConfig::default(),
        }
    }
}

/// Outcome of one sample-then-evict call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Nothing observed that requires eviction.
    Idle,
    /// A cached observation triggered an eviction pass that completed.
    Evicted,
}

struct Runtime {
    registry: Arc<HashMap<PathBuf, Arc<TargetFile>>>,
    eviction_set: EvictionSet,
    working_set: Option<(Arc<WorkingSetState>, JoinHandle<()>)>,
    suppress_workers: Vec<JoinHandle<()>>,
    blocking_set: Option<BlockingSet>,
}

/// The attack. Register targets, `start`, then sample in a loop.
pub struct Attack {
    cfg: AttackConfig,
    total_memory: usize,
    targets: HashMap<PathBuf, TargetFile>,
    runtime: Option<Runtime>,
    alive: Arc<AtomicBool>,
    eviction_running: Arc<AtomicBool>,
}

impl Attack {
    /// Validate the environment and prepare an attack with `cfg`.
    pub fn new(cfg: AttackConfig) -> Result<Self> {
        let total_memory = sys::total_memory()
            .map_err(|e| Error::Environment(format!("total memory unavailable: {e}")))?;
        debug!(
            "page size: {}, total memory: {} MB",
            sys::page_size(),
            total_memory / 1024 / 1024
        );
        Ok(Self {
            cfg,
            total_memory,
            targets: HashMap::new(),
            runtime: None,
            alive: Arc::new(AtomicBool::new(true)),
            eviction_running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Register `path` as a whole-file target and return a handle for
    /// further customisation (e.g. narrowing to a page sequence).
    pub fn add_target_file(&mut self, path: &Path) -> Result<&mut TargetFile> {
        if self.runtime.is_some() {
            return Err(Error::Lifecycle("targets must be added before start"));
        }
        let target = TargetFile::open(path)?;
        let key = target.path().to_path_buf();
        let slot = match self.targets.entry(key) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(target);
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => vacant.insert(target),
        };
        Ok(slot)
    }

    /// Register page targets from a configuration file. On any error the
    /// registry is left unchanged.
    pub fn add_targets_from_file(&mut self, config_path: &Path) -> Result<()> {
        if self.runtime.is_some() {
            return Err(Error::Lifecycle("targets must be added before start"));
        }
        let content =
            fs::read_to_string(config_path).map_err(|e| Error::io(config_path, e))?;
        let specs = parse_targets_config(&content)?;

        // Stage everything first so a bad entry cannot leave a half-applied
        // registry behind.
        let mut staged = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut target = TargetFile::open(&spec.path)?;
            target.set_target_pages(&spec.pages)?;
            debug!(
                "added {} target pages from {}",
                spec.pages.len(),
                target.path().display()
            );
            staged.push(target);
        }
        for target in staged {
            self.targets.insert(target.path().to_path_buf(), target);
        }
        Ok(())
    }

    /// Bring up all configured subsystems and block until the blocking set
    /// (when enabled) has pinned `MemAvailable` into its band.
    pub fn start(&mut self) -> Result<()> {
        if self.runtime.is_some() {
            return Err(Error::Lifecycle("attack already started"));
        }
        self.alive.store(true, Ordering::Relaxed);

        let registry: Arc<HashMap<PathBuf, Arc<TargetFile>>> = Arc::new(
            self.targets
                .drain()
                .map(|(path, target)| (path, Arc::new(target)))
                .collect(),
        );
        let window = RaWindow::from_total(self.cfg.ra_window_pages);
        let ctx = WsContext {
            sampler: self.cfg.sampler,
            window,
        };
        let eviction_file_abs = if self.cfg.eviction.use_anon_memory {
            None
        } else {
            Some(resolve_abs(&self.cfg.eviction.eviction_file_path)?)
        };

        // Working set first: profiled before any memory is blocked so the
        // system's current working set is what gets captured.
        let working_set = if self.cfg.use_working_set {
            info!(target: "ws", "profiling working set");
            let state = Arc::new(WorkingSetState::profile(
                self.cfg.working.clone(),
                &registry,
                ctx,
                eviction_file_abs.as_deref(),
            )?);
            let (checked, bytes) = state.scan_summary();
            debug!(target: "ws", "scan covered {checked} files ({bytes} bytes mapped)");
            Some(state)
        } else {
            None
        };

        info!(
            target: "es",
            "creating a {} MB eviction set, this may take a while",
            self.total_memory / 1024 / 1024
        );
        let eviction_set = EvictionSet::create(
            self.cfg.eviction.clone(),
            self.total_memory,
            eviction_file_abs,
            working_set.clone(),
            Arc::clone(&self.eviction_running),
        )?;

        let suppress_workers = if self.cfg.use_suppress_set {
            let suppress_set = Arc::new(SuppressSet::build(
                registry.values(),
                window,
                self.cfg.suppress.clone(),
            ));
            if suppress_set.is_empty() {
                info!(target: "ss", "suppress set is empty, nothing to keep hot");
            }
            eviction_set.attach_suppress_set(Arc::clone(&suppress_set));
            SuppressSet::spawn_workers(&suppress_set, &self.alive)
        } else {
            Vec::new()
        };

        let working_set = working_set.map(|state| {
            let manager = working::spawn_manager(
                Arc::clone(&state),
                ctx,
                Arc::clone(&self.alive),
                Arc::clone(&self.eviction_running),
            );
            (state, manager)
        });

        self.runtime = Some(Runtime {
            registry,
            eviction_set,
            working_set,
            suppress_workers,
            blocking_set: None,
        });

        // Blocking set last: it costs memory and would distort the profile.
        if self.cfg.use_blocking_set {
            info!(target: "bs", "spawning blocking set manager");
            let (blocking_set, initialized_rx) =
                BlockingSet::spawn(self.cfg.blocking.clone(), Arc::clone(&self.alive));
            if let Some(rt) = self.runtime.as_mut() {
                rt.blocking_set = Some(blocking_set);
            }
            loop {
                match initialized_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(()) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        if !sys::running() || !self.alive.load(Ordering::Relaxed) {
                            self.stop();
                            return Err(Error::Interrupted);
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        self.stop();
                        return Err(Error::Environment("blocking set manager died".into()));
                    }
                }
            }
            info!(target: "bs", "available memory inside the configured band");
        }

        Ok(())
    }

    /// Look up a registered target by path (after `start`).
    pub fn target(&self, path: &Path) -> Option<Arc<TargetFile>> {
        let runtime = self.runtime.as_ref()?;
        let key = fs::canonicalize(path).ok()?;
        runtime.registry.get(&key).cloned()
    }

    /// All registered targets (after `start`).
    pub fn targets(&self) -> impl Iterator<Item = &Arc<TargetFile>> {
        self.runtime.iter().flat_map(|rt| rt.registry.values())
    }

    /// Tracked resident files and bytes of the working set, when enabled.
    pub fn working_set_summary(&self) -> (usize, usize) {
        self.runtime
            .as_ref()
            .and_then(|rt| rt.working_set.as_ref())
            .map(|(state, _)| state.resident_summary())
            .unwrap_or((0, 0))
    }

    /// Statistics of the most recent eviction pass.
    pub fn eviction_stats(&self) -> EvictionStats {
        self.runtime
            .as_ref()
            .map(|rt| rt.eviction_set.stats())
            .unwrap_or_default()
    }

    /// Whether a single page of `target` is currently cached.
    pub fn page_cached(&self, target: &TargetFile, offset: usize) -> Result<bool> {
        Ok(self.cfg.sampler.status_page(target.mapping(), offset)? & 1 == 1)
    }

    /// Raw residency vector for a page range of `target`, using the
    /// configured sampler.
    pub fn status_range(
        &self,
        target: &TargetFile,
        offset_pages: usize,
        len_pages: usize,
    ) -> Result<Vec<u8>> {
        self.cfg
            .sampler
            .status_range(target.mapping(), offset_pages, len_pages)
    }

    /// Sample every target page; when any cached page wants eviction, run
    /// one eviction pass until all target pages are uncached.
    pub fn sample_and_evict_pages(&self) -> Result<SampleOutcome> {
        let runtime = self.active_runtime()?;
        if !self.sample_pages_should_evict(runtime)? {
            return Ok(SampleOutcome::Idle);
        }
        let registry = Arc::clone(&runtime.registry);
        let sampler = self.cfg.sampler;
        let stop: StopFn = Arc::new(move || pages_evicted(&registry, sampler));
        self.run_eviction(runtime, stop)
    }

    /// Sample the full residency of every target file; when any page is
    /// cached, run one eviction pass until all target files are uncached.
    pub fn sample_and_evict_files(&self) -> Result<SampleOutcome> {
        let runtime = self.active_runtime()?;
        let ts = sys::unix_ts_us();
        let mut should_evict = false;
        for target in runtime.registry.values() {
            let status = self
                .cfg
                .sampler
                .status_range(target.mapping(), 0, target.size_pages())?;
            if count_cached(&status) > 0 {
                should_evict = true;
            }
            target.store_sample_range(0, &status, ts);
        }
        if !should_evict {
            return Ok(SampleOutcome::Idle);
        }
        let registry = Arc::clone(&runtime.registry);
        let sampler = self.cfg.sampler;
        let stop: StopFn = Arc::new(move || files_evicted(&registry, sampler));
        self.run_eviction(runtime, stop)
    }

    /// Sample the target sequence of `target`; when any page inside is
    /// cached, run one eviction pass until the sequence is uncached.
    pub fn sample_and_evict_sequence(&self, target: &Arc<TargetFile>) -> Result<SampleOutcome> {
        let runtime = self.active_runtime()?;
        let seq = target
            .target_sequence()
            .ok_or_else(|| Error::NoTargetSequence(target.path().to_path_buf()))?;

        let status = self
            .cfg
            .sampler
            .status_range(target.mapping(), seq.offset, seq.length)?;
        target.store_sample_range(seq.offset, &status, sys::unix_ts_us());
        if count_cached(&status) == 0 {
            return Ok(SampleOutcome::Idle);
        }

        let sampler = self.cfg.sampler;
        let target = Arc::clone(target);
        let stop: StopFn = Arc::new(move || {
            let status = sampler.status_range(target.mapping(), seq.offset, seq.length)?;
            Ok(count_cached(&status) == 0)
        });
        self.run_eviction(runtime, stop)
    }

    /// Stop every subsystem and release all resources. Teardown order is
    /// the reverse of setup: suppress set, working set, blocking set,
    /// eviction set, registry.
    pub fn stop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        if let Some(mut runtime) = self.runtime.take() {
            for worker in runtime.suppress_workers.drain(..) {
                let _ = worker.join();
            }
            if let Some((_state, manager)) = runtime.working_set.take() {
                let _ = manager.join();
            }
            if let Some(blocking_set) = runtime.blocking_set.take() {
                blocking_set.join();
            }
            runtime.eviction_set.shutdown();
        }
    }

    fn active_runtime(&self) -> Result<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or(Error::Lifecycle("attack not started"))
    }

    fn run_eviction(&self, runtime: &Runtime, stop: StopFn) -> Result<SampleOutcome> {
        let accessed = runtime.eviction_set.evict(stop)?;
        if accessed == 0 {
            return Err(Error::EvictionNotPossible);
        }
        debug!(target: "es", "eviction pass accessed {} kB", accessed / 1024);
        Ok(SampleOutcome::Evicted)
    }

    fn sample_pages_should_evict(&self, runtime: &Runtime) -> Result<bool> {
        let ts = sys::unix_ts_us();
        let mut should_evict = false;
        for target in runtime.registry.values() {
            let Some(pages) = target.target_pages() else {
                continue;
            };
            for page in pages {
                let status = self.cfg.sampler.status_page(target.mapping(), page.offset)?;
                target.store_sample_page(page.offset, status, ts);
                page.record_sample_time(ts);
                if !page.no_eviction && status & 1 == 1 {
                    should_evict = true;
                }
            }
        }
        Ok(should_evict)
    }
}

impl Drop for Attack {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stop condition for pages mode: every configured target page (including
/// `no_eviction` ones) must be uncached.
fn pages_evicted(
    registry: &HashMap<PathBuf, Arc<TargetFile>>,
    sampler: CacheSampler,
) -> Result<bool> {
    for target in registry.values() {
        let Some(pages) = target.target_pages() else {
            continue;
        };
        for page in pages {
            if sampler.status_page(target.mapping(), page.offset)? & 1 == 1 {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Stop condition for files mode: zero cached pages across all targets.
fn files_evicted(
    registry: &HashMap<PathBuf, Arc<TargetFile>>,
    sampler: CacheSampler,
) -> Result<bool> {
    for target in registry.values() {
        let status = sampler.status_range(target.mapping(), 0, target.size_pages())?;
        if count_cached(&status) != 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

fn resolve_abs(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_target(dir: &tempfile::TempDir, name: &str, pages: usize) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0x5Au8; pages * sys::page_size()])
            .unwrap();
        f.sync_all().unwrap();
        path
    }

    fn config_without_subsystems() -> AttackConfig {
        AttackConfig {
            use_blocking_set: false,
            use_working_set: false,
            use_suppress_set: false,
            ..AttackConfig::default()
        }
    }

    #[test]
    fn defaults_follow_the_reference_setup() {
        let cfg = AttackConfig::default();
        assert!(cfg.use_blocking_set);
        assert!(!cfg.use_working_set);
        assert!(!cfg.use_suppress_set);
        assert_eq!(cfg.sampler, CacheSampler::Mincore);
        assert_eq!(cfg.ra_window_pages, 32);
        assert_eq!(cfg.eviction.eviction_file_path, PathBuf::from("eviction.ram"));
    }

    #[test]
    fn add_target_file_canonicalises_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_target(&dir, "t", 4);
        let mut attack = Attack::new(config_without_subsystems()).unwrap();
        let target = attack.add_target_file(&path).unwrap();
        assert!(target.path().is_absolute());
        assert_eq!(target.size_pages(), 4);
    }

    #[test]
    fn add_targets_from_file_rejects_malformed_config() {
        let dir = tempfile::tempdir().unwrap();
        let target_path = scratch_target(&dir, "t", 4);
        let config_path = dir.path().join("targets.conf");
        std::fs::write(
            &config_path,
            format!("{}\ndeadbeef\n\n", target_path.display()),
        )
        .unwrap();

        let mut attack = Attack::new(config_without_subsystems()).unwrap();
        assert!(attack.add_targets_from_file(&config_path).is_err());
        assert!(attack.targets.is_empty(), "registry must stay unchanged");
    }

    #[test]
    fn add_targets_from_file_rejects_out_of_bounds_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let target_path = scratch_target(&dir, "t", 4);
        let config_path = dir.path().join("targets.conf");
        std::fs::write(&config_path, format!("{}\n10 0\n\n", target_path.display())).unwrap();

        let mut attack = Attack::new(config_without_subsystems()).unwrap();
        assert!(attack.add_targets_from_file(&config_path).is_err());
        assert!(attack.targets.is_empty());
    }

    #[test]
    fn add_targets_from_file_registers_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let target_path = scratch_target(&dir, "t", 8);
        let config_path = dir.path().join("targets.conf");
        std::fs::write(&config_path, format!("{}\n2 0\n3 1\n\n", target_path.display()))
            .unwrap();

        let mut attack = Attack::new(config_without_subsystems()).unwrap();
        attack.add_targets_from_file(&config_path).unwrap();
        assert_eq!(attack.targets.len(), 1);
        let target = attack.targets.values().next().unwrap();
        let pages = target.target_pages().unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].offset, 2);
        assert!(!pages[0].no_eviction);
        assert!(pages[1].no_eviction);
    }

    #[test]
    fn sampling_before_start_is_a_lifecycle_error() {
        let attack = Attack::new(config_without_subsystems()).unwrap();
        assert!(matches!(
            attack.sample_and_evict_pages(),
            Err(Error::Lifecycle(_))
        ));
    }
}
