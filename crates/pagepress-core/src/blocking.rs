//! The attack blocking set.
//!
//! Pins `MemAvailable` into a configured band by holding dirty anonymous
//! memory in forked child processes, so any additional pressure from the
//! eviction set immediately forces the reclaimer to act. The children are
//! separate processes on purpose: their dirty pages are not part of the
//! attacker's working set and they get their own OOM scoring.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::sys;

const MEMINFO_PATH: &str = "/proc/meminfo";
const MEMINFO_AVAILABLE_TAG: &str = "MemAvailable:";

/// Blocking-set configuration.
#[derive(Debug, Clone)]
pub struct BlockingSetConfig {
    /// Dirty anonymous memory held by each fill-up child.
    pub fillup_size: usize,
    /// Lower bound of the `MemAvailable` band; children are killed below it.
    pub min_available: usize,
    /// Upper bound of the `MemAvailable` band; children are spawned above it.
    pub max_available: usize,
    /// Sleep between two band evaluations of the manager thread.
    pub evaluation_period: Duration,
}

impl Default for BlockingSetConfig {
    fn default() -> Self {
        let fillup_size = 8 * 1024 * 4096;
        let min_available = 32 * 1024 * 4096;
        Self {
            fillup_size,
            min_available,
            max_available: min_available + 2 * fillup_size,
            evaluation_period: Duration::from_millis(10),
        }
    }
}

/// A forked fill-up child. Killed and reaped on drop.
struct FillUpProcess {
    pid: libc::pid_t,
    fillup_size: usize,
}

impl Drop for FillUpProcess {
    fn drop(&mut self) {
        if self.pid > 0 {
            sys::kill_and_reap(self.pid);
        }
    }
}

/// What the manager should do for an observed `MemAvailable` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BandAction {
    /// Kill children worth this many bytes.
    Release(usize),
    /// Spawn children worth this many bytes (rounded down to whole
    /// children, so the band is approached rather than overshot).
    Block(usize),
    /// Above the band, but by less than one fill-up unit. Wait.
    Hold,
    /// Inside the band.
    InBand,
}

fn plan_band_action(available: usize, cfg: &BlockingSetConfig) -> BandAction {
    let goal = cfg.min_available + (cfg.max_available - cfg.min_available) / 2;
    if available < cfg.min_available {
        BandAction::Release(goal - available)
    } else if available > cfg.max_available {
        // * 3 / 4 for slower convergence (less overshoot).
        let diff = (available - goal) * 3 / 4;
        if diff >= cfg.fillup_size {
            BandAction::Block(diff)
        } else {
            BandAction::Hold
        }
    } else {
        BandAction::InBand
    }
}

/// Parse the `MemAvailable:` line of `/proc/meminfo` content into bytes.
fn parse_available_mem(meminfo: &str) -> Option<usize> {
    let line = meminfo
        .lines()
        .find(|l| l.starts_with(MEMINFO_AVAILABLE_TAG))?;
    let digits: String = line
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<usize>().ok().map(|kib| kib * 1024)
}

/// `MemAvailable` in bytes. Returns 0 when it cannot be read, which drives
/// the manager towards releasing everything instead of deadlocking the
/// system.
fn read_available_mem() -> usize {
    match std::fs::read_to_string(MEMINFO_PATH) {
        Ok(content) => match parse_available_mem(&content) {
            Some(bytes) => bytes,
            None => {
                warn!(target: "bs", "available memory could not be parsed, assuming 0");
                0
            }
        },
        Err(e) => {
            warn!(target: "bs", "reading {MEMINFO_PATH} failed ({e}), assuming 0");
            0
        }
    }
}

/// Handle to the running blocking set.
pub(crate) struct BlockingSet {
    manager: Option<JoinHandle<()>>,
}

impl BlockingSet {
    /// Spawn the manager thread. The returned receiver fires exactly once,
    /// when `MemAvailable` first enters the configured band.
    pub(crate) fn spawn(
        cfg: BlockingSetConfig,
        alive: Arc<AtomicBool>,
    ) -> (Self, Receiver<()>) {
        let (init_tx, init_rx) = channel();
        let manager = std::thread::spawn(move || manager_loop(&cfg, &alive, &init_tx));
        (
            Self {
                manager: Some(manager),
            },
            init_rx,
        )
    }

    /// Join the manager. It kills all fill-up children before returning.
    pub(crate) fn join(mut self) {
        if let Some(handle) = self.manager.take() {
            let _ = handle.join();
        }
    }
}

fn manager_loop(cfg: &BlockingSetConfig, alive: &AtomicBool, init_tx: &Sender<()>) {
    // The child list is the single source of truth for blocked memory and
    // is only ever touched by this thread.
    let mut children: Vec<FillUpProcess> = Vec::new();
    let mut initialized = false;

    debug!(target: "bs", "manager started, band [{}, {}] bytes", cfg.min_available, cfg.max_available);
    while sys::running() && alive.load(Ordering::Relaxed) {
        let available = read_available_mem();
        debug!(target: "bs", "{} kB available, {} children", available / 1024, children.len());

        match plan_band_action(available, cfg) {
            BandAction::Release(bytes) => {
                debug!(target: "bs", "below band, releasing {} kB", bytes / 1024);
                release_ram(&mut children, bytes);
            }
            BandAction::Block(bytes) => {
                debug!(target: "bs", "above band, blocking {} kB", bytes / 1024);
                if let Err(e) = block_ram(&mut children, bytes, cfg.fillup_size) {
                    warn!(target: "bs", "no more blockers will be added: {e}");
                }
            }
            BandAction::Hold => {}
            BandAction::InBand => {
                if !initialized {
                    let _ = init_tx.send(());
                    initialized = true;
                }
            }
        }

        sys::sleep_while(cfg.evaluation_period, alive);
    }

    // Dropping the children force-kills them.
    children.clear();
}

/// Kill the most recently added children until `release_size` bytes are
/// freed or none are left.
fn release_ram(children: &mut Vec<FillUpProcess>, release_size: usize) {
    let mut released = 0usize;
    while released < release_size {
        match children.pop() {
            Some(child) => released += child.fillup_size,
            None => break,
        }
    }
    debug!(target: "bs", "released {} kB", released / 1024);
}

/// Spawn `request / fillup_size` children, each holding one fill-up unit of
/// dirty memory. Stops adding children on the first failed spawn.
fn block_ram(
    children: &mut Vec<FillUpProcess>,
    request: usize,
    fillup_size: usize,
) -> Result<()> {
    let needed = request / fillup_size;
    for index in 1..=needed {
        children.push(spawn_fillup_child(fillup_size, index)?);
    }
    debug!(target: "bs", "blocked {} kB", needed * fillup_size / 1024);
    Ok(())
}

fn spawn_fillup_child(fillup_size: usize, index: usize) -> Result<FillUpProcess> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::Sys(io::Error::last_os_error()));
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    match unsafe { libc::fork() } {
        -1 => {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            Err(Error::Sys(err))
        }
        0 => fillup_child(read_fd, write_fd, fillup_size, index),
        pid => {
            unsafe {
                libc::close(write_fd);
            }
            let status = read_child_status(read_fd);
            unsafe {
                libc::close(read_fd);
            }
            match status {
                Some(0) => Ok(FillUpProcess {
                    pid,
                    fillup_size,
                }),
                _ => {
                    // The child posted a failure or died before reporting.
                    sys::kill_and_reap(pid);
                    Err(Error::BlockerChild)
                }
            }
        }
    }
}

fn read_child_status(read_fd: libc::c_int) -> Option<u8> {
    let mut byte = [0u8; 1];
    loop {
        let n = unsafe { libc::read(read_fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
        if n == 1 {
            return Some(byte[0]);
        }
        if n == 0 {
            return None;
        }
        if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return None;
        }
    }
}

/// Child side: map and dirty one fill-up unit, report exactly once over the
/// pipe, then sleep until killed. Only async-signal-safe calls are allowed
/// here; the parent process is multi-threaded.
fn fillup_child(read_fd: libc::c_int, write_fd: libc::c_int, fillup_size: usize, index: usize) -> ! {
    unsafe {
        libc::close(read_fd);

        let mem = libc::mmap(
            std::ptr::null_mut(),
            fillup_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        );
        if mem == libc::MAP_FAILED {
            let failure = [1u8];
            libc::write(write_fd, failure.as_ptr() as *const libc::c_void, 1);
            libc::_exit(1);
        }

        // Unique non-trivial content per page, so neither deduplication nor
        // compression can collapse the blocked memory.
        let page = {
            let res = libc::sysconf(libc::_SC_PAGESIZE);
            if res > 0 { res as usize } else { 4096 }
        };
        let mut offset = 0usize;
        while offset < fillup_size {
            *((mem as *mut u8).add(offset) as *mut usize) = index.wrapping_mul(offset);
            offset += page;
        }

        let success = [0u8];
        libc::write(write_fd, success.as_ptr() as *const libc::c_void, 1);

        loop {
            libc::pause();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    fn band() -> BlockingSetConfig {
        BlockingSetConfig {
            fillup_size: 32 * MIB,
            min_available: 256 * MIB,
            max_available: 288 * MIB,
            evaluation_period: Duration::from_millis(10),
        }
    }

    #[test]
    fn parses_mem_available_line() {
        let meminfo = "MemTotal:       16316420 kB\n\
                       MemFree:          820736 kB\n\
                       MemAvailable:    5030528 kB\n\
                       Buffers:          214224 kB\n";
        assert_eq!(parse_available_mem(meminfo), Some(5030528 * 1024));
    }

    #[test]
    fn missing_mem_available_line_is_none() {
        assert_eq!(parse_available_mem("MemTotal: 1 kB\n"), None);
        assert_eq!(parse_available_mem(""), None);
    }

    #[test]
    fn real_meminfo_has_mem_available() {
        let content = std::fs::read_to_string(MEMINFO_PATH).unwrap();
        assert!(parse_available_mem(&content).unwrap() > 0);
    }

    #[test]
    fn in_band_means_no_action() {
        let cfg = band();
        let goal = cfg.min_available + (cfg.max_available - cfg.min_available) / 2;
        assert_eq!(plan_band_action(goal, &cfg), BandAction::InBand);
        assert_eq!(plan_band_action(cfg.min_available, &cfg), BandAction::InBand);
        assert_eq!(plan_band_action(cfg.max_available, &cfg), BandAction::InBand);
    }

    #[test]
    fn below_band_releases_up_to_goal() {
        let cfg = band();
        let goal = cfg.min_available + (cfg.max_available - cfg.min_available) / 2;
        let available = cfg.min_available - 10 * MIB;
        assert_eq!(
            plan_band_action(available, &cfg),
            BandAction::Release(goal - available)
        );
    }

    #[test]
    fn above_band_blocks_three_quarters_of_excess() {
        let cfg = band();
        let goal = cfg.min_available + (cfg.max_available - cfg.min_available) / 2;
        // Four fill-up units above goal: three quarters of that makes
        // exactly three children on the first pass.
        let available = goal + 4 * cfg.fillup_size;
        match plan_band_action(available, &cfg) {
            BandAction::Block(bytes) => {
                assert_eq!(bytes, 3 * cfg.fillup_size);
                assert_eq!(bytes / cfg.fillup_size, 3);
            }
            other => panic!("expected Block, got {other:?}"),
        }
    }

    #[test]
    fn tiny_excess_above_band_holds() {
        let cfg = band();
        let available = cfg.max_available + 1;
        // (available - goal) * 3/4 is below one fill-up unit here.
        assert_eq!(plan_band_action(available, &cfg), BandAction::Hold);
    }

    #[test]
    fn release_pops_most_recent_children_first() {
        let mut children = vec![
            FillUpProcess {
                pid: 0,
                fillup_size: MIB,
            },
            FillUpProcess {
                pid: 0,
                fillup_size: MIB,
            },
            FillUpProcess {
                pid: 0,
                fillup_size: MIB,
            },
        ];
        release_ram(&mut children, 2 * MIB);
        assert_eq!(children.len(), 1);
        release_ram(&mut children, 10 * MIB);
        assert!(children.is_empty());
    }

    #[test]
    #[ignore] // Forks real children; run with: cargo test -- --ignored
    fn fillup_children_spawn_and_die() {
        let mut children = Vec::new();
        block_ram(&mut children, 2 * MIB, MIB).unwrap();
        assert_eq!(children.len(), 2);
        children.clear();
    }
}
