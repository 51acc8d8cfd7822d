//! Thin OS abstraction layer.
//!
//! Page size, total memory, timestamps, child-process control and the
//! process-wide shutdown flag. Everything here is Linux; the attack depends
//! on Linux page-replacement behaviour anyway.

use std::io;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Process-wide run flag. Signal handlers clear it; every long-running loop
/// in the crate checks it once per iteration.
static RUNNING: AtomicBool = AtomicBool::new(true);

/// Whether the process is still supposed to run.
pub fn running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

/// Request a cooperative shutdown of all attack loops.
pub fn request_stop() {
    RUNNING.store(false, Ordering::Relaxed);
}

extern "C" fn quit_handler(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

/// Install `SIGINT`/`SIGQUIT`/`SIGUSR1` handlers that clear the run flag.
pub fn install_signal_handlers() -> io::Result<()> {
    let handler: extern "C" fn(libc::c_int) = quit_handler;
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGQUIT, libc::SIGUSR1] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// System page size in bytes, cached after the first query.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let res = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if res > 0 { res as usize } else { 4096 }
    })
}

/// Total memory in bytes (physical RAM plus swap). The attack requires swap
/// to be disabled, in which case this equals physical RAM.
pub fn total_memory() -> io::Result<usize> {
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let unit = info.mem_unit.max(1) as usize;
    Ok((info.totalram as usize + info.totalswap as usize) * unit)
}

/// Microseconds since the unix epoch.
pub fn unix_ts_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Nanoseconds since the unix epoch.
pub fn unix_ts_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Force-kill a child process and reap it.
pub(crate) fn kill_and_reap(pid: libc::pid_t) {
    unsafe {
        if libc::kill(pid, libc::SIGKILL) == 0 {
            let mut status: libc::c_int = 0;
            libc::waitpid(pid, &mut status, 0);
        }
    }
}

/// Sleep for `period`, waking early once `alive` is cleared or a shutdown is
/// requested. Slices the sleep so teardown does not wait out long periods.
pub(crate) fn sleep_while(period: Duration, alive: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(100);
    let mut remaining = period;
    while !remaining.is_zero() && running() && alive.load(Ordering::Relaxed) {
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert!(ps.is_power_of_two());
    }

    #[test]
    fn total_memory_is_nonzero() {
        assert!(total_memory().unwrap() > 0);
    }

    #[test]
    fn timestamps_are_nonzero() {
        assert!(unix_ts_us() > 0);
        assert!(unix_ts_ns() > 0);
    }

    #[test]
    fn sleep_while_respects_cleared_flag() {
        let alive = AtomicBool::new(false);
        let t0 = std::time::Instant::now();
        sleep_while(Duration::from_secs(10), &alive);
        assert!(t0.elapsed() < Duration::from_secs(1));
    }
}
