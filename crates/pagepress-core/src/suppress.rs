//! The readahead suppress set.
//!
//! For every registered target, the pages that fall inside the readahead
//! trigger window around the target pages are kept hot. If the reclaimer or
//! an unrelated reader faulted one of those pages while it was cold, the
//! kernel's readahead would pull the target pages back into the cache and
//! ruin the signal.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::mapping::FileMapping;
use crate::profile::{PageSequence, profile_runs};
use crate::sys;
use crate::target::{RaWindow, TargetFile};

/// Suppress-set configuration.
#[derive(Debug, Clone)]
pub struct SuppressSetConfig {
    /// Touch pages through `pread` instead of dereferencing the mapping.
    pub use_file_api: bool,
    /// Sleep between two activation passes of a worker thread.
    pub access_period: Duration,
    /// Number of worker threads.
    pub worker_count: usize,
}

impl Default for SuppressSetConfig {
    fn default() -> Self {
        Self {
            use_file_api: true,
            access_period: Duration::from_millis(1),
            worker_count: 6,
        }
    }
}

struct SuppressEntry {
    path: PathBuf,
    mapping: Arc<FileMapping>,
    sequences: Vec<PageSequence>,
}

pub(crate) struct SuppressSet {
    cfg: SuppressSetConfig,
    entries: Vec<SuppressEntry>,
}

impl SuppressSet {
    /// Compute the readahead-danger sequences for every target. Whole-file
    /// targets cannot be suppressed and are skipped with a warning.
    pub(crate) fn build<'a>(
        targets: impl Iterator<Item = &'a Arc<TargetFile>>,
        window: RaWindow,
        cfg: SuppressSetConfig,
    ) -> Self {
        let mut entries = Vec::new();
        for target in targets {
            if target.is_whole_file() {
                warn!(
                    target: "ss",
                    "whole file {} is a target, cannot suppress readahead for it",
                    target.path().display()
                );
                continue;
            }

            let mut mask = vec![0u8; target.size_pages()];
            target.mask_readahead(&mut mask, window, 1);
            // The targets themselves must stay cold.
            target.mask_target_pages(&mut mask, 0);
            let runs = profile_runs(&mask, 1);
            if runs.sequences.is_empty() {
                continue;
            }
            debug!(
                target: "ss",
                "{}: suppressing {} readahead-trigger sequences",
                target.path().display(),
                runs.sequences.len()
            );
            entries.push(SuppressEntry {
                path: target.path().to_path_buf(),
                mapping: target.mapping_arc(),
                sequences: runs.sequences,
            });
        }
        Self { cfg, entries }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Touch every readahead-danger page once.
    pub(crate) fn activate(&self) {
        for entry in &self.entries {
            for seq in &entry.sequences {
                for page in seq.offset..seq.offset + seq.length {
                    if self.cfg.use_file_api {
                        if let Err(e) = entry.mapping.read_page_twice(page) {
                            debug!(
                                target: "ss",
                                "pread failed for {}: {e}",
                                entry.path.display()
                            );
                        }
                    } else {
                        entry.mapping.touch_page(page);
                    }
                }
            }
        }
    }

    /// Spawn the cyclic activation workers.
    pub(crate) fn spawn_workers(
        suppress_set: &Arc<SuppressSet>,
        alive: &Arc<AtomicBool>,
    ) -> Vec<JoinHandle<()>> {
        (0..suppress_set.cfg.worker_count)
            .map(|_| {
                let suppress_set = Arc::clone(suppress_set);
                let alive = Arc::clone(alive);
                std::thread::spawn(move || {
                    while sys::running() && alive.load(Ordering::Relaxed) {
                        suppress_set.activate();
                        sys::sleep_while(suppress_set.cfg.access_period, &alive);
                    }
                })
            })
            .collect()
    }
}
