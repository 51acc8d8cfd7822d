//! Target files and the target registry.
//!
//! A target is a shared-mapped file whose cache residency the attack
//! observes. Depending on the kind, the observable is the whole file, a set
//! of individual pages, or one or more page sequences. Targets are
//! registered before the attack starts and are immutable afterwards except
//! for their last-sample state.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mapping::{Advice, FileMapping};
use crate::profile::PageSequence;

/// One monitored page of a target file.
#[derive(Debug)]
pub struct TargetPage {
    /// Page offset inside the file.
    pub offset: usize,
    /// When set, a cache hit on this page is recorded but never triggers an
    /// eviction pass.
    pub no_eviction: bool,
    last_sample_time_us: AtomicU64,
}

impl TargetPage {
    fn new(offset: usize, no_eviction: bool) -> Self {
        Self {
            offset,
            no_eviction,
            last_sample_time_us: AtomicU64::new(0),
        }
    }

    /// Unix timestamp (µs) of the most recent residency sample of this page.
    pub fn last_sample_time_us(&self) -> u64 {
        self.last_sample_time_us.load(Ordering::Relaxed)
    }

    pub(crate) fn record_sample_time(&self, ts_us: u64) {
        self.last_sample_time_us.store(ts_us, Ordering::Relaxed);
    }
}

/// What part of a target file the attack observes.
#[derive(Debug)]
pub enum TargetKind {
    /// The whole file.
    File,
    /// An ordered collection of individual pages.
    Pages(Vec<TargetPage>),
    /// One page sequence.
    Sequence(PageSequence),
    /// An ordered collection of page sequences.
    Sequences(Vec<PageSequence>),
}

/// Readahead trigger window around a target page, split into pages behind
/// and ahead of the target. The default split matches the Linux readahead
/// heuristic; it is empirical, not a law.
#[derive(Debug, Clone, Copy)]
pub struct RaWindow {
    /// Total window span in pages.
    pub total: usize,
    /// Pages behind the target that can trigger readahead.
    pub back: usize,
    /// Pages ahead of the target that can trigger readahead.
    pub front: usize,
}

impl RaWindow {
    /// Default split for a window of `total` pages: `total/2 - 1` behind,
    /// `total/2` ahead.
    pub fn from_total(total: usize) -> Self {
        Self {
            total,
            back: (total / 2).saturating_sub(1),
            front: total / 2,
        }
    }
}

/// Snapshot of a target's last residency sample.
#[derive(Debug, Clone, Default)]
pub struct SampleSnapshot {
    /// One byte per page of the file; bit 0 set means cached at sample time.
    pub status: Vec<u8>,
    /// Unix timestamp (µs) of the sample.
    pub time_us: u64,
}

#[derive(Debug, Default)]
struct SampleState {
    status: Vec<u8>,
    time_us: u64,
}

/// A registered target file.
pub struct TargetFile {
    path: PathBuf,
    mapping: Arc<FileMapping>,
    kind: TargetKind,
    sample: Mutex<SampleState>,
}

impl TargetFile {
    /// Map `path` shared read-only and register it as a whole-file target.
    /// The mapping is advised `Random` so monitoring does not trigger
    /// readahead by itself.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let path = fs::canonicalize(path).map_err(|e| Error::io(path, e))?;
        let mapping = FileMapping::map_file(&path)?;
        if let Err(e) = mapping.advise(0, 0, Advice::Random) {
            log::warn!(target: "targets", "advise(Random) failed for {}: {e}", path.display());
        }
        let pages = mapping.size_pages();
        Ok(Self {
            path,
            mapping: Arc::new(mapping),
            kind: TargetKind::File,
            sample: Mutex::new(SampleState {
                status: vec![0; pages],
                time_us: 0,
            }),
        })
    }

    /// Absolute path of the target file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in pages.
    pub fn size_pages(&self) -> usize {
        self.mapping.size_pages()
    }

    /// The underlying shared mapping.
    pub fn mapping(&self) -> &FileMapping {
        &self.mapping
    }

    pub(crate) fn mapping_arc(&self) -> Arc<FileMapping> {
        Arc::clone(&self.mapping)
    }

    /// The observed part of the file.
    pub fn kind(&self) -> &TargetKind {
        &self.kind
    }

    /// Whether the whole file is the target.
    pub fn is_whole_file(&self) -> bool {
        matches!(self.kind, TargetKind::File)
    }

    /// The monitored pages, if this is a pages target.
    pub fn target_pages(&self) -> Option<&[TargetPage]> {
        match &self.kind {
            TargetKind::Pages(pages) => Some(pages),
            _ => None,
        }
    }

    /// The monitored sequence, if this is a sequence target.
    pub fn target_sequence(&self) -> Option<PageSequence> {
        match &self.kind {
            TargetKind::Sequence(seq) => Some(*seq),
            _ => None,
        }
    }

    /// Monitor an explicit set of pages. Replaces the current kind.
    pub fn set_target_pages(&mut self, pages: &[(usize, bool)]) -> Result<()> {
        let size_pages = self.size_pages();
        for &(offset, _) in pages {
            if offset >= size_pages {
                return Err(Error::TargetOutOfBounds {
                    path: self.path.clone(),
                    offset,
                    size_pages,
                });
            }
        }
        self.kind = TargetKind::Pages(
            pages
                .iter()
                .map(|&(offset, no_eviction)| TargetPage::new(offset, no_eviction))
                .collect(),
        );
        Ok(())
    }

    /// Monitor one page sequence. Replaces the current kind.
    pub fn set_target_sequence(&mut self, offset: usize, length: usize) -> Result<()> {
        self.check_sequence(PageSequence { offset, length })?;
        self.kind = TargetKind::Sequence(PageSequence { offset, length });
        Ok(())
    }

    /// Monitor several page sequences. Replaces the current kind.
    pub fn set_target_sequences(&mut self, sequences: &[PageSequence]) -> Result<()> {
        for seq in sequences {
            self.check_sequence(*seq)?;
        }
        self.kind = TargetKind::Sequences(sequences.to_vec());
        Ok(())
    }

    fn check_sequence(&self, seq: PageSequence) -> Result<()> {
        let size_pages = self.size_pages();
        if seq.length == 0 || seq.offset >= size_pages || seq.length > size_pages - seq.offset {
            return Err(Error::TargetOutOfBounds {
                path: self.path.clone(),
                offset: seq.offset + seq.length.saturating_sub(1),
                size_pages,
            });
        }
        Ok(())
    }

    /// Clone of the last residency sample.
    pub fn sample_snapshot(&self) -> SampleSnapshot {
        let state = self.sample.lock().unwrap();
        SampleSnapshot {
            status: state.status.clone(),
            time_us: state.time_us,
        }
    }

    pub(crate) fn store_sample_page(&self, offset: usize, status: u8, ts_us: u64) {
        let mut state = self.sample.lock().unwrap();
        if let Some(slot) = state.status.get_mut(offset) {
            *slot = status;
        }
        state.time_us = ts_us;
    }

    pub(crate) fn store_sample_range(&self, offset: usize, status: &[u8], ts_us: u64) {
        let mut state = self.sample.lock().unwrap();
        let end = (offset + status.len()).min(state.status.len());
        if offset < end {
            state.status[offset..end].copy_from_slice(&status[..end - offset]);
        }
        state.time_us = ts_us;
    }

    /// Set every page inside the readahead trigger window of the target to
    /// `val` in `status`. The target pages themselves are not touched.
    pub(crate) fn mask_readahead(&self, status: &mut [u8], window: RaWindow, val: u8) {
        match &self.kind {
            TargetKind::File => {}
            TargetKind::Pages(pages) => {
                for page in pages {
                    mark_window_back(status, page.offset, window, val);
                    mark_window_front(status, page.offset, window, val);
                }
            }
            TargetKind::Sequence(seq) => mask_sequence_window(status, *seq, window, val),
            TargetKind::Sequences(seqs) => {
                for seq in seqs {
                    mask_sequence_window(status, *seq, window, val);
                }
            }
        }
    }

    /// Set the target pages themselves to `val` in `status`.
    pub(crate) fn mask_target_pages(&self, status: &mut [u8], val: u8) {
        match &self.kind {
            TargetKind::File => {}
            TargetKind::Pages(pages) => {
                for page in pages {
                    if let Some(slot) = status.get_mut(page.offset) {
                        *slot = val;
                    }
                }
            }
            TargetKind::Sequence(seq) => mask_sequence_pages(status, *seq, val),
            TargetKind::Sequences(seqs) => {
                for seq in seqs {
                    mask_sequence_pages(status, *seq, val);
                }
            }
        }
    }
}

fn mask_sequence_window(status: &mut [u8], seq: PageSequence, window: RaWindow, val: u8) {
    if seq.length == 0 {
        return;
    }
    mark_window_back(status, seq.offset, window, val);
    mark_window_front(status, seq.offset + seq.length - 1, window, val);
}

fn mask_sequence_pages(status: &mut [u8], seq: PageSequence, val: u8) {
    let end = (seq.offset + seq.length).min(status.len());
    for slot in &mut status[seq.offset.min(end)..end] {
        *slot = val;
    }
}

fn mark_window_back(status: &mut [u8], offset: usize, window: RaWindow, val: u8) {
    let start = if offset < window.back {
        0
    } else {
        offset - window.back
    };
    let end = offset.min(status.len());
    for slot in &mut status[start.min(end)..end] {
        *slot = val;
    }
}

fn mark_window_front(status: &mut [u8], offset: usize, window: RaWindow, val: u8) {
    if status.is_empty() {
        return;
    }
    let last = status.len() - 1;
    if offset >= last {
        return;
    }
    let end = (offset + window.front).min(last);
    for slot in &mut status[offset + 1..=end] {
        *slot = val;
    }
}

/// A parsed target block from a configuration file, before mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TargetSpec {
    pub path: PathBuf,
    pub pages: Vec<(usize, bool)>,
}

/// Parse a targets configuration file (see the crate docs for the format):
/// a file path line, one or more `<offset_hex> <no_eviction>` lines, and a
/// terminating blank line per target. A trailing newline is required.
pub(crate) fn parse_targets_config(content: &str) -> Result<Vec<TargetSpec>> {
    if !content.is_empty() && !content.ends_with('\n') {
        return Err(Error::TargetConfig("missing trailing newline".into()));
    }

    let mut specs = Vec::new();
    let mut current: Option<TargetSpec> = None;

    for (lineno, line) in content.lines().enumerate() {
        let lineno = lineno + 1;
        if line.is_empty() {
            match current.take() {
                Some(spec) if spec.pages.is_empty() => {
                    return Err(Error::TargetConfig(format!(
                        "line {lineno}: target {} has no pages",
                        spec.path.display()
                    )));
                }
                Some(spec) => specs.push(spec),
                // Stray blank lines between targets are tolerated.
                None => {}
            }
            continue;
        }

        match &mut current {
            None => {
                current = Some(TargetSpec {
                    path: PathBuf::from(line),
                    pages: Vec::new(),
                });
            }
            Some(spec) => {
                let mut fields = line.split_whitespace();
                let (offset_str, flag_str) = match (fields.next(), fields.next(), fields.next()) {
                    (Some(o), Some(f), None) => (o, f),
                    _ => {
                        return Err(Error::TargetConfig(format!(
                            "line {lineno}: expected `<offset_hex> <no_eviction>`"
                        )));
                    }
                };
                let offset_str = offset_str
                    .strip_prefix("0x")
                    .unwrap_or(offset_str);
                let offset = usize::from_str_radix(offset_str, 16).map_err(|_| {
                    Error::TargetConfig(format!("line {lineno}: bad page offset `{offset_str}`"))
                })?;
                let no_eviction = match flag_str {
                    "0" => false,
                    "1" => true,
                    other => {
                        return Err(Error::TargetConfig(format!(
                            "line {lineno}: no_eviction must be 0 or 1, got `{other}`"
                        )));
                    }
                };
                spec.pages.push((offset, no_eviction));
            }
        }
    }

    if let Some(spec) = current {
        return Err(Error::TargetConfig(format!(
            "target {} not terminated by a blank line",
            spec.path.display()
        )));
    }

    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_targets() {
        let config = "/lib/a.so\n200 0\n0x1f 1\n\n/lib/b.so\n3 0\n\n";
        let specs = parse_targets_config(config).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].path, PathBuf::from("/lib/a.so"));
        assert_eq!(specs[0].pages, vec![(0x200, false), (0x1f, true)]);
        assert_eq!(specs[1].pages, vec![(3, false)]);
    }

    #[test]
    fn missing_no_eviction_field_is_an_error() {
        let config = "/lib/a.so\ndeadbeef\n\n";
        assert!(parse_targets_config(config).is_err());
    }

    #[test]
    fn bad_no_eviction_value_is_an_error() {
        let config = "/lib/a.so\n10 2\n\n";
        assert!(parse_targets_config(config).is_err());
    }

    #[test]
    fn unterminated_block_is_an_error() {
        let config = "/lib/a.so\n10 0\n";
        assert!(parse_targets_config(config).is_err());
    }

    #[test]
    fn missing_trailing_newline_is_an_error() {
        let config = "/lib/a.so\n10 0\n";
        let config = &config[..config.len() - 1];
        assert!(parse_targets_config(config).is_err());
    }

    #[test]
    fn empty_config_is_empty() {
        assert!(parse_targets_config("").unwrap().is_empty());
    }

    #[test]
    fn window_split_matches_readahead_heuristic() {
        let w = RaWindow::from_total(32);
        assert_eq!(w.back, 15);
        assert_eq!(w.front, 16);
        let tiny = RaWindow::from_total(1);
        assert_eq!(tiny.back, 0);
        assert_eq!(tiny.front, 0);
    }

    #[test]
    fn back_window_clamps_to_file_start() {
        let mut status = vec![0u8; 64];
        // Offset inside the back span: everything before it is marked.
        mark_window_back(&mut status, 8, RaWindow::from_total(32), 1);
        assert!(status[..8].iter().all(|&b| b == 1));
        assert!(status[8..].iter().all(|&b| b == 0));

        // Offset between the back span and the total window size: exactly
        // `back` pages are marked, no clamping.
        let mut status = vec![0u8; 64];
        mark_window_back(&mut status, 20, RaWindow::from_total(32), 1);
        assert!(status[..5].iter().all(|&b| b == 0));
        assert!(status[5..20].iter().all(|&b| b == 1));
        assert_eq!(status[20], 0);

        let mut status = vec![0u8; 64];
        mark_window_back(&mut status, 40, RaWindow::from_total(32), 1);
        assert!(status[..25].iter().all(|&b| b == 0));
        assert!(status[25..40].iter().all(|&b| b == 1));
        assert_eq!(status[40], 0);
    }

    #[test]
    fn front_window_clamps_to_file_end() {
        let mut status = vec![0u8; 20];
        mark_window_front(&mut status, 10, RaWindow::from_total(32), 1);
        assert_eq!(status[10], 0, "target page itself is excluded");
        assert!(status[11..20].iter().all(|&b| b == 1));

        let mut status = vec![0u8; 40];
        mark_window_front(&mut status, 10, RaWindow::from_total(8), 1);
        assert!(status[11..=14].iter().all(|&b| b == 1));
        assert!(status[15..].iter().all(|&b| b == 0));
    }
}
