//! Integration tests for the attack lifecycle.
//!
//! These run with every subsystem that would pressure the machine turned
//! off: the eviction set is anonymous (a virtual reservation, nothing is
//! touched unless an eviction pass runs) and blocking/working/suppress
//! sets are disabled. The full eviction path needs a dedicated machine
//! with swap disabled and is covered by the `#[ignore]`d test at the end.

use std::io::Write;
use std::path::PathBuf;

use pagepress_core::{Attack, AttackConfig, EvictionConfig, SampleOutcome};

fn quiet_config() -> AttackConfig {
    AttackConfig {
        use_blocking_set: false,
        use_working_set: false,
        use_suppress_set: false,
        eviction: EvictionConfig {
            use_anon_memory: true,
            ..EvictionConfig::default()
        },
        ..AttackConfig::default()
    }
}

fn scratch_target(dir: &tempfile::TempDir, pages: usize) -> PathBuf {
    let path = dir.path().join("target");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(&vec![0xEEu8; pages * pagepress_core::sys::page_size()])
        .unwrap();
    f.sync_all().unwrap();
    path
}

#[test]
fn lifecycle_start_sample_stop() {
    let dir = tempfile::tempdir().unwrap();
    let target_path = scratch_target(&dir, 8);
    let config_path = dir.path().join("targets.conf");
    // Freshly written pages are cached, so only a no_eviction page keeps
    // this test from triggering a full eviction pass.
    std::fs::write(&config_path, format!("{}\n2 1\n\n", target_path.display())).unwrap();

    let mut attack = Attack::new(quiet_config()).unwrap();
    attack.add_targets_from_file(&config_path).unwrap();
    attack.start().unwrap();

    // Subsystems are off: nothing tracked, no eviction ran yet.
    assert_eq!(attack.working_set_summary(), (0, 0));
    assert_eq!(attack.eviction_stats().last_eviction_accessed_bytes, 0);

    let target = attack.target(&target_path).unwrap();
    assert_eq!(target.size_pages(), 8);

    // The page is cached but flagged no_eviction, so sampling records the
    // hit and stays idle.
    assert_eq!(
        attack.sample_and_evict_pages().unwrap(),
        SampleOutcome::Idle
    );
    let snapshot = target.sample_snapshot();
    assert_eq!(snapshot.status[2] & 1, 1);
    assert!(snapshot.time_us > 0);
    let pages = target.target_pages().unwrap();
    assert!(pages[0].last_sample_time_us() > 0);

    attack.stop();
    // stop is idempotent and Drop tolerates an already-stopped attack.
    attack.stop();
}

#[test]
fn no_eviction_pages_never_trigger_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let target_path = scratch_target(&dir, 4);

    let mut attack = Attack::new(quiet_config()).unwrap();
    let target = attack.add_target_file(&target_path).unwrap();
    target.set_target_pages(&[(1, true)]).unwrap();
    attack.start().unwrap();

    let target = attack.target(&target_path).unwrap();
    for _ in 0..3 {
        target.mapping().touch_page(1);
        assert_eq!(
            attack.sample_and_evict_pages().unwrap(),
            SampleOutcome::Idle
        );
    }
}

#[test]
fn start_twice_is_a_lifecycle_error() {
    let mut attack = Attack::new(quiet_config()).unwrap();
    attack.start().unwrap();
    assert!(attack.start().is_err());
}

#[test]
fn sequence_sampling_requires_a_sequence_target() {
    let dir = tempfile::tempdir().unwrap();
    let target_path = scratch_target(&dir, 4);

    let mut attack = Attack::new(quiet_config()).unwrap();
    attack.add_target_file(&target_path).unwrap();
    attack.start().unwrap();

    let target = attack.target(&target_path).unwrap();
    assert!(attack.sample_and_evict_sequence(&target).is_err());
}

#[test]
fn status_range_reflects_touched_pages() {
    let dir = tempfile::tempdir().unwrap();
    let target_path = scratch_target(&dir, 4);

    let mut attack = Attack::new(quiet_config()).unwrap();
    attack.add_target_file(&target_path).unwrap();
    attack.start().unwrap();

    let target = attack.target(&target_path).unwrap();
    target.mapping().touch_page(3);
    let status = attack.status_range(&target, 0, 4).unwrap();
    assert_eq!(status.len(), 4);
    assert_eq!(status[3] & 1, 1);
    assert!(attack.page_cached(&target, 3).unwrap());
}

/// The full single-target-page eviction path: expects swap to be disabled,
/// enough disk space for a RAM-sized eviction file, and a quiet machine.
#[test]
#[ignore] // Run with: cargo test -- --ignored
fn evicts_a_single_cached_target_page() {
    let dir = tempfile::tempdir().unwrap();
    let target_path = scratch_target(&dir, 0x400);

    let mut attack = Attack::new(AttackConfig {
        use_working_set: false,
        use_suppress_set: false,
        ..AttackConfig::default()
    })
    .unwrap();
    let target = attack.add_target_file(&target_path).unwrap();
    target.set_target_pages(&[(0x200, false)]).unwrap();
    attack.start().unwrap();

    let target = attack.target(&target_path).unwrap();
    target.mapping().touch_page(0x200);

    // Cached page triggers one eviction pass.
    assert_eq!(
        attack.sample_and_evict_pages().unwrap(),
        SampleOutcome::Evicted
    );
    assert!(attack.eviction_stats().last_eviction_accessed_bytes > 0);

    // Immediately afterwards there is nothing left to do.
    assert_eq!(
        attack.sample_and_evict_pages().unwrap(),
        SampleOutcome::Idle
    );
}
