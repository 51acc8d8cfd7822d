//! # pagepress-core
//!
//! **The OS page cache as a side channel.**
//!
//! `pagepress-core` observes the cached/uncached state of individual pages
//! of shared, memory-mapped files and actively evicts target pages to
//! induce measurable transitions. Around the eviction driver it runs three
//! supporting sets: a *blocking set* of forked children pinning
//! `MemAvailable` into a narrow band, a *working set* of re-touched hot
//! file pages that shields the rest of the system from the pressure, and a
//! *suppress set* that keeps kernel readahead from re-caching the targets.
//!
//! ## Quick start
//!
//! ```no_run
//! use pagepress_core::{Attack, AttackConfig, SampleOutcome};
//!
//! fn main() -> pagepress_core::Result<()> {
//!     let mut attack = Attack::new(AttackConfig::default())?;
//!     attack.add_targets_from_file("targets.conf".as_ref())?;
//!     attack.start()?;
//!
//!     while pagepress_core::running() {
//!         match attack.sample_and_evict_pages()? {
//!             SampleOutcome::Idle => {}
//!             SampleOutcome::Evicted => println!("hit"),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Residency sampling → page-sequence profiling → the four sets →
//! sample-then-evict entry points. Swap must be disabled; the engine works
//! by keeping the kernel's page replacement on the verge of action, which
//! only translates into file-page eviction when nothing can be swapped out.
//!
//! Linux only. The residency source is chosen once at startup via
//! [`CacheSampler`] and never changed mid-run.

pub mod attack;
pub mod blocking;
pub mod error;
pub mod eviction;
pub mod mapping;
pub mod profile;
pub mod residency;
pub mod suppress;
pub mod sys;
pub mod target;
pub mod working;

pub use attack::{Attack, AttackConfig, SampleOutcome};
pub use blocking::BlockingSetConfig;
pub use error::{Error, Result};
pub use eviction::{EvictionConfig, EvictionStats};
pub use mapping::{Advice, FileMapping, create_random_file};
pub use profile::{PageSequence, ProfiledRuns, profile_runs};
pub use residency::{CacheSampler, count_cached};
pub use suppress::SuppressSetConfig;
pub use sys::{install_signal_handlers, request_stop, running};
pub use target::{RaWindow, SampleSnapshot, TargetFile, TargetKind, TargetPage};
pub use working::WorkingSetConfig;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
