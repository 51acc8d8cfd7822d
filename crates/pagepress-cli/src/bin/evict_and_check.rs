//! Single-page hit tracer.
//!
//! Monitors the target pages listed in a configuration file and, whenever a
//! monitored page shows up in the page cache (someone accessed it), evicts
//! it again and prints a trace line. Swapping should be disabled while this
//! runs.
//!
//! Trace output, one line per detected hit:
//! `<last_sample_time_us>;<file_path>;<page_offset>`

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use pagepress_core::{Attack, AttackConfig, SampleOutcome};

/// Pause between two sampling rounds.
const SAMPLE_WAIT: Duration = Duration::from_micros(100);

#[derive(Parser)]
#[command(name = "evict_and_check")]
#[command(about = "Trace accesses to shared file pages via page-cache eviction")]
#[command(version = pagepress_core::VERSION)]
struct Cli {
    /// Configuration file with the file/page pairs whose accesses should be
    /// monitored
    targets_config: PathBuf,

    /// Show more information
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = pagepress_core::install_signal_handlers() {
        eprintln!("[FAIL] installing signal handlers: {e}");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[FAIL] {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> pagepress_core::Result<()> {
    let mut attack = Attack::new(AttackConfig::default())?;
    attack.add_targets_from_file(&cli.targets_config)?;
    attack.start()?;

    if cli.verbose {
        let (files, bytes) = attack.working_set_summary();
        println!("[INFO] initial working set consists of {files} files ({bytes} bytes resident)");
        println!("[OK] ready\n");
    }

    let mut hits = 0u64;
    let mut eviction_time_sum_ns = 0u64;
    let mut eviction_bytes_sum = 0u64;

    while pagepress_core::running() {
        match attack.sample_and_evict_pages()? {
            SampleOutcome::Idle => {}
            SampleOutcome::Evicted => {
                let stats = attack.eviction_stats();
                hits += 1;
                eviction_time_sum_ns += stats.last_eviction_time_ns;
                eviction_bytes_sum += stats.last_eviction_accessed_bytes as u64;
                if cli.verbose {
                    println!(
                        "[EVENT] hit {hits} (eviction time: {} ns, accessed eviction set: {} kB)",
                        stats.last_eviction_time_ns,
                        stats.last_eviction_accessed_bytes / 1024
                    );
                }
                print_hit_trace(&attack);
                println!();
            }
        }
        std::thread::sleep(SAMPLE_WAIT);
    }

    if hits > 0 && cli.verbose {
        println!(
            "[INFO] mean eviction time per hit: {:.0} ns",
            eviction_time_sum_ns as f64 / hits as f64
        );
        println!(
            "[INFO] mean accessed eviction set per hit: {:.0} kB",
            eviction_bytes_sum as f64 / 1024.0 / hits as f64
        );
    }
    Ok(())
}

fn print_hit_trace(attack: &Attack) {
    for target in attack.targets() {
        let Some(pages) = target.target_pages() else {
            continue;
        };
        let snapshot = target.sample_snapshot();
        for page in pages {
            if snapshot.status.get(page.offset).is_some_and(|s| s & 1 == 1) {
                println!(
                    "{};{};{}",
                    page.last_sample_time_us(),
                    target.path().display(),
                    page.offset
                );
            }
        }
    }
}
