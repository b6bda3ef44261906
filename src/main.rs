//! bletty - expose a BLE peripheral's GATT characteristics as a local PTY
//! serial device.
//!
//! This is the binary entry point. See the `bletty` library for the core
//! functionality.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bletty::commands;
use bletty::gatt::StreamMode;
use bletty::CancelToken;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

/// mimalloc performs better than the system allocator under the
/// multi-threaded churn of the PTY and notification workers.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "bletty")]
#[command(version)]
#[command(about = "Bridge a BLE peripheral to a local PTY serial device")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby BLE peripherals
    Scan {
        /// Scan window in seconds
        #[arg(long, default_value_t = 5)]
        duration: u64,
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
    /// Connect and print the GATT profile
    Inspect {
        /// Peripheral address or advertised name
        address: String,
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
    /// Read one characteristic and print its value as hex
    Read {
        address: String,
        /// Characteristic UUID (short or long form)
        characteristic: String,
    },
    /// Write hex bytes to one characteristic
    Write {
        address: String,
        characteristic: String,
        /// Bytes as hex (e.g. "01ff", "0x01ff", "01:ff")
        hex: String,
        /// Use write-without-response
        #[arg(long)]
        no_response: bool,
    },
    /// Stream notification records to stdout
    Subscribe {
        address: String,
        /// Characteristic UUIDs, comma-separated; defaults to every
        /// notifying characteristic
        #[arg(long, value_delimiter = ',')]
        chars: Vec<String>,
        /// Delivery pattern: every-update, batched, aggregated-latest
        #[arg(long, default_value = "every-update")]
        mode: StreamMode,
        /// Minimum milliseconds between records (batched/aggregated)
        #[arg(long, default_value_t = 100)]
        max_rate: u64,
    },
    /// Run the PTY bridge until interrupted
    Bridge {
        address: String,
        /// Lua transform script; defaults to the built-in NUS passthrough
        #[arg(long)]
        script: Option<String>,
        /// Create a stable symlink to the PTY slave path
        #[arg(long)]
        symlink: Option<String>,
        /// Service UUID to subscribe (all notifying characteristics)
        #[arg(long)]
        service: Option<String>,
        /// Characteristic UUIDs, comma-separated
        #[arg(long, value_delimiter = ',')]
        chars: Vec<String>,
        /// Delivery pattern: every-update, batched, aggregated-latest
        #[arg(long, default_value = "every-update")]
        mode: StreamMode,
        /// Minimum milliseconds between records (batched/aggregated)
        #[arg(long, default_value_t = 100)]
        max_rate: u64,
        /// PTY read ring capacity in bytes
        #[arg(long, default_value_t = 4096)]
        read_cap: usize,
        /// PTY write ring capacity in bytes
        #[arg(long, default_value_t = 4096)]
        write_cap: usize,
    },
}

/// Route logging to a file when configured, stderr otherwise. The bridge
/// shares the terminal with its own status output, so `BLETTY_LOG_FILE`
/// keeps the two apart.
fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    if let Ok(path) = std::env::var("BLETTY_LOG_FILE") {
        match std::fs::File::create(&path) {
            Ok(file) => {
                env_logger::Builder::from_env(env)
                    .target(env_logger::Target::Pipe(Box::new(file)))
                    .format_timestamp_millis()
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("warning: cannot open log file {path}: {e}");
            }
        }
    }
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .init();
}

/// Register INT/TERM/HUP handlers and bridge them into the token.
///
/// signal-hook only flips an atomic from the handler context; a small
/// watcher thread turns that into a token cancel so blocked waiters wake
/// promptly.
fn install_signal_handlers(token: &CancelToken) -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;

    let signalled = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&signalled))?;
    flag::register(SIGTERM, Arc::clone(&signalled))?;
    flag::register(SIGHUP, Arc::clone(&signalled))?;

    let token = token.clone();
    std::thread::Builder::new()
        .name("signal-watch".into())
        .spawn(move || loop {
            if signalled.load(Ordering::Relaxed) {
                log::info!("interrupt received, shutting down");
                token.cancel();
                return;
            }
            if token.wait_timeout(Duration::from_millis(50)) {
                return;
            }
        })?;
    Ok(())
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn main() {
    init_logging();

    let cli = Cli::parse();
    let token = CancelToken::new();
    if let Err(e) = install_signal_handlers(&token) {
        eprintln!("error: failed to install signal handlers: {e}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Scan { duration, json } => {
            commands::scan::run(&token, Duration::from_secs(duration), json)
        }
        Commands::Inspect { address, json } => commands::inspect::run(&token, &address, json),
        Commands::Read {
            address,
            characteristic,
        } => commands::readwrite::read(&token, &address, &characteristic),
        Commands::Write {
            address,
            characteristic,
            hex,
            no_response,
        } => commands::readwrite::write(&token, &address, &characteristic, &hex, no_response),
        Commands::Subscribe {
            address,
            chars,
            mode,
            max_rate,
        } => commands::subscribe::run(
            &token,
            &address,
            chars,
            mode,
            Duration::from_millis(max_rate),
        ),
        Commands::Bridge {
            address,
            script,
            symlink,
            service,
            chars,
            mode,
            max_rate,
            read_cap,
            write_cap,
        } => commands::bridge::run(
            &token,
            commands::bridge::BridgeArgs {
                address,
                script_path: script.as_deref().map(expand_path),
                symlink: symlink.as_deref().map(expand_path),
                service,
                characteristics: chars,
                mode,
                max_rate: Duration::from_millis(max_rate),
                read_cap,
                write_cap,
            },
        ),
    };

    // Let background workers observe the cancel before process exit.
    token.cancel();

    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
