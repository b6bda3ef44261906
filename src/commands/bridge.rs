//! The `bridge` subcommand: run the PTY bridge until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::bridge::{run_device_bridge, BridgeOptions, BridgeProgress};
use crate::cancel::CancelToken;
use crate::error::BridgeError;
use crate::gatt::central::BtleTransport;
use crate::gatt::{StreamMode, SubscribeOptions};

/// Built-in transform: forwards notification bytes to the PTY verbatim and
/// PTY bytes to the first writable characteristic named by the script.
const PASSTHROUGH_SCRIPT: &str = include_str!("../../lua/passthrough.lua");

/// Caller-facing bridge parameters, assembled by the CLI layer.
pub struct BridgeArgs {
    pub address: String,
    pub script_path: Option<PathBuf>,
    pub symlink: Option<PathBuf>,
    pub service: Option<String>,
    pub characteristics: Vec<String>,
    pub mode: StreamMode,
    pub max_rate: Duration,
    pub read_cap: usize,
    pub write_cap: usize,
}

/// Run the bridge until `token` is cancelled or the link drops.
///
/// Returns `Ok` on user cancellation; `connection lost` and setup failures
/// surface as errors with one-line messages.
///
/// # Errors
///
/// Script file access, transport, PTY, and script runtime failures.
pub fn run(token: &CancelToken, args: BridgeArgs) -> Result<()> {
    let (script_source, script_name) = match &args.script_path {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read script {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "script".into());
            (source, name)
        }
        None => (PASSTHROUGH_SCRIPT.to_string(), "passthrough.lua".into()),
    };

    let mut options = BridgeOptions::new(&args.address);
    options.script_source = script_source;
    options.script_name = script_name;
    options.tty_symlink_path = args.symlink.clone();
    options.stream_mode = args.mode;
    options.max_rate = args.max_rate;
    options.read_cap = args.read_cap;
    options.write_cap = args.write_cap;
    if !args.characteristics.is_empty() || args.service.is_some() {
        options.subscriptions = vec![SubscribeOptions {
            service_uuid: args.service.clone().unwrap_or_default(),
            characteristic_uuids: args.characteristics.clone(),
        }];
    }

    let transport = BtleTransport::new()?;

    let result = run_device_bridge(
        token,
        &transport,
        options,
        |progress| match progress {
            BridgeProgress::Connecting => eprintln!("Connecting to {}...", args.address),
            BridgeProgress::Running => {}
            BridgeProgress::ShuttingDown => eprintln!("Shutting down..."),
        },
        |handle| {
            println!("{}", handle.tty_path());
            if let Some(symlink) = &args.symlink {
                eprintln!("Serial device ready: {} -> {}", symlink.display(), handle.tty_path());
            } else {
                eprintln!("Serial device ready: {}", handle.tty_path());
            }
            eprintln!("Press Ctrl-C to stop.");
            handle.wait();
            let stats = handle.pty_stats();
            log::info!(
                "bridge finished: {} bytes to tty, {} bytes from tty, {} dropped",
                stats.bytes_written,
                stats.bytes_read,
                stats.dropped_read + stats.dropped_write
            );
        },
    );

    match result {
        Ok(()) => Ok(()),
        // User interrupt is a clean exit.
        Err(BridgeError::Cancelled) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("{}", e.user_message())),
    }
}
