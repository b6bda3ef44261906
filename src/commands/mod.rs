//! CLI subcommand implementations.
//!
//! Each module maps one subcommand to the library: `scan` and `inspect`
//! are one-shot queries, `read`/`write` touch a single characteristic,
//! `subscribe` streams records to stdout, and `bridge` runs the PTY bridge
//! until interrupted.

pub mod bridge;
pub mod inspect;
pub mod readwrite;
pub mod scan;
pub mod subscribe;

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::cancel::CancelToken;

/// Run a blocking transport operation on a worker thread, racing it
/// against the cancellation token.
///
/// The signal handlers only flip an atomic, so a blocking scan/connect
/// would otherwise ride out its full timeout after a Ctrl-C. Returns
/// `None` when the token fires first; the abandoned worker finishes on its
/// own deadline and drops its resources there. Callers map `None` to a
/// clean exit, matching the interrupt-exits-0 policy.
pub fn run_cancellable<T, F>(token: &CancelToken, op: F) -> Option<Result<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let worker = match thread::Builder::new()
        .name("blocking-op".into())
        .spawn(move || {
            let _ = tx.send(op());
        }) {
        Ok(worker) => worker,
        Err(e) => return Some(Err(e.into())),
    };

    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(result) => {
                let _ = worker.join();
                return Some(result);
            }
            Err(RecvTimeoutError::Timeout) => {
                if token.is_cancelled() {
                    log::debug!("interrupted; abandoning in-flight operation");
                    return None;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
                return Some(Err(anyhow::anyhow!("operation worker terminated")));
            }
        }
    }
}

/// Parse a hex string (optionally `0x`-prefixed, spaces and colons
/// allowed) into bytes.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if cleaned.len() % 2 != 0 {
        bail!("hex input has an odd number of digits");
    }
    let mut bytes = Vec::with_capacity(cleaned.len() / 2);
    for chunk in cleaned.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(chunk).expect("hex chunk is ascii");
        match u8::from_str_radix(pair, 16) {
            Ok(b) => bytes.push(b),
            Err(_) => bail!("invalid hex digit in '{pair}'"),
        }
    }
    Ok(bytes)
}

/// Lower-case hex rendering of a byte slice.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
