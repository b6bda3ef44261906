//! The `scan` subcommand: list nearby peripherals.

use std::time::Duration;

use anyhow::Result;

use crate::cancel::CancelToken;
use crate::commands::run_cancellable;
use crate::gatt::central::BtleTransport;

/// Scan for `duration` and print what was seen.
///
/// Interruptible: a Ctrl-C during the scan window exits cleanly instead of
/// riding out the full duration.
///
/// # Errors
///
/// Adapter access and scan failures.
pub fn run(token: &CancelToken, duration: Duration, json: bool) -> Result<()> {
    eprintln!("Scanning for {}s...", duration.as_secs());
    let Some(result) = run_cancellable(token, move || {
        let transport = BtleTransport::new()?;
        Ok(transport.scan(duration)?)
    }) else {
        return Ok(());
    };
    let mut entries = result?;
    // Strongest signal first; unnamed junk at the bottom.
    entries.sort_by_key(|e| (e.name.is_none(), std::cmp::Reverse(e.rssi.unwrap_or(i16::MIN))));

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No peripherals found.");
        return Ok(());
    }
    println!("{:<20} {:>6}  NAME", "ADDRESS", "RSSI");
    for entry in &entries {
        let rssi = entry
            .rssi
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<20} {:>6}  {}",
            entry.address,
            rssi,
            entry.name.as_deref().unwrap_or("(unknown)")
        );
    }
    Ok(())
}
