//! The `subscribe` subcommand: stream notification records to stdout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::cancel::CancelToken;
use crate::commands::{run_cancellable, to_hex};
use crate::constants::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_DISCOVER_TIMEOUT};
use crate::gatt::central::BtleTransport;
use crate::gatt::notify::NotificationEngine;
use crate::gatt::{GattConnection, GattTransport, Record, StreamMode, SubscribeOptions};

/// Stream records until `token` is cancelled.
///
/// With no explicit characteristics, every notifying characteristic on the
/// peripheral is subscribed. The connect/discover phase is raced against
/// the token, so a Ctrl-C before the stream starts also exits cleanly.
///
/// # Errors
///
/// Connect, discovery, and subscribe failures.
pub fn run(
    token: &CancelToken,
    address: &str,
    characteristics: Vec<String>,
    mode: StreamMode,
    max_rate: Duration,
) -> Result<()> {
    eprintln!("Connecting to {address}...");
    let setup = {
        let address = address.to_string();
        let engine_parent = token.clone();
        run_cancellable(token, move || {
            let transport = BtleTransport::new()?;
            let conn = transport.connect(&address, DEFAULT_CONNECT_TIMEOUT)?;

            let characteristics = if characteristics.is_empty() {
                let profile = conn.discover(DEFAULT_DISCOVER_TIMEOUT)?;
                let found: Vec<String> = profile
                    .notifying_characteristics()
                    .iter()
                    .map(|c| c.uuid.clone())
                    .collect();
                if found.is_empty() {
                    conn.close();
                    bail!("peripheral has no notifying characteristics");
                }
                found
            } else {
                characteristics
            };

            let subscriptions = vec![SubscribeOptions {
                service_uuid: String::new(),
                characteristic_uuids: characteristics,
            }];

            let engine = NotificationEngine::start(
                Arc::clone(&conn),
                &subscriptions,
                mode,
                max_rate,
                Arc::new(print_record),
                &engine_parent,
            )?;
            Ok((conn, engine))
        })
    };
    let Some(setup) = setup else {
        return Ok(());
    };
    let (conn, engine) = setup?;

    eprintln!("Subscribed; press Ctrl-C to stop.");
    let disconnect = conn.disconnect_signal();
    let mut lost = false;
    while !token.wait_timeout(Duration::from_millis(100)) {
        if disconnect.is_cancelled() {
            lost = true;
            break;
        }
    }

    engine.stop();
    conn.close();
    if lost {
        bail!("connection lost");
    }
    Ok(())
}

fn print_record(record: Record) {
    let time = record.timestamp.format("%H:%M:%S%.3f");
    let mut parts = Vec::new();
    if let Some(values) = &record.values {
        for (uuid, value) in values {
            parts.push(format!("{}={}", uuid, to_hex(value)));
        }
    }
    if let Some(batches) = &record.batch_values {
        for (uuid, batch) in batches {
            let rendered: Vec<String> = batch.iter().map(|v| to_hex(v)).collect();
            parts.push(format!("{}=[{}]", uuid, rendered.join(",")));
        }
    }
    let mut flags = String::new();
    if record.flags.dropped {
        flags.push_str(" [dropped]");
    }
    if record.flags.missing {
        flags.push_str(" [missing]");
    }
    println!("[{}] {}{}", time, parts.join(" "), flags);
}
