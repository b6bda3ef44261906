//! The `inspect` subcommand: print a peripheral's GATT profile.

use anyhow::Result;

use crate::cancel::CancelToken;
use crate::commands::run_cancellable;
use crate::constants::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_DISCOVER_TIMEOUT};
use crate::gatt::central::BtleTransport;
use crate::gatt::{CharProps, GattConnection, GattTransport};

/// Connect, discover, and print services and characteristics.
///
/// Interruptible: a Ctrl-C while connecting or discovering exits cleanly.
///
/// # Errors
///
/// Connect and discovery failures.
pub fn run(token: &CancelToken, address: &str, json: bool) -> Result<()> {
    eprintln!("Connecting to {address}...");
    let address = address.to_string();
    let Some(result) = run_cancellable(token, move || {
        let transport = BtleTransport::new()?;
        let conn = transport.connect(&address, DEFAULT_CONNECT_TIMEOUT)?;
        let profile = conn.discover(DEFAULT_DISCOVER_TIMEOUT);
        conn.close();
        Ok(profile?)
    }) else {
        return Ok(());
    };
    let profile = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
        return Ok(());
    }

    for service in &profile.services {
        println!("service {}", service.uuid);
        for c in &service.characteristics {
            println!("  characteristic {} [{}]", c.uuid, props_label(&c.properties));
        }
    }
    Ok(())
}

fn props_label(props: &CharProps) -> String {
    let mut labels = Vec::new();
    if props.read {
        labels.push("read");
    }
    if props.write {
        labels.push("write");
    }
    if props.write_without_response {
        labels.push("write-no-rsp");
    }
    if props.notify {
        labels.push("notify");
    }
    if props.indicate {
        labels.push("indicate");
    }
    labels.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_props_label() {
        let props = CharProps {
            read: true,
            notify: true,
            ..CharProps::default()
        };
        assert_eq!(props_label(&props), "read, notify");
    }
}
