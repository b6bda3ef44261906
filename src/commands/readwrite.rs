//! The `read` and `write` subcommands: one-shot characteristic access.

use anyhow::Result;

use crate::cancel::CancelToken;
use crate::commands::{parse_hex, run_cancellable, to_hex};
use crate::constants::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_GATT_OP_TIMEOUT};
use crate::gatt::central::BtleTransport;
use crate::gatt::{GattConnection, GattTransport};

/// Read one characteristic and print its value as hex.
///
/// Interruptible: a Ctrl-C during connect or read exits cleanly.
///
/// # Errors
///
/// Connect, lookup, and read failures.
pub fn read(token: &CancelToken, address: &str, characteristic: &str) -> Result<()> {
    let address = address.to_string();
    let characteristic = characteristic.to_string();
    let Some(result) = run_cancellable(token, move || {
        let transport = BtleTransport::new()?;
        let conn = transport.connect(&address, DEFAULT_CONNECT_TIMEOUT)?;
        let value = conn.read_characteristic(&characteristic, DEFAULT_GATT_OP_TIMEOUT);
        conn.close();
        Ok(value?)
    }) else {
        return Ok(());
    };
    let value = result?;
    println!("{}", to_hex(&value));
    Ok(())
}

/// Write hex bytes to one characteristic.
///
/// Interruptible: a Ctrl-C during connect or write exits cleanly.
///
/// # Errors
///
/// Hex parse, connect, lookup, and write failures.
pub fn write(
    token: &CancelToken,
    address: &str,
    characteristic: &str,
    hex: &str,
    no_response: bool,
) -> Result<()> {
    let bytes = parse_hex(hex)?;
    let count = bytes.len();
    let address = address.to_string();
    let characteristic = characteristic.to_string();
    let Some(result) = run_cancellable(token, move || {
        let transport = BtleTransport::new()?;
        let conn = transport.connect(&address, DEFAULT_CONNECT_TIMEOUT)?;
        let outcome = conn.write(
            &characteristic,
            &bytes,
            !no_response,
            DEFAULT_GATT_OP_TIMEOUT,
        );
        conn.close();
        Ok(outcome?)
    }) else {
        return Ok(());
    };
    result?;
    println!("Wrote {count} byte(s).");
    Ok(())
}
