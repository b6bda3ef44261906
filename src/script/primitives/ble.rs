//! The `ble` capability: GATT access for transform scripts.
//!
//! Reads come from a host-maintained cache of last-known characteristic
//! values; writes and subscriptions are queued and drained by the
//! orchestrator after each call, so the Lua state never touches the
//! transport directly.
//!
//! # Usage in Lua
//!
//! ```lua
//! -- Script-driven subscription (honoured when no CLI subscriptions are given)
//! ble:subscribe{
//!     services = {
//!         { service = "180d", characteristics = { "2a37" } },
//!     },
//!     pattern = "every-update",
//!     max_rate = 100, -- milliseconds
//! }
//!
//! function tty_to_ble(data)
//!     ble.set("6e400002b5a3f393e0a9e50e24dcca9e", data)
//! end
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use mlua::prelude::*;

use crate::gatt::{uuid, StreamMode, SubscribeOptions};

/// One GATT write queued by `ble.set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattWriteRequest {
    /// Target characteristic, normal form.
    pub uuid: String,
    pub data: Vec<u8>,
    pub with_response: bool,
}

/// A subscription requested by `ble:subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSubscription {
    pub options: Vec<SubscribeOptions>,
    pub mode: Option<StreamMode>,
    pub max_rate: Option<Duration>,
}

/// Queue of writes drained by the orchestrator.
pub type WriteQueue = Arc<Mutex<Vec<GattWriteRequest>>>;

/// Queue of subscription requests drained by the orchestrator.
pub type SubscribeQueue = Arc<Mutex<Vec<ScriptSubscription>>>;

/// Last-known characteristic values, keyed by normal-form UUID.
pub type ValueCache = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// Create an empty write queue.
#[must_use]
pub fn new_write_queue() -> WriteQueue {
    Arc::new(Mutex::new(Vec::new()))
}

/// Create an empty subscribe queue.
#[must_use]
pub fn new_subscribe_queue() -> SubscribeQueue {
    Arc::new(Mutex::new(Vec::new()))
}

/// Create an empty value cache.
#[must_use]
pub fn new_value_cache() -> ValueCache {
    Arc::new(Mutex::new(BTreeMap::new()))
}

/// Register the global `ble` table.
///
/// # Errors
///
/// Returns an error if table or function creation fails.
pub fn register(
    lua: &Lua,
    writes: WriteQueue,
    subscribes: SubscribeQueue,
    values: ValueCache,
) -> Result<()> {
    let ble = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create ble table: {e}"))?;

    // ble.list() -> array of normal-form uuids with a cached value
    let list_fn = {
        let values = Arc::clone(&values);
        lua.create_function(move |lua, ()| {
            let values = values.lock().expect("value cache mutex poisoned");
            let out = lua.create_table()?;
            for (i, uuid) in values.keys().enumerate() {
                out.set(i + 1, uuid.clone())?;
            }
            Ok(out)
        })
        .map_err(|e| anyhow!("Failed to create ble.list function: {e}"))?
    };
    ble.set("list", list_fn)
        .map_err(|e| anyhow!("Failed to set ble.list: {e}"))?;

    // ble.get(uuid) -> bytes or nil
    let get_fn = {
        let values = Arc::clone(&values);
        lua.create_function(move |lua, raw: String| {
            let normal = uuid::normalize(&raw)
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            let values = values.lock().expect("value cache mutex poisoned");
            match values.get(&normal) {
                Some(bytes) => Ok(Some(lua.create_string(bytes)?)),
                None => Ok(None),
            }
        })
        .map_err(|e| anyhow!("Failed to create ble.get function: {e}"))?
    };
    ble.set("get", get_fn)
        .map_err(|e| anyhow!("Failed to set ble.get: {e}"))?;

    // ble.set(uuid, bytes [, with_response]) -> queue a GATT write
    let set_fn = {
        let writes = Arc::clone(&writes);
        lua.create_function(
            move |_, (raw, data, with_response): (String, mlua::String, Option<bool>)| {
                let normal = uuid::normalize(&raw)
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
                writes
                    .lock()
                    .expect("write queue mutex poisoned")
                    .push(GattWriteRequest {
                        uuid: normal,
                        data: data.as_bytes().to_vec(),
                        with_response: with_response.unwrap_or(false),
                    });
                Ok(())
            },
        )
        .map_err(|e| anyhow!("Failed to create ble.set function: {e}"))?
    };
    ble.set("set", set_fn)
        .map_err(|e| anyhow!("Failed to set ble.set: {e}"))?;

    // ble:subscribe{...} (also callable as ble.subscribe{...})
    let subscribe_fn = {
        let subscribes = Arc::clone(&subscribes);
        lua.create_function(move |_, args: mlua::MultiValue| {
            // Colon calls pass the ble table as the first value; the options
            // table is the last table argument either way.
            let opts = args
                .iter()
                .rev()
                .find_map(|v| v.as_table().cloned())
                .ok_or_else(|| {
                    mlua::Error::RuntimeError("ble.subscribe requires an options table".into())
                })?;
            let request = parse_subscription(&opts)?;
            subscribes
                .lock()
                .expect("subscribe queue mutex poisoned")
                .push(request);
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create ble.subscribe function: {e}"))?
    };
    ble.set("subscribe", subscribe_fn)
        .map_err(|e| anyhow!("Failed to set ble.subscribe: {e}"))?;

    lua.globals()
        .set("ble", ble)
        .map_err(|e| anyhow!("Failed to set ble global: {e}"))?;

    Ok(())
}

/// Parse a Lua subscription options table.
///
/// Accepted shape:
///
/// ```lua
/// { services = { { service = "180d", characteristics = {"2a37"} }, ... },
///   pattern = "batched", max_rate = 250 }
/// ```
///
/// Service entries may also be bare UUID strings, meaning "every notifying
/// characteristic of that service".
fn parse_subscription(opts: &mlua::Table) -> mlua::Result<ScriptSubscription> {
    let services: mlua::Table = opts.get("services").map_err(|_| {
        mlua::Error::RuntimeError("ble.subscribe options must include 'services'".into())
    })?;

    let mut options = Vec::new();
    for entry in services.sequence_values::<mlua::Value>() {
        match entry? {
            mlua::Value::String(s) => {
                let service = normalize_lua(&s.to_string_lossy())?;
                options.push(SubscribeOptions {
                    service_uuid: service,
                    characteristic_uuids: Vec::new(),
                });
            }
            mlua::Value::Table(t) => {
                let service: String = t.get("service")?;
                let service = normalize_lua(&service)?;
                let mut characteristic_uuids = Vec::new();
                if let Ok(chars) = t.get::<mlua::Table>("characteristics") {
                    for c in chars.sequence_values::<String>() {
                        characteristic_uuids.push(normalize_lua(&c?)?);
                    }
                }
                options.push(SubscribeOptions {
                    service_uuid: service,
                    characteristic_uuids,
                });
            }
            other => {
                return Err(mlua::Error::RuntimeError(format!(
                    "unexpected service entry of type {}",
                    other.type_name()
                )));
            }
        }
    }

    let mode = match opts.get::<Option<String>>("pattern")? {
        Some(pattern) => Some(
            pattern
                .parse::<StreamMode>()
                .map_err(mlua::Error::RuntimeError)?,
        ),
        None => None,
    };

    let max_rate = opts
        .get::<Option<u64>>("max_rate")?
        .map(Duration::from_millis);

    Ok(ScriptSubscription {
        options,
        mode,
        max_rate,
    })
}

fn normalize_lua(raw: &str) -> mlua::Result<String> {
    uuid::normalize(raw).map_err(|e| mlua::Error::RuntimeError(e.to_string()))
}
