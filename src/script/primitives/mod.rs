//! Host capabilities exposed to transform scripts.
//!
//! Each capability is a global table or object registered when the runtime
//! is created. Scripts never call into the host synchronously for side
//! effects on the transport or the PTY: writes, subscriptions, and staged
//! output go into shared queues the orchestrator drains after each call.
//!
//! # Available capabilities
//!
//! - `buffer` - staging area for PTY-bound bytes
//! - `ble` - GATT value cache, write queue, subscription requests
//! - `log` - logging routed through the `log` crate
//! - `print` - redirected to the runtime's output channel
//! - `need_more_data()` - raise the soft-failure sentinel
//!
//! # Adding a capability
//!
//! 1. Create a module with a `register(lua, …) -> Result<()>` function
//! 2. Add `pub mod foo;` here
//! 3. Call it from `register_all`

pub mod ble;
pub mod buffer;
pub mod log;

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use mlua::Lua;

pub use ble::{
    new_subscribe_queue, new_value_cache, new_write_queue, GattWriteRequest, ScriptSubscription,
    SubscribeQueue, ValueCache, WriteQueue,
};
pub use buffer::{new_buffer, SharedBuffer};

/// Out-of-band printable output from the script, drained by the
/// orchestrator. The drainer is the only path to the user's terminal;
/// scripts never write process stdout directly.
pub type OutputQueue = Arc<Mutex<Vec<String>>>;

/// Create an empty output queue.
#[must_use]
pub fn new_output_queue() -> OutputQueue {
    Arc::new(Mutex::new(Vec::new()))
}

/// Error payload raised by `need_more_data()`; the runtime maps errors
/// carrying it to a non-fatal outcome.
pub const NEED_MORE_DATA_SENTINEL: &str = "__bletty_need_more_data__";

/// Register every capability with the Lua state.
///
/// # Errors
///
/// Returns an error if any registration fails.
pub fn register_all(
    lua: &Lua,
    staging: SharedBuffer,
    writes: WriteQueue,
    subscribes: SubscribeQueue,
    values: ValueCache,
    output: OutputQueue,
) -> Result<()> {
    log::register(lua)?;
    buffer::register(lua, staging)?;
    ble::register(lua, writes, subscribes, values)?;
    register_print(lua, output)?;
    register_need_more_data(lua)?;
    Ok(())
}

/// Redirect `print` into the output queue.
fn register_print(lua: &Lua, output: OutputQueue) -> Result<()> {
    let print_fn = lua
        .create_function(move |lua, args: mlua::MultiValue| {
            let mut parts = Vec::with_capacity(args.len());
            for value in args.iter() {
                let text = match lua.coerce_string(value.clone()) {
                    Ok(Some(s)) => s.to_string_lossy().to_string(),
                    _ => value.type_name().to_string(),
                };
                parts.push(text);
            }
            output
                .lock()
                .expect("script output mutex poisoned")
                .push(parts.join("\t"));
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create print function: {e}"))?;
    lua.globals()
        .set("print", print_fn)
        .map_err(|e| anyhow!("Failed to override print: {e}"))?;
    Ok(())
}

/// Register `need_more_data()`, the structured soft-failure signal.
fn register_need_more_data(lua: &Lua) -> Result<()> {
    let f = lua
        .create_function(|_, ()| -> mlua::Result<()> {
            Err(mlua::Error::RuntimeError(NEED_MORE_DATA_SENTINEL.into()))
        })
        .map_err(|e| anyhow!("Failed to create need_more_data function: {e}"))?;
    lua.globals()
        .set("need_more_data", f)
        .map_err(|e| anyhow!("Failed to set need_more_data global: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all() {
        let lua = Lua::new();
        register_all(
            &lua,
            new_buffer(),
            new_write_queue(),
            new_subscribe_queue(),
            new_value_cache(),
            new_output_queue(),
        )
        .expect("register all primitives");
        for global in ["buffer", "ble", "log", "print", "need_more_data"] {
            let v: mlua::Value = lua.globals().get(global).unwrap();
            assert!(!v.is_nil(), "{global} should be registered");
        }
    }

    #[test]
    fn test_print_goes_to_output_queue() {
        let lua = Lua::new();
        let output = new_output_queue();
        register_print(&lua, Arc::clone(&output)).unwrap();
        lua.load(r#"print("a", 1, true)"#).exec().unwrap();
        assert_eq!(output.lock().unwrap().as_slice(), &["a\t1\ttrue".to_string()]);
    }

    #[test]
    fn test_need_more_data_raises_sentinel() {
        let lua = Lua::new();
        register_need_more_data(&lua).unwrap();
        let err = lua.load("need_more_data()").exec().unwrap_err();
        assert!(err.to_string().contains(NEED_MORE_DATA_SENTINEL));
    }
}
