//! The `buffer` capability: the script's staging area for PTY-bound bytes.
//!
//! `ble_to_tty` appends whatever should reach the serial application;
//! after the call returns, the orchestrator drains the buffer into the PTY
//! write ring. `peek`/`read`/`consume`/`clear` let a script reshape staged
//! bytes before returning (e.g. withhold a partial frame by reading it back
//! out and re-appending it on the next notification).
//!
//! # Usage in Lua
//!
//! ```lua
//! function ble_to_tty(record)
//!     for _, value in pairs(record.values) do
//!         buffer:append(value)
//!     end
//! end
//! ```

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use mlua::prelude::*;

/// Byte buffer shared between the Lua state and the orchestrator.
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Create an empty shared buffer.
#[must_use]
pub fn new_buffer() -> SharedBuffer {
    Arc::new(Mutex::new(Vec::new()))
}

/// Userdata backing the global `buffer` object.
struct TtyBuffer {
    data: SharedBuffer,
}

impl LuaUserData for TtyBuffer {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        // buffer:append(s) - stage bytes for the PTY
        methods.add_method("append", |_, this, s: mlua::String| {
            this.data
                .lock()
                .expect("script buffer mutex poisoned")
                .extend_from_slice(&s.as_bytes());
            Ok(())
        });

        // buffer:peek(n) - first n staged bytes, not consumed
        methods.add_method("peek", |lua, this, n: usize| {
            let data = this.data.lock().expect("script buffer mutex poisoned");
            let end = n.min(data.len());
            lua.create_string(&data[..end])
        });

        // buffer:read(n) - first n staged bytes, consumed
        methods.add_method("read", |lua, this, n: usize| {
            let mut data = this.data.lock().expect("script buffer mutex poisoned");
            let end = n.min(data.len());
            let taken: Vec<u8> = data.drain(..end).collect();
            lua.create_string(&taken)
        });

        // buffer:consume(n) - discard the first n staged bytes
        methods.add_method("consume", |_, this, n: usize| {
            let mut data = this.data.lock().expect("script buffer mutex poisoned");
            let end = n.min(data.len());
            data.drain(..end);
            Ok(())
        });

        // buffer:clear() - discard everything staged
        methods.add_method("clear", |_, this, ()| {
            this.data
                .lock()
                .expect("script buffer mutex poisoned")
                .clear();
            Ok(())
        });

        // buffer:len() - staged byte count
        methods.add_method("len", |_, this, ()| {
            Ok(this.data.lock().expect("script buffer mutex poisoned").len())
        });
    }
}

/// Register the global `buffer` object over `data`.
///
/// # Errors
///
/// Returns an error if userdata creation or registration fails.
pub fn register(lua: &Lua, data: SharedBuffer) -> Result<()> {
    let buffer = TtyBuffer { data };
    lua.globals()
        .set("buffer", buffer)
        .map_err(|e| anyhow!("Failed to set buffer global: {e}"))?;
    Ok(())
}
