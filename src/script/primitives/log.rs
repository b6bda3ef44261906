//! Logging capability for transform scripts.
//!
//! Exposes Rust's `log` crate to Lua via a `log` table. Script messages
//! land in the same sink as the host's own logging and respect the
//! configured filters, so a transform script can be debugged with
//! `RUST_LOG=script=debug` without touching the data path.
//!
//! # Usage in Lua
//!
//! ```lua
//! log.info("frame sync acquired")
//! log.warn("short notification, waiting for remainder")
//! log.debug("staged " .. n .. " bytes")
//! ```

use anyhow::{anyhow, Result};
use mlua::Lua;

/// Register the `log` table with one function per level.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub fn register(lua: &Lua) -> Result<()> {
    let log_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create log table: {e}"))?;

    let info_fn = lua
        .create_function(|_, msg: String| {
            log::info!(target: "script", "{}", msg);
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.info function: {e}"))?;
    log_table
        .set("info", info_fn)
        .map_err(|e| anyhow!("Failed to set log.info: {e}"))?;

    let warn_fn = lua
        .create_function(|_, msg: String| {
            log::warn!(target: "script", "{}", msg);
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.warn function: {e}"))?;
    log_table
        .set("warn", warn_fn)
        .map_err(|e| anyhow!("Failed to set log.warn: {e}"))?;

    let error_fn = lua
        .create_function(|_, msg: String| {
            log::error!(target: "script", "{}", msg);
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.error function: {e}"))?;
    log_table
        .set("error", error_fn)
        .map_err(|e| anyhow!("Failed to set log.error: {e}"))?;

    let debug_fn = lua
        .create_function(|_, msg: String| {
            log::debug!(target: "script", "{}", msg);
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.debug function: {e}"))?;
    log_table
        .set("debug", debug_fn)
        .map_err(|e| anyhow!("Failed to set log.debug: {e}"))?;

    lua.globals()
        .set("log", log_table)
        .map_err(|e| anyhow!("Failed to set log global: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_table_registered() {
        let lua = Lua::new();
        register(&lua).expect("register log primitives");
        let table: mlua::Table = lua.globals().get("log").expect("log table exists");
        for level in ["info", "warn", "error", "debug"] {
            let f: mlua::Result<mlua::Function> = table.get(level);
            assert!(f.is_ok(), "log.{level} should be a function");
        }
    }

    #[test]
    fn test_log_calls_do_not_error() {
        let lua = Lua::new();
        register(&lua).expect("register log primitives");
        lua.load(r#"log.info("hello"); log.debug("world")"#)
            .exec()
            .expect("log calls succeed");
    }
}
