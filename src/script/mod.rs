//! Transform script runtime.
//!
//! Owns an mlua interpreter on a dedicated runner thread. The interpreter
//! is a single-writer resource: the PTY dispatcher and the notification
//! engine both funnel through a bounded work queue, and the runner thread
//! is the only one that ever touches the Lua state.
//!
//! # Script contract
//!
//! A transform script must define two global functions (absence is fatal
//! on the first call):
//!
//! - `ble_to_tty(record)` - per emitted notification record; stages
//!   PTY-bound bytes via `buffer:append(...)`
//! - `tty_to_ble(data)` - per PTY-read chunk; queues GATT writes via
//!   `ble.set(...)`
//!
//! Soft failures are signalled with the host-provided `need_more_data()`
//! and map to [`ScriptError::NonFatal`]; everything else a script raises is
//! [`ScriptError::Fatal`].

pub mod primitives;

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mlua::Lua;

use crate::constants::{DEFAULT_POLL_TIMEOUT, SCRIPT_QUEUE_DEPTH, SCRIPT_SHUTDOWN_TIMEOUT};
use crate::error::ScriptError;
use crate::gatt::{uuid, Record};

pub use primitives::{
    GattWriteRequest, OutputQueue, ScriptSubscription, SharedBuffer, SubscribeQueue, ValueCache,
    WriteQueue, NEED_MORE_DATA_SENTINEL,
};

/// Name of the forward transform entry point.
pub const BLE_TO_TTY: &str = "ble_to_tty";
/// Name of the reverse transform entry point.
pub const TTY_TO_BLE: &str = "tty_to_ble";

/// Work items posted to the runner thread.
enum Job {
    Load {
        name: String,
        source: String,
        reply: SyncSender<Result<(), ScriptError>>,
    },
    BleToTty {
        record: Record,
        reply: SyncSender<Result<(), ScriptError>>,
    },
    TtyToBle {
        data: Vec<u8>,
        reply: SyncSender<Result<(), ScriptError>>,
    },
    Shutdown,
}

/// Signals runner exit so shutdown can wait with a deadline.
struct ExitFlag {
    exited: Mutex<bool>,
    cond: Condvar,
}

impl ExitFlag {
    fn new() -> Self {
        Self {
            exited: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.exited.lock().expect("exit flag mutex poisoned") = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut exited = self.exited.lock().expect("exit flag mutex poisoned");
        while !*exited {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .cond
                .wait_timeout(exited, deadline - now)
                .expect("exit flag mutex poisoned");
            exited = next;
        }
        true
    }
}

/// Single-threaded Lua interpreter behind a bounded work queue.
///
/// All capability state (staging buffer, value cache, write/subscribe
/// queues, output channel) is shared with the host side so the orchestrator
/// can drain it after each call without entering the interpreter.
pub struct ScriptRuntime {
    jobs: SyncSender<Job>,
    runner: Mutex<Option<JoinHandle<()>>>,
    exit: Arc<ExitFlag>,
    staging: SharedBuffer,
    values: ValueCache,
    writes: WriteQueue,
    subscribes: SubscribeQueue,
    output: OutputQueue,
}

impl ScriptRuntime {
    /// Spawn the runner thread and register all capabilities.
    ///
    /// # Errors
    ///
    /// `ScriptError::Fatal` if the runner thread cannot be spawned or the
    /// interpreter fails to initialise.
    pub fn new() -> Result<Self, ScriptError> {
        let staging = primitives::new_buffer();
        let values = primitives::new_value_cache();
        let writes = primitives::new_write_queue();
        let subscribes = primitives::new_subscribe_queue();
        let output = primitives::new_output_queue();
        let exit = Arc::new(ExitFlag::new());

        let (jobs, jobs_rx) = mpsc::sync_channel::<Job>(SCRIPT_QUEUE_DEPTH);
        // Reports interpreter construction failure back from the runner,
        // since the Lua state must be created on its own thread.
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), ScriptError>>(1);

        let runner = {
            let staging = Arc::clone(&staging);
            let values = Arc::clone(&values);
            let writes = Arc::clone(&writes);
            let subscribes = Arc::clone(&subscribes);
            let output = Arc::clone(&output);
            let exit = Arc::clone(&exit);
            thread::Builder::new()
                .name("script-runner".into())
                .spawn(move || {
                    run_interpreter(
                        &jobs_rx, &ready_tx, staging, writes, subscribes, values, output,
                    );
                    exit.signal();
                })
                .map_err(|e| ScriptError::Fatal(format!("failed to spawn script runner: {e}")))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ScriptError::Fatal(
                    "script runner terminated during startup".into(),
                ))
            }
        }

        log::debug!("script runtime started");

        Ok(Self {
            jobs,
            runner: Mutex::new(Some(runner)),
            exit,
            staging,
            values,
            writes,
            subscribes,
            output,
        })
    }

    /// Load and execute script source on the runner thread.
    ///
    /// # Errors
    ///
    /// `ScriptError::Fatal` for syntax or execution errors.
    pub fn load(&self, name: &str, source: &str) -> Result<(), ScriptError> {
        self.submit(|reply| Job::Load {
            name: name.to_string(),
            source: source.to_string(),
            reply,
        })
    }

    /// Invoke `ble_to_tty(record)`.
    ///
    /// # Errors
    ///
    /// `Fatal` if the function is missing or raises; `NonFatal` if it
    /// signalled `need_more_data()`.
    pub fn call_ble_to_tty(&self, record: &Record) -> Result<(), ScriptError> {
        self.submit(|reply| Job::BleToTty {
            record: record.clone(),
            reply,
        })
    }

    /// Invoke `tty_to_ble(data)`.
    ///
    /// # Errors
    ///
    /// Same classification as [`ScriptRuntime::call_ble_to_tty`].
    pub fn call_tty_to_ble(&self, data: &[u8]) -> Result<(), ScriptError> {
        self.submit(|reply| Job::TtyToBle {
            data: data.to_vec(),
            reply,
        })
    }

    /// Update the last-known value cache backing `ble.get`/`ble.list`.
    pub fn update_value(&self, char_uuid: &str, value: &[u8]) {
        if let Ok(normal) = uuid::normalize(char_uuid) {
            self.values
                .lock()
                .expect("value cache mutex poisoned")
                .insert(normal, value.to_vec());
        }
    }

    /// Take everything the script staged for the PTY.
    #[must_use]
    pub fn drain_staged(&self) -> Vec<u8> {
        std::mem::take(&mut *self.staging.lock().expect("script buffer mutex poisoned"))
    }

    /// Take queued GATT writes.
    #[must_use]
    pub fn drain_writes(&self) -> Vec<GattWriteRequest> {
        std::mem::take(&mut *self.writes.lock().expect("write queue mutex poisoned"))
    }

    /// Take queued subscription requests.
    #[must_use]
    pub fn drain_subscribes(&self) -> Vec<ScriptSubscription> {
        std::mem::take(
            &mut *self
                .subscribes
                .lock()
                .expect("subscribe queue mutex poisoned"),
        )
    }

    /// Take queued `print` output lines.
    #[must_use]
    pub fn drain_output(&self) -> Vec<String> {
        std::mem::take(&mut *self.output.lock().expect("script output mutex poisoned"))
    }

    /// Stop the runner. Idempotent; waits up to the shutdown deadline and
    /// abandons the thread if a script refuses to return.
    pub fn shutdown(&self) {
        let Some(runner) = self
            .runner
            .lock()
            .expect("script runner mutex poisoned")
            .take()
        else {
            return;
        };
        let _ = self.jobs.try_send(Job::Shutdown);
        if self.exit.wait(SCRIPT_SHUTDOWN_TIMEOUT) {
            let _ = runner.join();
            log::debug!("script runtime stopped");
        } else {
            log::warn!(
                "script runner did not stop within {:?}; abandoning it",
                SCRIPT_SHUTDOWN_TIMEOUT
            );
        }
    }

    fn submit<F>(&self, make: F) -> Result<(), ScriptError>
    where
        F: FnOnce(SyncSender<Result<(), ScriptError>>) -> Job,
    {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.jobs
            .send(make(reply_tx))
            .map_err(|_| ScriptError::Fatal("script runner terminated".into()))?;
        reply_rx
            .recv()
            .map_err(|_| ScriptError::Fatal("script runner terminated".into()))?
    }
}

impl Drop for ScriptRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let staged = self.staging.lock().map(|b| b.len()).unwrap_or(0);
        let writes = self.writes.lock().map(|q| q.len()).unwrap_or(0);
        f.debug_struct("ScriptRuntime")
            .field("staged_bytes", &staged)
            .field("queued_writes", &writes)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Runner thread
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn run_interpreter(
    jobs: &Receiver<Job>,
    ready: &SyncSender<Result<(), ScriptError>>,
    staging: SharedBuffer,
    writes: WriteQueue,
    subscribes: SubscribeQueue,
    values: ValueCache,
    output: OutputQueue,
) {
    let lua = Lua::new();
    if let Err(e) = primitives::register_all(&lua, staging, writes, subscribes, values, output) {
        let _ = ready.send(Err(ScriptError::Fatal(format!(
            "capability registration failed: {e}"
        ))));
        return;
    }
    let _ = ready.send(Ok(()));

    loop {
        match jobs.recv_timeout(DEFAULT_POLL_TIMEOUT) {
            Ok(Job::Load {
                name,
                source,
                reply,
            }) => {
                let result = lua
                    .load(&source)
                    .set_name(name.as_str())
                    .exec()
                    .map_err(|e| classify(&e));
                if let Err(e) = &result {
                    log::debug!("script load '{}' failed: {}", name, e);
                }
                let _ = reply.send(result);
            }
            Ok(Job::BleToTty { record, reply }) => {
                let result = call_function(&lua, BLE_TO_TTY, |lua| record_to_lua(lua, &record));
                let _ = reply.send(result);
            }
            Ok(Job::TtyToBle { data, reply }) => {
                let result = call_function(&lua, TTY_TO_BLE, |lua| {
                    Ok(mlua::Value::String(lua.create_string(&data)?))
                });
                let _ = reply.send(result);
            }
            Ok(Job::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => continue,
        }
    }
}

/// Look up and invoke a required global function.
fn call_function<F>(lua: &Lua, name: &str, build_arg: F) -> Result<(), ScriptError>
where
    F: FnOnce(&Lua) -> mlua::Result<mlua::Value>,
{
    let func: mlua::Function = lua
        .globals()
        .get(name)
        .map_err(|_| ScriptError::Fatal(format!("script does not define '{name}'")))?;
    let arg = build_arg(lua).map_err(|e| classify(&e))?;
    func.call::<()>(arg).map_err(|e| classify(&e))
}

/// Map a Lua error to the fatal/non-fatal taxonomy.
fn classify(err: &mlua::Error) -> ScriptError {
    let message = err.to_string();
    if message.contains(NEED_MORE_DATA_SENTINEL) {
        ScriptError::NonFatal("script requested more data".into())
    } else {
        ScriptError::Fatal(message)
    }
}

/// Build the Lua table handed to `ble_to_tty`.
///
/// Shape:
///
/// ```lua
/// {
///   timestamp_ms = 1700000000123,
///   values = { ["2a37"] = "\1" },            -- every-update / aggregated
///   batch_values = { ["2a37"] = { "\1" } },  -- batched
///   flags = { dropped = false, missing = false },
/// }
/// ```
fn record_to_lua(lua: &Lua, record: &Record) -> mlua::Result<mlua::Value> {
    let table = lua.create_table()?;
    table.set("timestamp_ms", record.timestamp.timestamp_millis())?;

    if let Some(values) = &record.values {
        let t = lua.create_table()?;
        for (uuid, value) in values {
            t.set(uuid.as_str(), lua.create_string(value)?)?;
        }
        table.set("values", t)?;
    }

    if let Some(batches) = &record.batch_values {
        let t = lua.create_table()?;
        for (uuid, batch) in batches {
            let list = lua.create_table()?;
            for (i, value) in batch.iter().enumerate() {
                list.set(i + 1, lua.create_string(value)?)?;
            }
            t.set(uuid.as_str(), list)?;
        }
        table.set("batch_values", t)?;
    }

    let flags = lua.create_table()?;
    flags.set("dropped", record.flags.dropped)?;
    flags.set("missing", record.flags.missing)?;
    table.set("flags", flags)?;

    Ok(mlua::Value::Table(table))
}
