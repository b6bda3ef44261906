//! Bridge orchestrator.
//!
//! [`run_device_bridge`] owns the whole arrangement: it dials the
//! peripheral, opens the PTY engine, loads the transform script, wires the
//! two data directions together, and tears everything down in order when
//! the cancellation token fires or the peripheral disconnects.
//!
//! Data flow, forward: notification engine record → `ble_to_tty(record)` →
//! script staging buffer → PTY write ring → kernel PTY → serial app.
//!
//! Data flow, reverse: serial app → kernel PTY → PTY read ring → dispatcher
//! → `tty_to_ble(bytes)` → queued GATT writes → transport.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use scopeguard::defer;

use crate::cancel::CancelToken;
use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_DISCOVER_TIMEOUT, DEFAULT_GATT_OP_TIMEOUT, DEFAULT_MAX_RATE,
    DEFAULT_POLL_TIMEOUT, DEFAULT_RING_CAPACITY,
};
use crate::error::{BridgeError, ScriptError, TransportError};
use crate::gatt::notify::NotificationEngine;
use crate::gatt::{GattConnection, GattTransport, Profile, Record, StreamMode, SubscribeOptions};
use crate::pty::{PtyEngine, PtyOptions, PtyStats};
use crate::script::ScriptRuntime;

/// Bridge configuration.
#[derive(Clone)]
pub struct BridgeOptions {
    /// Peripheral address (or advertised name) to dial.
    pub ble_address: String,
    pub ble_connect_timeout: Duration,
    pub ble_descriptor_read_timeout: Duration,
    /// Subscriptions requested by the caller. When empty, the script's
    /// `ble:subscribe{...}` requests (issued at load time) take over.
    pub subscriptions: Vec<SubscribeOptions>,
    pub stream_mode: StreamMode,
    /// Minimum interval between records for the rate-limited modes.
    pub max_rate: Duration,
    /// Optional user-visible symlink to the slave path, replaced atomically
    /// and removed on shutdown.
    pub tty_symlink_path: Option<PathBuf>,
    pub read_cap: usize,
    pub write_cap: usize,
    /// Transform script source and its name for error messages.
    pub script_source: String,
    pub script_name: String,
}

impl BridgeOptions {
    /// Options for `address` with implementation defaults everywhere else.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            ble_address: address.into(),
            ble_connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ble_descriptor_read_timeout: DEFAULT_DISCOVER_TIMEOUT,
            subscriptions: Vec::new(),
            stream_mode: StreamMode::EveryUpdate,
            max_rate: DEFAULT_MAX_RATE,
            tty_symlink_path: None,
            read_cap: DEFAULT_RING_CAPACITY,
            write_cap: DEFAULT_RING_CAPACITY,
            script_source: String::new(),
            script_name: "script".into(),
        }
    }
}

/// Lifecycle notifications delivered to the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeProgress {
    Connecting,
    Running,
    ShuttingDown,
}

impl std::fmt::Display for BridgeProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeProgress::Connecting => write!(f, "connecting"),
            BridgeProgress::Running => write!(f, "running"),
            BridgeProgress::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

/// Handle passed to the bridge callback while the bridge is running.
pub struct BridgeHandle {
    tty_path: String,
    token: CancelToken,
    pty: Arc<PtyEngine>,
}

impl BridgeHandle {
    /// Slave path the serial application should open.
    #[must_use]
    pub fn tty_path(&self) -> &str {
        &self.tty_path
    }

    /// Request bridge shutdown.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Block until the bridge is cancelled.
    pub fn wait(&self) {
        self.token.wait(DEFAULT_POLL_TIMEOUT);
    }

    /// Block until cancelled or `timeout` passes; true when cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.token.wait_timeout(timeout)
    }

    /// Current PTY engine counters.
    #[must_use]
    pub fn pty_stats(&self) -> PtyStats {
        self.pty.stats()
    }
}

/// First fatal error observed by any of the callbacks; wins over the
/// generic teardown classification.
type ErrorSlot = Arc<Mutex<Option<BridgeError>>>;

fn store_error(slot: &ErrorSlot, error: BridgeError) {
    let mut slot = slot.lock().expect("bridge error slot poisoned");
    if slot.is_none() {
        *slot = Some(error);
    }
}

/// Run a device bridge to completion.
///
/// Returns `Ok(())` on user cancellation, `BridgeError::ConnectionLost`
/// when the peripheral dropped the link, and the underlying error for
/// setup or runtime failures. Teardown is ordered and unconditional:
/// notification engine, PTY read callback, PTY engine, script runtime,
/// transport, symlink.
pub fn run_device_bridge(
    token: &CancelToken,
    transport: &dyn GattTransport,
    options: BridgeOptions,
    progress: impl Fn(BridgeProgress),
    bridge_cb: impl FnOnce(&BridgeHandle),
) -> Result<(), BridgeError> {
    progress(BridgeProgress::Connecting);

    let conn = transport.connect(&options.ble_address, options.ble_connect_timeout)?;
    // Close the transport on every exit path; GattConnection::close is
    // idempotent, so the ordered teardown below may run first.
    defer! { conn.close(); }

    let profile = conn.discover(options.ble_descriptor_read_timeout)?;
    log::info!(
        "connected to {} ({} services)",
        options.ble_address,
        profile.services.len()
    );

    let error_slot: ErrorSlot = Arc::new(Mutex::new(None));
    let bridge_token = token.child();

    let pty = {
        let error_slot = Arc::clone(&error_slot);
        let bridge_token = bridge_token.clone();
        Arc::new(PtyEngine::open(PtyOptions {
            read_cap: options.read_cap,
            write_cap: options.write_cap,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            on_error: Some(Arc::new(move |err: &std::io::Error| {
                store_error(
                    &error_slot,
                    BridgeError::Pty(crate::error::PtyError::Io(std::io::Error::new(
                        err.kind(),
                        err.to_string(),
                    ))),
                );
                bridge_token.cancel();
            })),
        })?)
    };
    defer! { pty.close(); }

    let symlink_created = match &options.tty_symlink_path {
        Some(path) => {
            replace_symlink(path, Path::new(pty.tty_name())).map_err(crate::error::PtyError::Io)?;
            log::info!("created symlink {} -> {}", path.display(), pty.tty_name());
            true
        }
        None => false,
    };
    defer! {
        if symlink_created {
            if let Some(path) = &options.tty_symlink_path {
                if let Err(e) = std::fs::remove_file(path) {
                    log::warn!("failed to remove symlink {}: {}", path.display(), e);
                }
            }
        }
    }

    let runtime = Arc::new(ScriptRuntime::new()?);
    defer! { runtime.shutdown(); }

    runtime.load(&options.script_name, &options.script_source)?;
    drain_output(&runtime);

    // Script-driven subscription mode: load-time ble:subscribe{} requests
    // take over when the caller supplied none.
    let mut subscriptions = options.subscriptions.clone();
    let mut stream_mode = options.stream_mode;
    let mut max_rate = options.max_rate;
    for request in runtime.drain_subscribes() {
        if subscriptions.is_empty() {
            subscriptions = request.options;
            if let Some(mode) = request.mode {
                stream_mode = mode;
            }
            if let Some(rate) = request.max_rate {
                max_rate = rate;
            }
        } else {
            log::warn!("ignoring script subscription request; caller already subscribed");
        }
    }
    let subscriptions = resolve_subscriptions(subscriptions, &profile);

    // Disconnect watcher: distinguishes a dropped link from user cancel.
    let disconnected = Arc::new(AtomicBool::new(false));
    let watcher = {
        let disconnect = conn.disconnect_signal();
        let bridge_token = bridge_token.clone();
        let disconnected = Arc::clone(&disconnected);
        thread::Builder::new()
            .name("bridge-disconnect".into())
            .spawn(move || loop {
                if disconnect.wait_timeout(DEFAULT_POLL_TIMEOUT) {
                    if !bridge_token.is_cancelled() {
                        disconnected.store(true, Ordering::SeqCst);
                        bridge_token.cancel();
                    }
                    return;
                }
                if bridge_token.is_cancelled() {
                    return;
                }
            })
            .map_err(|e| TransportError::Protocol(format!("spawn failed: {e}")))?
    };
    // Unblock the watcher on every exit path; an unjoined watcher
    // self-terminates within one poll interval of this cancel.
    defer! { bridge_token.cancel(); }

    // Reverse path: PTY reads drive tty_to_ble, whose queued writes go to
    // the transport. The engine stores this callback, so it holds the
    // engine weakly to avoid keeping the fds alive through a cycle.
    {
        let runtime = Arc::clone(&runtime);
        let conn = Arc::clone(&conn);
        let pty_weak = Arc::downgrade(&pty);
        let error_slot = Arc::clone(&error_slot);
        let bridge_token = bridge_token.clone();
        pty.set_read_callback(Some(Arc::new(move |data: &[u8]| {
            match runtime.call_tty_to_ble(data) {
                Ok(()) => {}
                Err(e @ ScriptError::Fatal(_)) => {
                    store_error(&error_slot, BridgeError::Script(e));
                    bridge_token.cancel();
                    return;
                }
                Err(ScriptError::NonFatal(reason)) => {
                    log::debug!("tty_to_ble deferred: {}", reason);
                }
            }
            if let Some(pty) = pty_weak.upgrade() {
                drain_script_effects(&runtime, &conn, &pty, &error_slot, &bridge_token);
            }
        })));
    }

    // Forward path: aggregated records drive ble_to_tty, whose staged
    // bytes go to the PTY.
    let notify_engine = if subscriptions.is_empty() {
        log::warn!("no notification subscriptions; bridge is write-only");
        None
    } else {
        let runtime_cb = Arc::clone(&runtime);
        let conn_cb = Arc::clone(&conn);
        let pty_cb = Arc::clone(&pty);
        let error_slot_cb = Arc::clone(&error_slot);
        let token_cb = bridge_token.clone();
        let callback = Arc::new(move |record: Record| {
            cache_record_values(&runtime_cb, &record);
            match runtime_cb.call_ble_to_tty(&record) {
                Ok(()) => {}
                Err(e @ ScriptError::Fatal(_)) => {
                    store_error(&error_slot_cb, BridgeError::Script(e));
                    token_cb.cancel();
                    return;
                }
                Err(ScriptError::NonFatal(reason)) => {
                    log::debug!("ble_to_tty deferred: {}", reason);
                }
            }
            drain_script_effects(&runtime_cb, &conn_cb, &pty_cb, &error_slot_cb, &token_cb);
        });
        Some(NotificationEngine::start(
            Arc::clone(&conn),
            &subscriptions,
            stream_mode,
            max_rate,
            callback,
            &bridge_token,
        )?)
    };

    progress(BridgeProgress::Running);
    log::info!("bridge running: {}", pty.tty_name());

    let handle = BridgeHandle {
        tty_path: pty.tty_name().to_string(),
        token: bridge_token.clone(),
        pty: Arc::clone(&pty),
    };
    bridge_cb(&handle);

    // The callback returned; whatever the reason, shut down in order.
    bridge_token.cancel();
    progress(BridgeProgress::ShuttingDown);

    if let Some(engine) = &notify_engine {
        engine.stop();
        if engine.dropped_records() > 0 {
            log::warn!(
                "{} notification records were dropped under backpressure",
                engine.dropped_records()
            );
        }
    }
    pty.set_read_callback(None);
    pty.close();
    runtime.shutdown();
    conn.close();
    let _ = watcher.join();
    drain_output(&runtime);

    if let Some(error) = error_slot.lock().expect("bridge error slot poisoned").take() {
        return Err(error);
    }
    if disconnected.load(Ordering::SeqCst) {
        return Err(BridgeError::ConnectionLost);
    }
    Ok(())
}

/// Forward queued script effects to their destinations.
///
/// Called after every transform invocation: staged bytes go to the PTY
/// write ring, queued GATT writes go to the transport, and print output
/// goes to the log.
fn drain_script_effects(
    runtime: &ScriptRuntime,
    conn: &Arc<dyn GattConnection>,
    pty: &PtyEngine,
    error_slot: &ErrorSlot,
    token: &CancelToken,
) {
    let staged = runtime.drain_staged();
    if !staged.is_empty() {
        match pty.write(&staged) {
            Ok(_) => {}
            Err(crate::error::PtyError::Closed) => {}
            Err(e) => {
                store_error(error_slot, BridgeError::Pty(e));
                token.cancel();
            }
        }
    }

    for write in runtime.drain_writes() {
        match conn.write(
            &write.uuid,
            &write.data,
            write.with_response,
            DEFAULT_GATT_OP_TIMEOUT,
        ) {
            Ok(()) => {}
            Err(TransportError::Disconnected) => {
                // The watcher turns this into ConnectionLost.
                token.cancel();
            }
            Err(e) => {
                log::warn!("gatt write to {} failed: {}", write.uuid, e);
                store_error(error_slot, BridgeError::Transport(e));
                token.cancel();
            }
        }
    }

    drain_output(runtime);
}

fn drain_output(runtime: &ScriptRuntime) {
    for line in runtime.drain_output() {
        log::info!(target: "script", "{}", line);
    }
}

/// Keep the script's `ble.get`/`ble.list` cache current.
fn cache_record_values(runtime: &ScriptRuntime, record: &Record) {
    if let Some(values) = &record.values {
        for (uuid, value) in values {
            runtime.update_value(uuid, value);
        }
    }
    if let Some(batches) = &record.batch_values {
        for (uuid, batch) in batches {
            if let Some(last) = batch.last() {
                runtime.update_value(uuid, last);
            }
        }
    }
}

/// Expand empty characteristic lists into every notifying characteristic
/// of the named service, and drop subscriptions nothing can satisfy.
fn resolve_subscriptions(
    subscriptions: Vec<SubscribeOptions>,
    profile: &Profile,
) -> Vec<SubscribeOptions> {
    let mut resolved = Vec::new();
    for mut opts in subscriptions {
        if opts.characteristic_uuids.is_empty() {
            let service = profile
                .services
                .iter()
                .find(|s| crate::gatt::uuid::matches(&s.uuid, &opts.service_uuid));
            match service {
                Some(service) => {
                    opts.characteristic_uuids = service
                        .characteristics
                        .iter()
                        .filter(|c| c.properties.notify || c.properties.indicate)
                        .map(|c| c.uuid.clone())
                        .collect();
                }
                None => {
                    log::warn!("service {} not found on peripheral", opts.service_uuid);
                    continue;
                }
            }
        }
        if opts.characteristic_uuids.is_empty() {
            log::warn!(
                "service {} has no notifying characteristics",
                opts.service_uuid
            );
            continue;
        }
        resolved.push(opts);
    }
    resolved
}

/// Atomically create or replace a symlink at `link` pointing at `target`.
///
/// A fresh symlink is created next to the destination and renamed over it,
/// so an existing link is never observed half-updated.
fn replace_symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    let parent = link.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let staging = parent.join(format!(
        ".{}.tmp-{}",
        link.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bletty".into()),
        std::process::id()
    ));
    let _ = std::fs::remove_file(&staging);
    std::os::unix::fs::symlink(target, &staging)?;
    std::fs::rename(&staging, link)
}
