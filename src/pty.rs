//! Non-blocking PTY I/O engine.
//!
//! Owns a pseudo-terminal master/slave pair and bridges it to a pair of
//! [`RingBuffer`]s with poll-driven background loops. A legacy serial
//! application opens the slave path; the bridge reads and writes through
//! this engine without ever blocking.
//!
//! # Workers
//!
//! Three loops are spawned at construction and share `Arc` handles to the
//! master fd:
//!
//! - `read_loop`: poll(POLLIN) → read → read ring → wake dispatcher
//! - `write_loop`: write ring → poll(POLLOUT) → write
//! - `dispatcher`: drains the read ring into the registered callback in
//!   bounded batches
//!
//! All three observe a cancellation token each iteration and use the poll
//! timeout as their maximum sleep, so the engine shuts down within one poll
//! interval of `close()` even if the join deadline expires and the workers
//! are abandoned. The fds close when the last `Arc` handle drops, which is
//! after the last worker exits.

use std::io;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::cancel::CancelToken;
use crate::constants::{
    DEFAULT_POLL_TIMEOUT, DEFAULT_RING_CAPACITY, DISPATCH_BATCH_CHUNKS, IO_SCRATCH_SIZE,
    SHUTDOWN_TIMEOUT_FLOOR,
};
use crate::error::PtyError;
use crate::ring::RingBuffer;

/// Callback invoked by the dispatcher for each chunk read from the PTY.
pub type ReadCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback invoked at most once when a worker loop hits a terminal error.
pub type ErrorCallback = Arc<dyn Fn(&io::Error) + Send + Sync>;

/// Construction options for [`PtyEngine::open`].
#[derive(Clone)]
pub struct PtyOptions {
    /// Capacity of the PTY→caller ring.
    pub read_cap: usize,
    /// Capacity of the caller→PTY ring.
    pub write_cap: usize,
    /// Maximum sleep of each worker loop; also bounds shutdown latency.
    pub poll_timeout: Duration,
    /// Terminal-error callback, fired at most once across all workers.
    pub on_error: Option<ErrorCallback>,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            read_cap: DEFAULT_RING_CAPACITY,
            write_cap: DEFAULT_RING_CAPACITY,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            on_error: None,
        }
    }
}

/// Snapshot of engine counters and ring occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyStats {
    pub read_len: usize,
    pub read_cap: usize,
    pub write_len: usize,
    pub write_cap: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub dropped_read: u64,
    pub dropped_write: u64,
}

/// Owned fd that closes on drop. Workers hold clones of an `Arc<PtyFd>` so
/// the descriptor outlives abandoned workers and closes exactly once.
struct PtyFd(RawFd);

impl PtyFd {
    fn raw(&self) -> RawFd {
        self.0
    }
}

impl Drop for PtyFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// One-shot terminal error reporter shared by the worker loops.
struct ErrorReporter {
    fired: AtomicBool,
    callback: Option<ErrorCallback>,
}

impl ErrorReporter {
    fn fire(&self, err: &io::Error) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        log::error!("pty engine terminal error: {}", err);
        if let Some(cb) = &self.callback {
            cb(err);
        }
    }
}

/// Tracks worker exits so close() can wait with a deadline.
struct WorkerTracker {
    exited: Mutex<usize>,
    cond: Condvar,
}

impl WorkerTracker {
    fn new() -> Self {
        Self {
            exited: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn signal_exit(&self) {
        let mut exited = self.exited.lock().expect("worker tracker mutex poisoned");
        *exited += 1;
        self.cond.notify_all();
    }

    /// Wait until `count` workers have exited or the deadline passes.
    fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut exited = self.exited.lock().expect("worker tracker mutex poisoned");
        while *exited < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .cond
                .wait_timeout(exited, deadline - now)
                .expect("worker tracker mutex poisoned");
            exited = next;
        }
        true
    }
}

/// Ring-buffered, poll-driven PTY master wrapper.
///
/// See the module docs for the worker model. All public methods are
/// non-blocking; `close()` is the only call that waits, and only up to the
/// shutdown deadline.
pub struct PtyEngine {
    /// Keeps the master alive even after all workers have exited (e.g. on
    /// EOF) so the slave path stays valid for the engine's lifetime.
    _master: Arc<PtyFd>,
    /// Held open for the engine's lifetime so reads on the master don't
    /// return EIO while no client has the slave open.
    _slave: Arc<PtyFd>,
    tty_name: String,
    poll_timeout: Duration,
    closed: AtomicBool,
    token: CancelToken,
    read_ring: Arc<RingBuffer>,
    write_ring: Arc<RingBuffer>,
    read_callback: Arc<Mutex<Option<ReadCallback>>>,
    bytes_read: Arc<AtomicU64>,
    bytes_written: Arc<AtomicU64>,
    write_wake: SyncSender<()>,
    dispatch_wake: SyncSender<()>,
    tracker: Arc<WorkerTracker>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PtyEngine {
    /// Open a master/slave pair, configure it, and start the workers.
    ///
    /// The slave is put into raw mode (no echo, no canonical line
    /// discipline, no signal generation, 8-bit clean) and the master is set
    /// non-blocking.
    ///
    /// # Errors
    ///
    /// Returns `PtyError::Io` if any of the underlying syscalls fail.
    pub fn open(options: PtyOptions) -> Result<Self, PtyError> {
        let (master_fd, slave_fd) = openpty()?;
        let master = Arc::new(PtyFd(master_fd));
        let slave = Arc::new(PtyFd(slave_fd));

        set_raw_mode(slave.raw())?;
        set_nonblocking(master.raw())?;
        set_cloexec(master.raw())?;
        set_cloexec(slave.raw())?;
        let tty_name = tty_name_of(slave.raw())?;

        let read_ring = Arc::new(RingBuffer::new(options.read_cap));
        let write_ring = Arc::new(RingBuffer::new(options.write_cap));
        let read_callback: Arc<Mutex<Option<ReadCallback>>> = Arc::new(Mutex::new(None));
        let bytes_read = Arc::new(AtomicU64::new(0));
        let bytes_written = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(ErrorReporter {
            fired: AtomicBool::new(false),
            callback: options.on_error.clone(),
        });
        let token = CancelToken::new();
        let tracker = Arc::new(WorkerTracker::new());

        // One-slot wake channels: a pending wake coalesces with new ones.
        let (write_wake, write_wake_rx) = mpsc::sync_channel::<()>(1);
        let (dispatch_wake, dispatch_wake_rx) = mpsc::sync_channel::<()>(1);

        let mut workers = Vec::with_capacity(3);

        {
            let master = Arc::clone(&master);
            let ring = Arc::clone(&read_ring);
            let token = token.clone();
            let errors = Arc::clone(&errors);
            let tracker = Arc::clone(&tracker);
            let bytes_read = Arc::clone(&bytes_read);
            let wake = dispatch_wake.clone();
            let poll_timeout = options.poll_timeout;
            workers.push(
                thread::Builder::new()
                    .name("pty-read".into())
                    .spawn(move || {
                        read_loop(&master, &ring, &token, poll_timeout, &errors, &bytes_read, &wake);
                        tracker.signal_exit();
                    })
                    .map_err(io::Error::from)?,
            );
        }

        {
            let master = Arc::clone(&master);
            let ring = Arc::clone(&write_ring);
            let token = token.clone();
            let errors = Arc::clone(&errors);
            let tracker = Arc::clone(&tracker);
            let bytes_written = Arc::clone(&bytes_written);
            let poll_timeout = options.poll_timeout;
            workers.push(
                thread::Builder::new()
                    .name("pty-write".into())
                    .spawn(move || {
                        write_loop(
                            &master,
                            &ring,
                            &token,
                            poll_timeout,
                            &errors,
                            &bytes_written,
                            write_wake_rx,
                        );
                        tracker.signal_exit();
                    })
                    .map_err(io::Error::from)?,
            );
        }

        {
            let ring = Arc::clone(&read_ring);
            let token = token.clone();
            let errors = Arc::clone(&errors);
            let tracker = Arc::clone(&tracker);
            let callback = Arc::clone(&read_callback);
            let poll_timeout = options.poll_timeout;
            workers.push(
                thread::Builder::new()
                    .name("pty-dispatch".into())
                    .spawn(move || {
                        dispatch_loop(&ring, &token, poll_timeout, &errors, &callback, dispatch_wake_rx);
                        tracker.signal_exit();
                    })
                    .map_err(io::Error::from)?,
            );
        }

        log::debug!(
            "pty engine opened: {} (read_cap={}, write_cap={}, poll={}ms)",
            tty_name,
            options.read_cap,
            options.write_cap,
            options.poll_timeout.as_millis()
        );

        Ok(Self {
            _master: master,
            _slave: slave,
            tty_name,
            poll_timeout: options.poll_timeout,
            closed: AtomicBool::new(false),
            token,
            read_ring,
            write_ring,
            read_callback,
            bytes_read,
            bytes_written,
            write_wake,
            dispatch_wake,
            tracker,
            workers: Mutex::new(workers),
        })
    }

    /// Enqueue bytes toward the PTY. Never blocks.
    ///
    /// Overflow drops the oldest queued bytes (accounted in
    /// `stats().dropped_write`). Returns the accepted count, which is the
    /// full input length.
    ///
    /// # Errors
    ///
    /// `PtyError::Closed` after [`PtyEngine::close`].
    pub fn write(&self, bytes: &[u8]) -> Result<usize, PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PtyError::Closed);
        }
        if bytes.is_empty() {
            return Ok(0);
        }
        let outcome = self.write_ring.write(bytes);
        if outcome.dropped > 0 {
            log::warn!(
                "pty write ring overflow: dropped {} oldest bytes",
                outcome.dropped
            );
        }
        let _ = self.write_wake.try_send(());
        Ok(outcome.accepted)
    }

    /// Drain buffered PTY output into `buf`. Never blocks.
    ///
    /// # Errors
    ///
    /// `PtyError::WouldBlock` when no data is buffered;
    /// `PtyError::Closed` after [`PtyEngine::close`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PtyError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.read_ring.try_read(buf);
        if n == 0 {
            return Err(PtyError::WouldBlock);
        }
        Ok(n)
    }

    /// Install or clear the async data-arrival callback.
    ///
    /// Safe to call concurrently; the dispatcher picks up the change no
    /// later than its next batch (at most [`DISPATCH_BATCH_CHUNKS`] chunks).
    pub fn set_read_callback(&self, callback: Option<ReadCallback>) {
        *self
            .read_callback
            .lock()
            .expect("read callback mutex poisoned") = callback;
        // Kick the dispatcher so an install drains already-buffered data.
        let _ = self.dispatch_wake.try_send(());
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn stats(&self) -> PtyStats {
        PtyStats {
            read_len: self.read_ring.len(),
            read_cap: self.read_ring.capacity(),
            write_len: self.write_ring.len(),
            write_cap: self.write_ring.capacity(),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            dropped_read: self.read_ring.dropped(),
            dropped_write: self.write_ring.dropped(),
        }
    }

    /// Path of the slave device (e.g. `/dev/pts/5`).
    #[must_use]
    pub fn tty_name(&self) -> &str {
        &self.tty_name
    }

    /// Whether `close()` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shut the engine down. Idempotent.
    ///
    /// Cancels the workers, then waits up to
    /// `max(poll_timeout * 3 + 1s, 5s)` for them to exit. On deadline
    /// expiry the workers are abandoned with a warning; they self-terminate
    /// within one poll interval and the fds close when the last of them
    /// drops its handle.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        let _ = self.write_wake.try_send(());
        let _ = self.dispatch_wake.try_send(());

        let deadline =
            std::cmp::max(self.poll_timeout * 3 + Duration::from_secs(1), SHUTDOWN_TIMEOUT_FLOOR);
        let handles = {
            let mut workers = self.workers.lock().expect("worker list mutex poisoned");
            std::mem::take(&mut *workers)
        };
        let count = handles.len();
        if self.tracker.wait_for(count, deadline) {
            for handle in handles {
                let _ = handle.join();
            }
            log::debug!("pty engine closed: {}", self.tty_name);
        } else {
            // Abandoned workers still hold Arc<PtyFd>; they observe the
            // cancelled token within one poll interval and exit, dropping
            // the last fd handles.
            log::warn!(
                "pty engine close timed out after {:?}; abandoning workers",
                deadline
            );
        }
    }
}

impl Drop for PtyEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PtyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyEngine")
            .field("tty_name", &self.tty_name)
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Worker loops
// ============================================================================

fn read_loop(
    master: &PtyFd,
    ring: &RingBuffer,
    token: &CancelToken,
    poll_timeout: Duration,
    errors: &ErrorReporter,
    bytes_read: &AtomicU64,
    dispatch_wake: &SyncSender<()>,
) {
    let mut scratch = [0u8; IO_SCRATCH_SIZE];
    while !token.is_cancelled() {
        match poll_fd(master.raw(), libc::POLLIN, poll_timeout) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(err) => {
                if err.raw_os_error() == Some(libc::EBADF) {
                    return;
                }
                errors.fire(&err);
                return;
            }
        }
        let n = unsafe {
            libc::read(
                master.raw(),
                scratch.as_mut_ptr().cast::<libc::c_void>(),
                scratch.len(),
            )
        };
        if n == 0 {
            log::debug!("pty master EOF");
            return;
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                // EIO from the master means the slave side is gone.
                Some(libc::EIO) | Some(libc::EBADF) => return,
                _ => {
                    errors.fire(&err);
                    return;
                }
            }
        }
        let chunk = &scratch[..n as usize];
        bytes_read.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        let outcome = ring.write(chunk);
        if outcome.dropped > 0 {
            log::warn!(
                "pty read ring overflow: dropped {} oldest bytes",
                outcome.dropped
            );
        }
        let _ = dispatch_wake.try_send(());
    }
}

fn write_loop(
    master: &PtyFd,
    ring: &RingBuffer,
    token: &CancelToken,
    poll_timeout: Duration,
    errors: &ErrorReporter,
    bytes_written: &AtomicU64,
    wake: Receiver<()>,
) {
    let mut scratch = [0u8; IO_SCRATCH_SIZE];
    while !token.is_cancelled() {
        if ring.is_empty() {
            // Sleep until data arrives or a poll interval passes; both the
            // wake channel and the timeout honour cancellation promptly.
            let _ = wake.recv_timeout(poll_timeout);
            continue;
        }
        match poll_fd(master.raw(), libc::POLLOUT, poll_timeout) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(err) => {
                if err.raw_os_error() == Some(libc::EBADF) {
                    return;
                }
                errors.fire(&err);
                return;
            }
        }
        let n = ring.try_read(&mut scratch);
        let mut offset = 0;
        while offset < n {
            if token.is_cancelled() {
                return;
            }
            let rc = unsafe {
                libc::write(
                    master.raw(),
                    scratch[offset..n].as_ptr().cast::<libc::c_void>(),
                    n - offset,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => {
                        match poll_fd(master.raw(), libc::POLLOUT, poll_timeout) {
                            Ok(_) => continue,
                            Err(err) => {
                                if err.raw_os_error() != Some(libc::EBADF) {
                                    errors.fire(&err);
                                }
                                return;
                            }
                        }
                    }
                    Some(libc::EBADF) => return,
                    _ => {
                        errors.fire(&err);
                        return;
                    }
                }
            }
            offset += rc as usize;
            bytes_written.fetch_add(rc as u64, Ordering::Relaxed);
        }
    }
}

fn dispatch_loop(
    ring: &RingBuffer,
    token: &CancelToken,
    poll_timeout: Duration,
    errors: &ErrorReporter,
    callback: &Mutex<Option<ReadCallback>>,
    wake: Receiver<()>,
) {
    let mut scratch = [0u8; IO_SCRATCH_SIZE];
    let mut pool = BytesMut::with_capacity(IO_SCRATCH_SIZE);
    while !token.is_cancelled() {
        let _ = wake.recv_timeout(poll_timeout);
        loop {
            if token.is_cancelled() {
                return;
            }
            // Re-read each batch so set_read_callback takes effect within
            // one batch.
            let Some(cb) = callback
                .lock()
                .expect("read callback mutex poisoned")
                .clone()
            else {
                break;
            };
            let mut delivered = 0;
            for _ in 0..DISPATCH_BATCH_CHUNKS {
                let n = ring.try_read(&mut scratch);
                if n == 0 {
                    break;
                }
                pool.clear();
                pool.extend_from_slice(&scratch[..n]);
                let chunk = pool.split().freeze();
                let result = catch_unwind(AssertUnwindSafe(|| cb(&chunk)));
                if result.is_err() {
                    *callback
                        .lock()
                        .expect("read callback mutex poisoned") = None;
                    errors.fire(&io::Error::other("pty read callback panicked"));
                    return;
                }
                delivered += 1;
            }
            if delivered == 0 {
                break;
            }
            thread::yield_now();
        }
    }
}

// ============================================================================
// Syscall helpers
// ============================================================================

/// Poll a single fd for `events`, retrying on EINTR.
///
/// Returns `Ok(true)` when the fd is ready (or hung up / errored, which the
/// following read/write surfaces properly), `Ok(false)` on timeout.
fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}

fn openpty() -> Result<(RawFd, RawFd), PtyError> {
    let mut master: RawFd = -1;
    let mut slave: RawFd = -1;
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if rc != 0 {
        return Err(PtyError::Io(io::Error::last_os_error()));
    }
    Ok((master, slave))
}

/// Disable the line discipline on the slave: no echo, no canonical mode, no
/// signal generation, no CR/NL translation, 8-bit clean.
fn set_raw_mode(fd: RawFd) -> Result<(), PtyError> {
    unsafe {
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut termios) != 0 {
            return Err(PtyError::Io(io::Error::last_os_error()));
        }
        libc::cfmakeraw(&mut termios);
        if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
            return Err(PtyError::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<(), PtyError> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(PtyError::Io(io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
            return Err(PtyError::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> Result<(), PtyError> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(PtyError::Io(io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) != 0 {
            return Err(PtyError::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

fn tty_name_of(fd: RawFd) -> Result<String, PtyError> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::ttyname_r(fd, buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return Err(PtyError::Io(io::Error::from_raw_os_error(rc)));
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec())
        .map_err(|_| PtyError::Io(io::Error::other("non-utf8 tty name")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_reports_slave_path() {
        let engine = PtyEngine::open(PtyOptions::default()).expect("open pty");
        assert!(engine.tty_name().starts_with("/dev/"));
        engine.close();
    }

    #[test]
    fn test_closed_engine_rejects_io() {
        let engine = PtyEngine::open(PtyOptions::default()).expect("open pty");
        engine.close();
        assert!(matches!(engine.write(b"x"), Err(PtyError::Closed)));
        let mut buf = [0u8; 8];
        assert!(matches!(engine.read(&mut buf), Err(PtyError::Closed)));
        // Idempotent.
        engine.close();
    }

    #[test]
    fn test_zero_length_io_is_ok() {
        let engine = PtyEngine::open(PtyOptions::default()).expect("open pty");
        assert_eq!(engine.write(&[]).unwrap(), 0);
        let mut empty = [];
        assert_eq!(engine.read(&mut empty).unwrap(), 0);
        engine.close();
    }

    #[test]
    fn test_empty_read_would_block() {
        let engine = PtyEngine::open(PtyOptions::default()).expect("open pty");
        let mut buf = [0u8; 8];
        assert!(matches!(engine.read(&mut buf), Err(PtyError::WouldBlock)));
        engine.close();
    }

    #[test]
    fn test_rapid_open_close_churn() {
        for _ in 0..10 {
            let engine = PtyEngine::open(PtyOptions::default()).expect("open pty");
            engine.close();
        }
    }
}
