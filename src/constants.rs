//! Application-wide constants for bletty.
//!
//! Centralizes timeouts, capacities, and intervals so the knobs that govern
//! latency and memory live in one place.
//!
//! # Categories
//!
//! - **PTY engine**: poll interval, ring capacities, dispatch batching
//! - **BLE**: connect/discover/write timeouts, scan duration
//! - **Streaming**: record queue depth, default emission rate
//! - **Scripting**: work queue depth, load/shutdown deadlines

use std::time::Duration;

// ============================================================================
// PTY engine
// ============================================================================

/// Poll timeout for the PTY read/write loops.
///
/// Bounds both idle CPU (one wakeup per interval) and shutdown latency
/// (every loop observes cancellation at least this often). 50 ms keeps
/// interactive use well under perceptible lag at near-zero idle cost.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Default capacity of each PTY ring buffer.
///
/// 4 KiB per direction is ample for interactive serial traffic; bulk
/// transfers overflow by design (overwrite-oldest with accounting).
pub const DEFAULT_RING_CAPACITY: usize = 4096;

/// Scratch buffer size for single read/write syscalls.
pub const IO_SCRATCH_SIZE: usize = 4096;

/// Maximum chunks the dispatcher hands to the read callback per batch
/// before yielding to the scheduler.
pub const DISPATCH_BATCH_CHUNKS: usize = 16;

/// Floor for the engine close deadline; the effective deadline is
/// `max(poll_timeout * 3 + 1s, SHUTDOWN_TIMEOUT_FLOOR)`.
pub const SHUTDOWN_TIMEOUT_FLOOR: Duration = Duration::from_secs(5);

// ============================================================================
// BLE
// ============================================================================

/// Default timeout for establishing a peripheral connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for service/characteristic discovery.
pub const DEFAULT_DISCOVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a single characteristic read or write.
pub const DEFAULT_GATT_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default scan window for the `scan` subcommand.
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(5);

// ============================================================================
// Notification streaming
// ============================================================================

/// Default minimum interval between emitted records for the rate-limited
/// stream modes (Batched, AggregatedLatest).
pub const DEFAULT_MAX_RATE: Duration = Duration::from_millis(100);

/// Depth of the bounded record queue between aggregation and the callback.
/// Overflow drops the oldest record and flags the next emission.
pub const RECORD_QUEUE_DEPTH: usize = 64;

// ============================================================================
// Scripting
// ============================================================================

/// Depth of the bounded work queue into the script runner thread.
pub const SCRIPT_QUEUE_DEPTH: usize = 64;

/// How long to wait for the script runner to finish its current job at
/// shutdown before abandoning it.
pub const SCRIPT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_timeout_keeps_idle_latency_low() {
        assert!(DEFAULT_POLL_TIMEOUT <= Duration::from_millis(50));
    }

    #[test]
    fn test_shutdown_floor_dominates_poll_timeout() {
        assert!(SHUTDOWN_TIMEOUT_FLOOR > DEFAULT_POLL_TIMEOUT * 3);
    }
}
