/**
 * Configuration constants for the sync cache and its watch transport
 */
/// Initial delay in seconds before a failed channel connection is retried
pub const INITIAL_BACKOFF_SECONDS: u64 = 1;

/// Maximum backoff in seconds between reconnect attempts
pub const MAX_BACKOFF_SECONDS: u64 = 60;

/// How often a channel's buffered messages are flushed to handlers, in ms
pub const BUFFER_FLUSH_INTERVAL_MS: u64 = 500;

/// Upper bound on buffered messages per channel; beyond this the oldest
/// buffered message is discarded (newest-biased eviction)
pub const DEFAULT_BUFFER_MAX_EVENTS: usize = 50_000;

/// Page size for incremental list runs
pub const DEFAULT_PAGE_LIMIT: u32 = 250;

/// Watch request timeout in seconds (294 vs 300 to allow 6 seconds for
/// graceful shutdown)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// Validate configuration constants at compile time
const _: () = {
    assert!(INITIAL_BACKOFF_SECONDS > 0, "INITIAL_BACKOFF_SECONDS must be greater than 0");
    assert!(
        MAX_BACKOFF_SECONDS >= INITIAL_BACKOFF_SECONDS,
        "MAX_BACKOFF_SECONDS must not be below the initial delay"
    );
    assert!(BUFFER_FLUSH_INTERVAL_MS > 0, "BUFFER_FLUSH_INTERVAL_MS must be greater than 0");
    assert!(DEFAULT_BUFFER_MAX_EVENTS > 0, "DEFAULT_BUFFER_MAX_EVENTS must be greater than 0");
    assert!(DEFAULT_PAGE_LIMIT > 0, "DEFAULT_PAGE_LIMIT must be greater than 0");
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
};
