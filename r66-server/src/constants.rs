//! Server constants: configuration keys, defaults and user-facing strings

use std::time::Duration;

// ========================================================================
// Configuration Keys
// ========================================================================

pub const CONFIG_KEY_MAX_CONNECTIONS: &str = "max_connections";
pub const CONFIG_KEY_MAX_CONNECTIONS_PER_IP: &str = "max_connections_per_ip";
pub const CONFIG_KEY_BLACKLIST_DURATION_SECS: &str = "blacklist_duration_secs";
pub const CONFIG_KEY_ID_STRATEGY: &str = "id_strategy";

// ========================================================================
// Defaults
// ========================================================================

/// Global connection ceiling (0 = unlimited)
pub const DEFAULT_MAX_CONNECTIONS: usize = 0;

/// Per-IP connection ceiling (0 = unlimited)
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 0;

/// How long an address stays blacklisted after a protocol violation
pub const DEFAULT_BLACKLIST_DURATION_SECS: u64 = 300;

/// Interval between keep-alive packets on an idle connection
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the per-connection outbound packet queue
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Capacity of each channel's inbound packet queue
pub const CHANNEL_QUEUE_CAPACITY: usize = 64;

/// How long a full channel queue may block the reader before the channel
/// is closed
pub const CHANNEL_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between instance heartbeats
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// An instance without a heartbeat for this long is dead and its runs are
/// recovered
pub const INSTANCE_EXPIRY: Duration = Duration::from_secs(60);

/// Rule used by `send` when none is given
pub const DEFAULT_RULE: &str = "default";

/// Spool directory name under the data directory
pub const SPOOL_DIR_NAME: &str = "spool";

// ========================================================================
// Run error info
// ========================================================================

pub const INFO_CONNECTION_LOST: &str = "connection lost";
pub const INFO_CONNECTION_LOST_BEFORE_START: &str = "connection lost before transfer started";
pub const INFO_OWNER_STOPPED: &str = "owning process stopped before transfer started";
pub const INFO_UNKNOWN_RULE: &str = "unknown rule: ";
pub const INFO_NOT_RESUMABLE: &str = "run cannot be resumed: ";
pub const INFO_HOST_BLACKLISTED: &str = "requester is blacklisted";
pub const INFO_BAD_AUTHENTICATION: &str = "authentication failed";
pub const INFO_REQUESTER_MISMATCH: &str = "requester does not match authenticated host: ";
pub const INFO_CHANNEL_STALLED: &str = "channel stopped reading";
pub const INFO_BLOCK_OUT_OF_ORDER: &str = "block out of order: ";
pub const INFO_BLOCK_COUNT_MISMATCH: &str = "block count mismatch: ";
pub const INFO_INVALID_BLOCK_SIZE: &str = "invalid block size: ";
pub const INFO_INVALID_FILENAME: &str = "invalid file name: ";
pub const INFO_CANCELLED: &str = "cancelled";

// ========================================================================
// Startup Messages
// ========================================================================

pub const MSG_BANNER: &str = "R66 Transfer Server v";
pub const MSG_DATABASE: &str = "Database: ";
pub const MSG_SPOOL: &str = "Spool: ";
pub const MSG_ID_STRATEGY: &str = "Run id strategy: ";
pub const MSG_LISTENING: &str = "Listening on ";
pub const MSG_SHUTDOWN_RECEIVED: &str = "\nShutting down...";
pub const MSG_TRANSFER_FINISHED: &str = "Transfer finished, run ";

// ========================================================================
// Error Messages
// ========================================================================

pub const ERR_GENERIC: &str = "Error: ";
pub const ERR_DATABASE_INIT: &str = "Failed to initialize database: ";
pub const ERR_SPOOL_INIT: &str = "Failed to create spool directory: ";
pub const ERR_BIND_FAILED: &str = "Failed to bind to ";
pub const ERR_ID_STRATEGY: &str = "Cannot select run id strategy: ";
pub const ERR_RECOVERY: &str = "Failed to recover runs: ";
pub const ERR_INSTANCE: &str = "Failed to register instance: ";
pub const ERR_TRANSFER_FAILED: &str = "Transfer failed: ";
pub const ERR_SIGNAL_SIGTERM: &str = "Failed to install SIGTERM handler";
pub const ERR_SIGNAL_SIGINT: &str = "Failed to install SIGINT handler";
pub const ERR_SIGNAL_CTRLC: &str = "Failed to listen for Ctrl+C";
