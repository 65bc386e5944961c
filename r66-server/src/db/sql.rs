//! SQL query constants for database operations
//!
//! This module contains all SQL queries used by the database layer.
//! Each query is documented with its parameters and special behaviors.

// ========================================================================
// Configuration Query Operations
// ========================================================================

/// Get a configuration value by key
///
/// **Parameters:**
/// 1. `key: &str` - Configuration key to look up
///
/// **Returns:** `(value: String)`
pub const SQL_GET_CONFIG: &str = "SELECT value FROM config WHERE key = ?";

/// Set a configuration value (update existing key)
///
/// **Parameters:**
/// 1. `value: &str` - New configuration value
/// 2. `key: &str` - Configuration key to update
///
/// **Note:** Only updates existing keys; does not insert new ones.
pub const SQL_SET_CONFIG: &str = "UPDATE config SET value = ? WHERE key = ?";

/// Insert a configuration value unless the key already exists
///
/// **Parameters:**
/// 1. `key: &str` - Configuration key
/// 2. `value: &str` - Value to store if absent
pub const SQL_INSERT_CONFIG_IF_ABSENT: &str =
    "INSERT INTO config (key, value) VALUES (?, ?) ON CONFLICT(key) DO NOTHING";

// ========================================================================
// Blacklist Query Operations
// ========================================================================

/// Insert or update a blacklist entry
///
/// **Parameters:**
/// 1. `kind: &str` - `address` or `host`
/// 2. `value: &str` - IP/CIDR or host identifier
/// 3. `reason: Option<&str>` - Free-form reason
/// 4. `created_at: i64` - Current Unix timestamp
/// 5. `expires_at: Option<i64>` - Expiry timestamp (NULL = permanent)
pub const SQL_UPSERT_BLACKLIST: &str = "
    INSERT INTO blacklist (kind, value, reason, created_at, expires_at)
    VALUES (?, ?, ?, ?, ?)
    ON CONFLICT(kind, value) DO UPDATE SET
        reason = excluded.reason,
        created_at = excluded.created_at,
        expires_at = excluded.expires_at";

/// Select one blacklist entry regardless of expiry
///
/// **Parameters:**
/// 1. `kind: &str`
/// 2. `value: &str`
pub const SQL_SELECT_BLACKLIST_ENTRY: &str = "
    SELECT id, kind, value, reason, created_at, expires_at
    FROM blacklist
    WHERE kind = ? AND value = ?";

/// Select all non-expired blacklist entries
///
/// **Parameters:**
/// 1. `now: i64` - Current Unix timestamp
pub const SQL_SELECT_ACTIVE_BLACKLIST: &str = "
    SELECT id, kind, value, reason, created_at, expires_at
    FROM blacklist
    WHERE expires_at IS NULL OR expires_at > ?
    ORDER BY created_at DESC";

/// Delete a blacklist entry
///
/// **Parameters:**
/// 1. `kind: &str`
/// 2. `value: &str`
pub const SQL_DELETE_BLACKLIST_ENTRY: &str = "DELETE FROM blacklist WHERE kind = ? AND value = ?";

/// Delete all expired blacklist entries
///
/// **Parameters:**
/// 1. `now: i64` - Current Unix timestamp
///
/// **Note:** Called on server startup to clean up stale entries.
pub const SQL_DELETE_EXPIRED_BLACKLIST: &str =
    "DELETE FROM blacklist WHERE expires_at IS NOT NULL AND expires_at <= ?";

// ========================================================================
// Run ID Allocation
// ========================================================================

/// Advance the run sequence and return the new value in one round trip
///
/// **Parameters:**
/// 1. `name: &str` - Sequence name
///
/// **Returns:** `(value: i64)`
pub const SQL_NEXT_SEQUENCE_VALUE: &str =
    "UPDATE run_sequence SET value = value + 1 WHERE name = ? RETURNING value";

/// Insert into the auto-increment id table; the new rowid is the run id
///
/// **Parameters:**
/// 1. `allocated_at: i64` - Current Unix timestamp
pub const SQL_INSERT_RUN_ID: &str = "INSERT INTO run_ids (allocated_at) VALUES (?)";

/// Read the current counter value
///
/// **Parameters:**
/// 1. `name: &str` - Counter name
///
/// **Returns:** `(value: i64)`
pub const SQL_SELECT_COUNTER: &str = "SELECT value FROM run_counter WHERE name = ?";

/// Compare-and-swap the counter
///
/// **Parameters:**
/// 1. `new_value: i64`
/// 2. `name: &str`
/// 3. `expected: i64` - Value read by `SQL_SELECT_COUNTER`
///
/// **Note:** Affects zero rows when another allocator won the race.
pub const SQL_SWAP_COUNTER: &str = "UPDATE run_counter SET value = ? WHERE name = ? AND value = ?";

// ========================================================================
// Run Query Operations
// ========================================================================

/// Insert a new run in `init` status
///
/// **Parameters:**
/// 1. `id: i64` - Allocated run id
/// 2. `rule_name: &str`
/// 3. `requester: &str`
/// 4. `requested: &str`
/// 5. `filename: &str`
/// 6. `is_sender: bool`
/// 7. `peer_run_id: Option<i64>`
/// 8. `block_size: i64`
/// 9. `start_time: i64`
/// 10. `owner: Option<i64>` - Instance creating the run
pub const SQL_INSERT_RUN: &str = "
    INSERT INTO runs (id, rule_name, requester, requested, filename, is_sender,
                      peer_run_id, block_size, rank, status, start_time, owner)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 'init', ?, ?)";

/// Full run select in `RunRow` column order, followed by a filter clause
macro_rules! select_runs {
    ($filter:literal) => {
        concat!(
            "SELECT id, rule_name, requester, requested, filename, is_sender, peer_run_id, ",
            "block_size, rank, status, global_step, step, start_time, stop_time, error_info, ",
            "owner ",
            "FROM runs ",
            $filter
        )
    };
}

/// Select a run by id
///
/// **Parameters:**
/// 1. `id: i64`
pub const SQL_SELECT_RUN: &str = select_runs!("WHERE id = ?");

/// Select all runs in a status, oldest first
///
/// **Parameters:**
/// 1. `status: &str`
pub const SQL_SELECT_RUNS_BY_STATUS: &str = select_runs!("WHERE status = ? ORDER BY id");

/// Select only the status of a run
///
/// **Parameters:**
/// 1. `id: i64`
///
/// **Returns:** `(status: String)`
pub const SQL_SELECT_RUN_STATUS: &str = "SELECT status FROM runs WHERE id = ?";

/// Advance the rank if the new value is larger and the run is running
///
/// **Parameters:**
/// 1. `rank: i32` - New rank
/// 2. `id: i64`
/// 3. `rank: i32` - Same value as parameter 1
///
/// **Note:** Affects zero rows for stale ranks and for runs that are not
/// `running`, which callers treat as a no-op. An interrupted run keeps the
/// rank it resumes from.
pub const SQL_ADVANCE_RANK: &str = "
    UPDATE runs SET rank = ?
    WHERE id = ? AND rank < ? AND status = 'running'";

/// Compare-and-swap the status of a run
///
/// **Parameters:**
/// 1. `status: &str` - New status
/// 2. `error_info: Option<&str>` - Replaces the stored value when not NULL
/// 3. `stop_time: Option<i64>` - New stop time (NULL clears it)
/// 4. `owner: Option<i64>` - Replaces the owning instance when not NULL
/// 5. `id: i64`
/// 6. `expected: &str` - Status read before the transition was validated
pub const SQL_SWAP_RUN_STATUS: &str = "
    UPDATE runs SET status = ?, error_info = COALESCE(?, error_info), stop_time = ?,
                    owner = COALESCE(?, owner)
    WHERE id = ? AND status = ?";

/// Record the pipeline position of a run
///
/// **Parameters:**
/// 1. `global_step: &str`
/// 2. `step: i32`
/// 3. `id: i64`
pub const SQL_UPDATE_RUN_STEP: &str = "UPDATE runs SET global_step = ?, step = ? WHERE id = ?";

/// Record the peer's id for this run
///
/// **Parameters:**
/// 1. `peer_run_id: i64`
/// 2. `id: i64`
pub const SQL_UPDATE_PEER_RUN_ID: &str = "UPDATE runs SET peer_run_id = ? WHERE id = ?";

/// Mark running runs whose owner is no longer alive as interrupted
///
/// **Parameters:**
/// 1. `stop_time: i64`
/// 2. `live_since: i64` - Instances with an older heartbeat count as dead
///
/// **Note:** Runs without an owner are always orphans. Runs of a live
/// instance are left alone, even when another process shares the database.
pub const SQL_INTERRUPT_ORPHANED: &str = "
    UPDATE runs SET status = 'interrupted', stop_time = ?
    WHERE status = 'running'
      AND (owner IS NULL
           OR owner NOT IN (SELECT id FROM instances WHERE heartbeat_at > ?))";

/// Fail runs that never left `init` and whose owner is no longer alive
///
/// **Parameters:**
/// 1. `error_info: &str`
/// 2. `stop_time: i64`
/// 3. `live_since: i64` - Instances with an older heartbeat count as dead
pub const SQL_FAIL_ORPHANED: &str = "
    UPDATE runs SET status = 'error', error_info = ?, stop_time = ?
    WHERE status = 'init'
      AND (owner IS NULL
           OR owner NOT IN (SELECT id FROM instances WHERE heartbeat_at > ?))";

// ========================================================================
// Instance Operations
// ========================================================================

/// Register a process using the database
///
/// **Parameters:**
/// 1. `pid: i64`
/// 2. `started_at: i64`
/// 3. `heartbeat_at: i64`
pub const SQL_INSERT_INSTANCE: &str =
    "INSERT INTO instances (pid, started_at, heartbeat_at) VALUES (?, ?, ?)";

/// Refresh an instance heartbeat, recreating the row if a sweep removed it
///
/// **Parameters:**
/// 1. `id: i64`
/// 2. `pid: i64`
/// 3. `now: i64` - Used for `started_at` on re-creation and for `heartbeat_at`
pub const SQL_INSTANCE_HEARTBEAT: &str = "
    INSERT INTO instances (id, pid, started_at, heartbeat_at)
    VALUES (?1, ?2, ?3, ?3)
    ON CONFLICT(id) DO UPDATE SET heartbeat_at = excluded.heartbeat_at";

/// Remove an instance
///
/// **Parameters:**
/// 1. `id: i64`
pub const SQL_DELETE_INSTANCE: &str = "DELETE FROM instances WHERE id = ?";

/// Remove instances whose heartbeat is too old
///
/// **Parameters:**
/// 1. `live_since: i64`
pub const SQL_DELETE_STALE_INSTANCES: &str = "DELETE FROM instances WHERE heartbeat_at <= ?";

// ========================================================================
// Host Operations
// ========================================================================

/// Insert or replace the key hash of a partner host
///
/// **Parameters:**
/// 1. `host_id: &str`
/// 2. `key_hash: &str` - Argon2 PHC string
/// 3. `created_at: i64`
pub const SQL_UPSERT_HOST: &str = "
    INSERT INTO hosts (host_id, key_hash, created_at)
    VALUES (?, ?, ?)
    ON CONFLICT(host_id) DO UPDATE SET key_hash = excluded.key_hash";

/// Select the key hash of a host
///
/// **Parameters:**
/// 1. `host_id: &str`
///
/// **Returns:** `(key_hash: String)`
pub const SQL_SELECT_HOST_KEY: &str = "SELECT key_hash FROM hosts WHERE host_id = ?";

/// List all host ids
pub const SQL_SELECT_HOST_IDS: &str = "SELECT host_id FROM hosts ORDER BY host_id";

/// Delete a host
///
/// **Parameters:**
/// 1. `host_id: &str`
pub const SQL_DELETE_HOST: &str = "DELETE FROM hosts WHERE host_id = ?";

// ========================================================================
// Rule Query Operations
// ========================================================================

/// Select a rule by name
///
/// **Parameters:**
/// 1. `name: &str`
///
/// **Returns:** `(name, pre_tasks, post_tasks, error_tasks)` with JSON task lists
pub const SQL_SELECT_RULE: &str =
    "SELECT name, pre_tasks, post_tasks, error_tasks FROM rules WHERE name = ?";

/// Insert or replace a rule
///
/// **Parameters:**
/// 1. `name: &str`
/// 2. `pre_tasks: &str` - JSON array
/// 3. `post_tasks: &str` - JSON array
/// 4. `error_tasks: &str` - JSON array
pub const SQL_UPSERT_RULE: &str = "
    INSERT INTO rules (name, pre_tasks, post_tasks, error_tasks)
    VALUES (?, ?, ?, ?)
    ON CONFLICT(name) DO UPDATE SET
        pre_tasks = excluded.pre_tasks,
        post_tasks = excluded.post_tasks,
        error_tasks = excluded.error_tasks";

/// List all rule names
pub const SQL_SELECT_RULE_NAMES: &str = "SELECT name FROM rules ORDER BY name";

/// Delete a rule
///
/// **Parameters:**
/// 1. `name: &str`
pub const SQL_DELETE_RULE: &str = "DELETE FROM rules WHERE name = ?";
