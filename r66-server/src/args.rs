//! Command-line argument parsing

use clap::{Parser, Subcommand};
use r66_common::{DEFAULT_BLOCK_SIZE, DEFAULT_PORT};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::constants::DEFAULT_RULE;
use crate::db::IdStrategy;

/// Get default database path help text for current platform
fn default_database_help() -> String {
    #[cfg(target_os = "linux")]
    return "Database file path (default: ~/.local/share/r66d/r66.db)".to_string();

    #[cfg(target_os = "macos")]
    return "Database file path (default: ~/Library/Application Support/r66d/r66.db)".to_string();

    #[cfg(target_os = "windows")]
    return "Database file path (default: %APPDATA%\\r66d\\r66.db)".to_string();

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    return "Database file path (overrides platform default)".to_string();
}

/// R66 Transfer Server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// IP address to bind to (IPv4 or IPv6)
    #[arg(short, long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Database file path (overrides platform default)
    #[arg(short, long, help = default_database_help())]
    pub database: Option<PathBuf>,

    /// Directory received files are written to (default: next to the database)
    #[arg(short, long)]
    pub spool: Option<PathBuf>,

    /// Block size for outbound transfers, in bytes
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: u32,

    /// Run id strategy (only honored the first time a database is used)
    #[arg(long, value_enum)]
    pub id_strategy: Option<IdStrategy>,

    /// Global connection ceiling, 0 for unlimited (overrides the stored value)
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Per-IP connection ceiling, 0 for unlimited (overrides the stored value)
    #[arg(long)]
    pub max_connections_per_ip: Option<u32>,

    /// Blacklist addresses that fail host authentication or violate the
    /// framing protocol
    #[arg(long, default_value = "false")]
    pub blacklist_bad_auth: bool,

    /// Key presented when this node opens a channel to a peer
    #[arg(long, env = "R66_HOST_KEY", hide_env_values = true)]
    pub host_key: Option<String>,

    /// Enable debug logging
    #[arg(long, default_value = "false")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// One-shot client and administration commands; without one the server runs
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a file to a peer and wait for the outcome
    Send {
        /// Local file to send
        file: PathBuf,

        /// Peer address (host, host:port or ip:port)
        #[arg(long)]
        peer: String,

        /// Rule governing the transfer
        #[arg(long, default_value = DEFAULT_RULE)]
        rule: String,

        /// Requester name recorded on the run (default: bind address)
        #[arg(long)]
        requester: Option<String>,
    },

    /// Resume an interrupted outbound run
    Resume {
        /// Run id of the interrupted run
        run_id: i64,
    },

    /// Manage the hosts allowed to open channels
    Host {
        #[command(subcommand)]
        action: HostAction,
    },

    /// Manage stored blacklist entries (a running server loads them at start)
    Blacklist {
        #[command(subcommand)]
        action: BlacklistAction,
    },

    /// Manage transfer rules
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Show stored connection settings, changing those given
    Config {
        /// Global connection ceiling, 0 for unlimited
        #[arg(long)]
        max_connections: Option<u32>,

        /// Per-IP connection ceiling, 0 for unlimited
        #[arg(long)]
        max_connections_per_ip: Option<u32>,

        /// Seconds an automatically blacklisted address stays blacklisted
        #[arg(long)]
        blacklist_duration: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum HostAction {
    /// Register a host or replace its key
    Add {
        host_id: String,

        /// Key the host authenticates with
        #[arg(long, env = "R66_NEW_HOST_KEY", hide_env_values = true)]
        key: String,
    },
    /// Forget a host
    Remove { host_id: String },
    /// List registered hosts
    List,
}

#[derive(Subcommand, Debug)]
pub enum BlacklistAction {
    /// Blacklist an address, a CIDR range or (with --host) a host id
    Add {
        value: String,

        /// Treat the value as a host id
        #[arg(long)]
        host: bool,

        #[arg(long)]
        reason: Option<String>,

        /// Lifetime in seconds (default: permanent)
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Remove an entry
    Remove {
        value: String,

        /// Treat the value as a host id
        #[arg(long)]
        host: bool,
    },
    /// List entries that have not expired
    List,
}

#[derive(Subcommand, Debug)]
pub enum RuleAction {
    /// List rule names
    List,
    /// Print a rule as JSON
    Show { name: String },
    /// Create or replace a rule from a JSON file
    Set { file: PathBuf },
    /// Delete a rule
    Remove { name: String },
}
