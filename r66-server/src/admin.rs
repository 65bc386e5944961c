//! Database administration commands
//!
//! Each command edits one table and returns the text to print. Hosts and
//! rules are read per request, so a running server sees changes at once.
//! The blacklist and connection settings are loaded when a server starts.

use std::fmt::Write as _;
use std::io;
use std::path::Path;

use chrono::DateTime;

use crate::args::{BlacklistAction, HostAction, RuleAction};
use crate::blacklist::parse_ip_or_cidr;
use crate::db::blacklist::{BlacklistKind, BlacklistRecord};
use crate::db::host_key::{HostKeyError, hash_key};
use crate::db::rules::Rule;
use crate::db::{Database, now};
use crate::pipeline::{TaskError, build_task};

/// Errors from administration commands
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    HostKey(#[from] HostKeyError),

    #[error("invalid rule file: {0}")]
    RuleFile(#[from] serde_json::Error),

    #[error("rule '{rule}': {source}")]
    Task { rule: String, source: TaskError },

    #[error("invalid address or range: {0}")]
    InvalidAddress(String),

    #[error("{0} not found")]
    NotFound(String),
}

pub async fn host(db: &Database, action: HostAction) -> Result<String, AdminError> {
    match action {
        HostAction::Add { host_id, key } => {
            let key_hash = hash_key(&key, false)?;
            db.hosts.upsert(&host_id, &key_hash).await?;
            Ok(format!("host {host_id} saved"))
        }
        HostAction::Remove { host_id } => {
            if !db.hosts.delete(&host_id).await? {
                return Err(AdminError::NotFound(format!("host {host_id}")));
            }
            Ok(format!("host {host_id} removed"))
        }
        HostAction::List => Ok(db.hosts.list().await?.join("\n")),
    }
}

pub async fn blacklist(db: &Database, action: BlacklistAction) -> Result<String, AdminError> {
    match action {
        BlacklistAction::Add {
            value,
            host,
            reason,
            duration,
        } => {
            let kind = blacklist_kind(host);
            if kind == BlacklistKind::Address && parse_ip_or_cidr(&value).is_none() {
                return Err(AdminError::InvalidAddress(value));
            }
            let expires_at = duration.map(|secs| now() + secs as i64);
            let record = db
                .blacklist
                .upsert(kind, &value, reason.as_deref(), expires_at)
                .await?;
            Ok(format!("blacklisted {}", describe(&record)))
        }
        BlacklistAction::Remove { value, host } => {
            let kind = blacklist_kind(host);
            if !db.blacklist.delete(kind, &value).await? {
                return Err(AdminError::NotFound(format!("{kind} {value}")));
            }
            Ok(format!("{kind} {value} removed"))
        }
        BlacklistAction::List => {
            let records = db.blacklist.list_active().await?;
            Ok(records.iter().map(describe).collect::<Vec<_>>().join("\n"))
        }
    }
}

pub async fn rule(db: &Database, action: RuleAction) -> Result<String, AdminError> {
    match action {
        RuleAction::List => Ok(db.rules.list().await?.join("\n")),
        RuleAction::Show { name } => match db.rules.get(&name).await? {
            Some(rule) => Ok(serde_json::to_string_pretty(&rule)?),
            None => Err(AdminError::NotFound(format!("rule {name}"))),
        },
        RuleAction::Set { file } => {
            let rule = read_rule(&file).await?;
            db.rules.upsert(&rule).await?;
            Ok(format!("rule {} saved", rule.name))
        }
        RuleAction::Remove { name } => {
            if !db.rules.delete(&name).await? {
                return Err(AdminError::NotFound(format!("rule {name}")));
            }
            Ok(format!("rule {name} removed"))
        }
    }
}

/// Apply the given settings, then report all of them
pub async fn config(
    db: &Database,
    max_connections: Option<u32>,
    max_connections_per_ip: Option<u32>,
    blacklist_duration: Option<u64>,
) -> Result<String, AdminError> {
    if let Some(value) = max_connections {
        db.config.set_max_connections(value).await?;
    }
    if let Some(value) = max_connections_per_ip {
        db.config.set_max_connections_per_ip(value).await?;
    }
    if let Some(value) = blacklist_duration {
        db.config.set_blacklist_duration_secs(value).await?;
    }

    let mut out = String::new();
    let _ = writeln!(out, "max_connections = {}", db.config.get_max_connections().await);
    let _ = writeln!(
        out,
        "max_connections_per_ip = {}",
        db.config.get_max_connections_per_ip().await
    );
    let _ = write!(
        out,
        "blacklist_duration = {}",
        db.config.get_blacklist_duration_secs().await
    );
    Ok(out)
}

fn blacklist_kind(host: bool) -> BlacklistKind {
    if host {
        BlacklistKind::Host
    } else {
        BlacklistKind::Address
    }
}

fn describe(record: &BlacklistRecord) -> String {
    let mut line = format!("{} {}", record.kind, record.value);
    match record.expires_at.and_then(|ts| DateTime::from_timestamp(ts, 0)) {
        Some(until) => {
            let _ = write!(line, " until {}", until.to_rfc3339());
        }
        None => line.push_str(" permanent"),
    }
    if let Some(reason) = &record.reason {
        let _ = write!(line, " ({reason})");
    }
    line
}

/// Load a rule file and check that every task builds
async fn read_rule(path: &Path) -> Result<Rule, AdminError> {
    let text = tokio::fs::read_to_string(path).await?;
    let rule: Rule = serde_json::from_str(&text)?;

    for spec in rule
        .pre_tasks
        .iter()
        .chain(&rule.post_tasks)
        .chain(&rule.error_tasks)
    {
        build_task(spec).map_err(|source| AdminError::Task {
            rule: rule.name.clone(),
            source,
        })?;
    }
    Ok(rule)
}
