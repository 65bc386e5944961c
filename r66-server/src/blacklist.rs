//! In-memory blacklist consulted at admission time
//!
//! Address entries (single IPs or CIDR ranges) are held in radix tries via
//! `iprange` for O(log n) containment checks. Host-id entries are matched
//! exactly against the identity a peer announces in its first request.
//!
//! IPv4-mapped IPv6 addresses (e.g., `::ffff:192.168.1.100`) are normalized
//! to IPv4 before matching, so an entry for `192.168.1.100` also applies when
//! the listener is bound to `::`.
//!
//! Timed entries expire lazily: `next_expiry` records the earliest expiry and
//! the tries are rebuilt the first time a check happens after it.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::Utc;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use iprange::IpRange;

use crate::db::blacklist::{BlacklistKind, BlacklistRecord};

#[derive(Debug, Clone)]
struct AddressEntry {
    /// The IP or CIDR range as stored
    value: String,
    net: IpNet,
    /// Unix timestamp when the entry expires (None = permanent)
    expires_at: Option<i64>,
}

/// Blacklisted addresses and host identifiers
#[derive(Debug)]
pub struct Blacklist {
    ipv4: IpRange<Ipv4Net>,
    ipv6: IpRange<Ipv6Net>,
    addresses: Vec<AddressEntry>,
    /// Host id -> expiry (None = permanent)
    hosts: HashMap<String, Option<i64>>,
    /// Earliest expiry across all entries (None if all are permanent)
    next_expiry: Option<i64>,
}

impl Blacklist {
    /// Create an empty blacklist
    pub fn new() -> Self {
        Self {
            ipv4: IpRange::new(),
            ipv6: IpRange::new(),
            addresses: Vec::new(),
            hosts: HashMap::new(),
            next_expiry: None,
        }
    }

    /// Build from database records; unparseable addresses are skipped
    pub fn from_records(records: Vec<BlacklistRecord>) -> Self {
        let mut blacklist = Self::new();

        for record in records {
            match record.kind {
                BlacklistKind::Address => {
                    if let Some(net) = parse_ip_or_cidr(&record.value) {
                        blacklist.addresses.push(AddressEntry {
                            value: record.value,
                            net,
                            expires_at: record.expires_at,
                        });
                    }
                }
                BlacklistKind::Host => {
                    blacklist.hosts.insert(record.value, record.expires_at);
                }
            }
        }

        blacklist.rebuild();
        blacklist
    }

    /// Check an address, rebuilding first if an entry has expired
    pub fn is_address_blacklisted(&mut self, ip: IpAddr) -> bool {
        if self.needs_rebuild() {
            self.rebuild();
        }
        self.is_address_blacklisted_read_only(ip)
    }

    /// Check an address without rebuilding
    ///
    /// Callers holding only a read lock use this after confirming
    /// [`needs_rebuild`](Self::needs_rebuild) is false.
    pub fn is_address_blacklisted_read_only(&self, ip: IpAddr) -> bool {
        match normalize_ip(ip) {
            IpAddr::V4(v4) => self.ipv4.contains(&v4),
            IpAddr::V6(v6) => self.ipv6.contains(&v6),
        }
    }

    /// Check a host identifier
    pub fn is_host_blacklisted(&self, host_id: &str) -> bool {
        match self.hosts.get(host_id) {
            Some(None) => true,
            Some(Some(expires_at)) => *expires_at > current_timestamp(),
            None => false,
        }
    }

    /// Whether an entry has expired since the last rebuild
    pub fn needs_rebuild(&self) -> bool {
        self.next_expiry
            .is_some_and(|expiry| current_timestamp() >= expiry)
    }

    /// Add or replace an address entry
    ///
    /// Returns false if `ip_or_cidr` does not parse.
    pub fn add_address(&mut self, ip_or_cidr: &str, expires_at: Option<i64>) -> bool {
        let Some(net) = parse_ip_or_cidr(ip_or_cidr) else {
            return false;
        };

        self.addresses.retain(|e| e.value != ip_or_cidr);
        self.addresses.push(AddressEntry {
            value: ip_or_cidr.to_string(),
            net,
            expires_at,
        });

        self.rebuild();
        true
    }

    /// Add or replace a host entry
    #[cfg(test)]
    pub(crate) fn add_host(&mut self, host_id: &str, expires_at: Option<i64>) {
        self.hosts.insert(host_id.to_string(), expires_at);
        self.rebuild();
    }

    /// Number of live entries (addresses plus hosts)
    pub fn len(&self) -> usize {
        self.addresses.len() + self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries and rebuild the tries
    fn rebuild(&mut self) {
        let now = current_timestamp();
        let live = |expires_at: &Option<i64>| expires_at.is_none_or(|t| t > now);

        self.addresses.retain(|e| live(&e.expires_at));
        self.hosts.retain(|_, expires_at| live(expires_at));

        self.ipv4 = IpRange::new();
        self.ipv6 = IpRange::new();
        for entry in &self.addresses {
            match entry.net {
                IpNet::V4(net) => {
                    self.ipv4.add(net);
                }
                IpNet::V6(net) => {
                    self.ipv6.add(net);
                }
            }
        }
        self.ipv4.simplify();
        self.ipv6.simplify();

        self.next_expiry = self
            .addresses
            .iter()
            .filter_map(|e| e.expires_at)
            .chain(self.hosts.values().filter_map(|e| *e))
            .min();
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an IP address or CIDR notation into an IpNet
///
/// Single IPs become /32 (IPv4) or /128 (IPv6).
pub fn parse_ip_or_cidr(s: &str) -> Option<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Some(net);
    }

    match s.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => Some(IpNet::V4(Ipv4Net::new(v4, 32).ok()?)),
        IpAddr::V6(v6) => Some(IpNet::V6(Ipv6Net::new(v6, 128).ok()?)),
    }
}

/// Convert IPv4-mapped IPv6 addresses to IPv4
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match to_ipv4_mapped(&v6) {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

/// Extract the IPv4 address from `::ffff:0:0/96`
fn to_ipv4_mapped(v6: &Ipv6Addr) -> Option<Ipv4Addr> {
    let octets = v6.octets();
    if octets[0..10] == [0; 10] && octets[10] == 0xff && octets[11] == 0xff {
        Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
    } else {
        None
    }
}

/// Current Unix timestamp in seconds
pub(crate) fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}
