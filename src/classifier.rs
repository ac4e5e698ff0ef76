//! IP trust classification with allow-list precedence.

use crate::blocklist::BlockList;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;
use tracing::trace;

/// Trust status of a client IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IpStatus {
    /// Listed in the allow-list.
    Allowed,
    /// Currently in the block list.
    Blocked,
    /// No information either way; permitted but unverified.
    Unknown,
}

impl IpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpStatus::Allowed => "allowed",
            IpStatus::Blocked => "blocked",
            IpStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for IpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allow-list entry that could not be parsed as an IP or CIDR network.
#[derive(Debug, Error)]
#[error("invalid allowlist entry: {0}")]
pub struct InvalidAllowListEntry(pub String);

/// Parsed allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowListEntry {
    Single(IpAddr),
    Network(IpNet),
}

impl AllowListEntry {
    /// Parse a single IP or a CIDR network.
    pub fn parse(s: &str) -> Result<Self, InvalidAllowListEntry> {
        let s = s.trim();
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(AllowListEntry::Single(ip));
        }
        if let Ok(net) = s.parse::<IpNet>() {
            return Ok(AllowListEntry::Network(net));
        }
        Err(InvalidAllowListEntry(s.to_string()))
    }

    /// Check if an IP address matches this entry.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            AllowListEntry::Single(allowed) => allowed == ip,
            AllowListEntry::Network(net) => net.contains(ip),
        }
    }
}

/// Immutable set of trusted sources, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    entries: Vec<AllowListEntry>,
}

impl AllowList {
    pub fn new(entries: Vec<AllowListEntry>) -> Self {
        Self { entries }
    }

    /// Parse every entry, failing on the first invalid one.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, InvalidAllowListEntry> {
        let entries = entries
            .iter()
            .map(|s| AllowListEntry::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    /// True if `ip` parses as an address covered by any entry.
    ///
    /// Identifiers that are not IP addresses are never allow-listed.
    pub fn contains(&self, ip: &str) -> bool {
        match ip.trim().parse::<IpAddr>() {
            Ok(addr) => self.entries.iter().any(|e| e.contains(&addr)),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decides allowed / blocked / unknown for a client IP.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    allowlist: AllowList,
}

impl Classifier {
    pub fn new(allowlist: AllowList) -> Self {
        Self { allowlist }
    }

    pub fn allowlist(&self) -> &AllowList {
        &self.allowlist
    }

    /// Classify `ip` at `now`.
    ///
    /// Expired block entries are evicted first. The allow-list wins over
    /// the block list.
    pub fn classify(&self, ip: &str, blocklist: &mut BlockList, now: DateTime<Utc>) -> IpStatus {
        blocklist.evict_expired(now);

        let status = if self.allowlist.contains(ip) {
            IpStatus::Allowed
        } else if blocklist.contains(ip) {
            IpStatus::Blocked
        } else {
            IpStatus::Unknown
        };

        trace!(ip = %ip, status = %status, "Classified IP");
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::blocklist::BlockSource;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap()
    }

    fn classifier() -> Classifier {
        Classifier::new(AllowList::parse(&["42.143.155.128", "50.97.88.31", "10.0.0.0/8"]).unwrap())
    }

    fn blocklist() -> BlockList {
        BlockList::with_default_retention(Arc::new(MemoryAuditSink::new()))
    }

    #[test]
    fn test_allowlist_entry_single() {
        let entry = AllowListEntry::parse("192.168.1.1").unwrap();
        assert!(entry.contains(&"192.168.1.1".parse().unwrap()));
        assert!(!entry.contains(&"192.168.1.2".parse().unwrap()));
    }

    #[test]
    fn test_allowlist_entry_network() {
        let entry = AllowListEntry::parse("10.0.0.0/8").unwrap();
        assert!(entry.contains(&"10.0.0.1".parse().unwrap()));
        assert!(entry.contains(&"10.255.255.255".parse().unwrap()));
        assert!(!entry.contains(&"11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_allowlist_entry_invalid() {
        assert!(AllowListEntry::parse("not-an-ip").is_err());
        assert!(AllowList::parse(&["1.2.3.4", "nope"]).is_err());
    }

    #[test]
    fn test_allowlist_non_ip_identifier() {
        let allow = AllowList::parse(&["1.2.3.4"]).unwrap();
        assert!(!allow.contains("host-1"));
        assert!(allow.contains(" 1.2.3.4 "));
    }

    #[test]
    fn test_unknown_ip() {
        let mut list = blocklist();
        assert_eq!(classifier().classify("8.8.8.8", &mut list, t0()), IpStatus::Unknown);
    }

    #[test]
    fn test_allowed_ip() {
        let mut list = blocklist();
        let c = classifier();
        assert_eq!(c.classify("42.143.155.128", &mut list, t0()), IpStatus::Allowed);
        assert_eq!(c.classify("10.1.2.3", &mut list, t0()), IpStatus::Allowed);
    }

    #[test]
    fn test_blocked_ip() {
        let mut list = blocklist();
        list.add("9.9.9.9", t0(), BlockSource::Automatic);
        assert_eq!(classifier().classify("9.9.9.9", &mut list, t0()), IpStatus::Blocked);
    }

    #[test]
    fn test_allowlist_takes_precedence() {
        let mut list = blocklist();
        list.add("42.143.155.128", t0(), BlockSource::Manual);
        assert_eq!(
            classifier().classify("42.143.155.128", &mut list, t0()),
            IpStatus::Allowed
        );
    }

    #[test]
    fn test_classify_evicts_before_lookup() {
        let mut list = blocklist();
        list.add("9.9.9.9", t0(), BlockSource::Automatic);
        list.add("42.143.155.128", t0(), BlockSource::Manual);

        let later = t0() + Duration::hours(12) + Duration::seconds(1);
        assert_eq!(classifier().classify("9.9.9.9", &mut list, later), IpStatus::Unknown);
        // The pass sweeps every expired entry, not just the queried one.
        assert!(list.is_empty());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(IpStatus::Allowed.to_string(), "allowed");
        assert_eq!(IpStatus::Blocked.to_string(), "blocked");
        assert_eq!(IpStatus::Unknown.to_string(), "unknown");
    }
}
