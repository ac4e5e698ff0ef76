//! Self-expiring block list keyed by client IP.
//!
//! Entries age out after a fixed retention window. Expiry is lazy: callers
//! run [`BlockList::evict_expired`] before querying membership, so no
//! background timer is needed. An entry expires once its age is strictly
//! greater than the retention window; at exactly the window it is still
//! blocked.

use crate::audit::{AuditEvent, AuditKind, AuditSink};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Default retention window (12 hours).
pub const DEFAULT_RETENTION_SECONDS: u64 = 12 * 60 * 60;

/// How an IP ended up in the block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    /// Promoted by the threat detector.
    Automatic,
    /// Added by an operator.
    Manual,
}

/// A blocked IP and when it was (last) blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub ip: String,
    pub blocked_at: DateTime<Utc>,
    pub source: BlockSource,
}

impl BlockEntry {
    /// Age of this entry at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.blocked_at
    }

    /// Check if this entry has outlived `retention` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.age(now) > retention
    }
}

/// Mutable store of currently blocked IPs.
pub struct BlockList {
    entries: HashMap<String, BlockEntry>,
    retention: Duration,
    audit: Arc<dyn AuditSink>,
}

impl BlockList {
    /// Create an empty block list with the given retention window.
    pub fn new(retention: Duration, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            entries: HashMap::new(),
            retention,
            audit,
        }
    }

    /// Create an empty block list with the 12 hour retention window.
    pub fn with_default_retention(audit: Arc<dyn AuditSink>) -> Self {
        Self::new(Duration::seconds(DEFAULT_RETENTION_SECONDS as i64), audit)
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Insert `ip`, or refresh its timestamp if already present.
    ///
    /// Returns true if the IP was not blocked before.
    pub fn add(&mut self, ip: &str, now: DateTime<Utc>, source: BlockSource) -> bool {
        let entry = BlockEntry {
            ip: ip.to_string(),
            blocked_at: now,
            source,
        };
        let is_new = self.entries.insert(ip.to_string(), entry).is_none();

        debug!(ip = %ip, source = ?source, refreshed = !is_new, "IP added to block list");
        let message = match source {
            BlockSource::Automatic => format!("IP {} added to block list.", ip),
            BlockSource::Manual => format!("IP {} manually added to block list.", ip),
        };
        self.audit
            .emit(AuditEvent::new(now, AuditKind::BlockAdded, message));

        is_new
    }

    /// Remove `ip` if present.
    ///
    /// Removing an absent IP leaves the list unchanged but is still audited.
    pub fn remove(&mut self, ip: &str, now: DateTime<Utc>) -> bool {
        if self.entries.remove(ip).is_some() {
            info!(ip = %ip, "IP removed from block list");
            self.audit.emit(AuditEvent::new(
                now,
                AuditKind::BlockRemoved,
                format!("IP {} manually removed from block list.", ip),
            ));
            true
        } else {
            debug!(ip = %ip, "Removal requested for IP not in block list");
            self.audit.emit(AuditEvent::new(
                now,
                AuditKind::RemovalOfAbsent,
                format!("Attempted removal of IP {} which is not in the block list.", ip),
            ));
            false
        }
    }

    /// True iff `ip` is present as of the last eviction pass.
    pub fn contains(&self, ip: &str) -> bool {
        self.entries.contains_key(ip)
    }

    /// Remove every entry older than the retention window.
    ///
    /// Returns the evicted IPs, sorted.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let retention = self.retention;
        let mut expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now, retention))
            .map(|e| e.ip.clone())
            .collect();
        expired.sort();

        for ip in &expired {
            self.entries.remove(ip);
            debug!(ip = %ip, "Block list entry expired");
            self.audit.emit(AuditEvent::new(
                now,
                AuditKind::BlockExpired,
                format!(
                    "IP {} removed from block list after {}.",
                    ip,
                    describe(retention)
                ),
            ));
        }

        expired
    }

    pub fn get(&self, ip: &str) -> Option<&BlockEntry> {
        self.entries.get(ip)
    }

    /// Blocked IPs, sorted.
    pub fn ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self.entries.keys().cloned().collect();
        ips.sort();
        ips
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn describe(retention: Duration) -> String {
    let secs = retention.num_seconds();
    if secs % 3600 == 0 {
        format!("{} hours", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{} seconds", secs)
    }
}

impl fmt::Debug for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockList")
            .field("entries", &self.entries)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap()
    }

    fn list() -> (BlockList, MemoryAuditSink) {
        let sink = MemoryAuditSink::new();
        let list = BlockList::with_default_retention(Arc::new(sink.clone()));
        (list, sink)
    }

    #[test]
    fn test_add_and_contains() {
        let (mut list, sink) = list();
        assert!(list.add("9.9.9.9", t0(), BlockSource::Automatic));
        assert!(list.contains("9.9.9.9"));
        assert!(!list.contains("8.8.8.8"));
        assert_eq!(sink.of_kind(AuditKind::BlockAdded).len(), 1);
    }

    #[test]
    fn test_readd_refreshes_timestamp() {
        let (mut list, sink) = list();
        let t2 = t0() + Duration::hours(6);

        assert!(list.add("9.9.9.9", t0(), BlockSource::Automatic));
        assert!(!list.add("9.9.9.9", t2, BlockSource::Automatic));
        assert_eq!(list.len(), 1);
        assert_eq!(list.get("9.9.9.9").unwrap().blocked_at, t2);
        assert_eq!(sink.of_kind(AuditKind::BlockAdded).len(), 2);

        // Expiry is measured from the refresh, not the first insert.
        list.evict_expired(t0() + Duration::hours(13));
        assert!(list.contains("9.9.9.9"));
        list.evict_expired(t2 + Duration::hours(12) + Duration::seconds(1));
        assert!(!list.contains("9.9.9.9"));
    }

    #[test]
    fn test_retention_boundary() {
        let (mut list, _) = list();
        list.add("9.9.9.9", t0(), BlockSource::Automatic);

        assert!(list.evict_expired(t0() + Duration::hours(11)).is_empty());
        assert!(list.contains("9.9.9.9"));

        // Exactly at the window: still blocked.
        assert!(list.evict_expired(t0() + Duration::hours(12)).is_empty());
        assert!(list.contains("9.9.9.9"));

        let evicted = list.evict_expired(t0() + Duration::hours(12) + Duration::milliseconds(1));
        assert_eq!(evicted, vec!["9.9.9.9".to_string()]);
        assert!(!list.contains("9.9.9.9"));
    }

    #[test]
    fn test_eviction_emits_one_event_per_entry() {
        let (mut list, sink) = list();
        list.add("1.1.1.1", t0(), BlockSource::Automatic);
        list.add("2.2.2.2", t0(), BlockSource::Manual);
        list.add("3.3.3.3", t0() + Duration::hours(10), BlockSource::Automatic);

        let evicted = list.evict_expired(t0() + Duration::hours(13));
        assert_eq!(evicted, vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()]);
        assert_eq!(list.ips(), vec!["3.3.3.3".to_string()]);

        let expired = sink.of_kind(AuditKind::BlockExpired);
        assert_eq!(expired.len(), 2);
        assert!(expired[0].message.contains("1.1.1.1"));
        assert!(expired[0].message.contains("after 12 hours"));
    }

    #[test]
    fn test_remove_present() {
        let (mut list, sink) = list();
        list.add("9.9.9.9", t0(), BlockSource::Automatic);

        assert!(list.remove("9.9.9.9", t0()));
        assert!(!list.contains("9.9.9.9"));
        assert_eq!(sink.of_kind(AuditKind::BlockRemoved).len(), 1);
    }

    #[test]
    fn test_remove_absent_is_audited_noop() {
        let (mut list, sink) = list();
        list.add("1.1.1.1", t0(), BlockSource::Automatic);

        assert!(!list.remove("9.9.9.9", t0()));
        assert_eq!(list.ips(), vec!["1.1.1.1".to_string()]);
        assert!(sink.of_kind(AuditKind::BlockRemoved).is_empty());

        let absent = sink.of_kind(AuditKind::RemovalOfAbsent);
        assert_eq!(absent.len(), 1);
        assert!(absent[0].message.contains("9.9.9.9"));
    }

    #[test]
    fn test_manual_source_recorded() {
        let (mut list, sink) = list();
        list.add("4.4.4.4", t0(), BlockSource::Manual);
        assert_eq!(list.get("4.4.4.4").unwrap().source, BlockSource::Manual);
        assert!(sink.events()[0].message.contains("manually"));
    }

    #[test]
    fn test_custom_retention() {
        let sink = MemoryAuditSink::new();
        let mut list = BlockList::new(Duration::minutes(5), Arc::new(sink));
        list.add("5.5.5.5", t0(), BlockSource::Automatic);

        list.evict_expired(t0() + Duration::minutes(5));
        assert!(list.contains("5.5.5.5"));
        list.evict_expired(t0() + Duration::minutes(6));
        assert!(list.is_empty());
    }

    #[test]
    fn test_block_entry_is_expired() {
        let entry = BlockEntry {
            ip: "1.2.3.4".to_string(),
            blocked_at: t0(),
            source: BlockSource::Automatic,
        };
        let retention = Duration::hours(12);

        assert!(!entry.is_expired(t0() + Duration::hours(1), retention));
        assert!(entry.is_expired(t0() + Duration::hours(13), retention));
        assert_eq!(entry.age(t0() + Duration::hours(2)), Duration::hours(2));
    }
}
