//! Firewall core: owns the block list and wires classifier, detector,
//! clock and audit sink together.

use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::blocklist::{BlockList, BlockSource};
use crate::classifier::{Classifier, IpStatus};
use crate::clock::Clock;
use crate::config::{Config, Settings};
use crate::detector::{Detection, ThreatDetector};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

/// Traffic classification engine.
///
/// IPs are trimmed on the way in, so every entry point agrees on the key
/// a block-list entry is stored under.
///
/// The block list sits behind a single mutex. Each public operation takes
/// the lock once, so eviction and lookup inside [`classify`](Self::classify)
/// share one linearization point and an operator may call
/// [`remove_from_block_list`](Self::remove_from_block_list) from another
/// thread while a pipeline is running.
pub struct Firewall {
    settings: Settings,
    classifier: Classifier,
    detector: ThreatDetector,
    blocklist: Mutex<BlockList>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl Firewall {
    /// Build a firewall from validated configuration.
    pub fn new(
        config: &Config,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let allowlist = config.parse_allowlist()?;
        let rules = config.compile_rules()?;

        info!(
            allowlist_entries = allowlist.len(),
            zones = rules.zone_count(),
            rules = rules.rule_count(),
            retention_seconds = config.settings.retention_seconds,
            "Zone firewall initialized"
        );

        Ok(Self {
            settings: config.settings.clone(),
            classifier: Classifier::new(allowlist),
            detector: ThreatDetector::new(rules),
            blocklist: Mutex::new(BlockList::new(config.settings.retention(), audit.clone())),
            clock,
            audit,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn blocklist(&self) -> MutexGuard<'_, BlockList> {
        // A panic mid-operation leaves the map itself consistent.
        self.blocklist.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Classify `ip` as allowed, blocked or unknown.
    pub fn classify(&self, ip: &str) -> IpStatus {
        let mut blocklist = self.blocklist();
        self.classifier
            .classify(ip.trim(), &mut blocklist, self.clock.now())
    }

    /// Inspect a request path; blocks `ip` if it is malicious for `zone`.
    pub fn inspect(&self, zone: &str, path: &str, ip: &str) -> bool {
        self.detect(zone, path, ip).is_some()
    }

    /// Like [`inspect`](Self::inspect) but reports the matching rule.
    pub fn detect(&self, zone: &str, path: &str, ip: &str) -> Option<Detection> {
        let mut blocklist = self.blocklist();
        self.detector
            .detect(zone.trim(), path, ip.trim(), &mut blocklist, self.clock.now())
    }

    /// Operator action: block `ip` now.
    pub fn block(&self, ip: &str) {
        let ip = ip.trim();
        self.blocklist()
            .add(ip, self.clock.now(), BlockSource::Manual);
    }

    /// Operator action: unblock `ip`.
    ///
    /// Returns false, and records an audit event, if `ip` was not blocked.
    pub fn remove_from_block_list(&self, ip: &str) -> bool {
        let ip = ip.trim();
        self.blocklist().remove(ip, self.clock.now())
    }

    /// True if `ip` is in the block list after an eviction pass.
    pub fn is_blocked(&self, ip: &str) -> bool {
        let mut blocklist = self.blocklist();
        blocklist.evict_expired(self.clock.now());
        blocklist.contains(ip.trim())
    }

    /// Currently blocked IPs, sorted, after an eviction pass.
    pub fn blocked_ips(&self) -> Vec<String> {
        let mut blocklist = self.blocklist();
        blocklist.evict_expired(self.clock.now());
        blocklist.ips()
    }

    /// Emit an audit event stamped with the current time.
    pub fn audit(&self, kind: AuditKind, message: impl Into<String>) {
        self.audit
            .emit(AuditEvent::new(self.clock.now(), kind, message));
    }
}
