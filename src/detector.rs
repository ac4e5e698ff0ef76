//! Request path inspection and automatic blocking.

use crate::blocklist::{BlockList, BlockSource};
use crate::rules::RuleSet;
use chrono::{DateTime, Utc};
use tracing::info;

/// A positive detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub ip: String,
    pub zone: String,
    pub pattern: String,
}

/// Evaluates request paths against zone rules.
///
/// Every call is self-contained: the IP to block is always the one passed
/// in, never derived from surrounding state.
#[derive(Debug, Clone, Default)]
pub struct ThreatDetector {
    rules: RuleSet,
}

impl ThreatDetector {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    /// Inspect `path` for `zone`, blocking `ip` on a match.
    ///
    /// Returns true if the path is malicious.
    pub fn inspect(
        &self,
        zone: &str,
        path: &str,
        ip: &str,
        blocklist: &mut BlockList,
        now: DateTime<Utc>,
    ) -> bool {
        self.detect(zone, path, ip, blocklist, now).is_some()
    }

    /// Like [`inspect`](Self::inspect) but returns which rule fired.
    pub fn detect(
        &self,
        zone: &str,
        path: &str,
        ip: &str,
        blocklist: &mut BlockList,
        now: DateTime<Utc>,
    ) -> Option<Detection> {
        let rule = self.rules.first_match(zone, path)?;

        info!(
            ip = %ip,
            zone = %zone,
            pattern = %rule.pattern(),
            "Malicious request path detected"
        );
        blocklist.add(ip, now, BlockSource::Automatic);

        Some(Detection {
            ip: ip.to_string(),
            zone: zone.to_string(),
            pattern: rule.pattern().to_string(),
        })
    }
}
