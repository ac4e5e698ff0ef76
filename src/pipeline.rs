//! Record ingestion pipeline.
//!
//! [`Pipeline`] wraps a record iterator and yields exactly one
//! [`DecisionEvent`] per record, in input order. Records with missing
//! fields are never fatal: they produce a diagnostic and the pipeline
//! moves on. When the source ends a run summary is written to the audit
//! stream once; a source that stopped on a read error is reported as an
//! aborted run instead of a successful one.

use crate::audit::AuditKind;
use crate::classifier::IpStatus;
use crate::firewall::Firewall;
use crate::source::{RecordSource, SourceError, TrafficRecord};
use serde::Serialize;
use std::iter::FusedIterator;
use tracing::{debug, info, warn};

/// Why a record could not be fully evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnostic {
    /// No client IP; neither classified nor inspected.
    MalformedRecord,
    /// Zone or path missing; classified but not inspected.
    InsufficientData,
}

/// Per-record output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionEvent {
    pub ip: Option<String>,
    pub zone: Option<String>,
    pub path: Option<String>,
    /// Absent for malformed records.
    pub ip_status: Option<IpStatus>,
    pub threat_detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

/// Counters for one pass over a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub records: usize,
    pub malformed: usize,
    pub insufficient: usize,
    pub threats: usize,
    pub allowed: usize,
    pub blocked: usize,
    pub unknown: usize,
}

impl RunSummary {
    fn count(&mut self, event: &DecisionEvent) {
        self.records += 1;
        match event.diagnostic {
            Some(Diagnostic::MalformedRecord) => self.malformed += 1,
            Some(Diagnostic::InsufficientData) => self.insufficient += 1,
            None => {}
        }
        match event.ip_status {
            Some(IpStatus::Allowed) => self.allowed += 1,
            Some(IpStatus::Blocked) => self.blocked += 1,
            Some(IpStatus::Unknown) => self.unknown += 1,
            None => {}
        }
        if event.threat_detected {
            self.threats += 1;
        }
    }
}

/// Lazy, single-pass decision stream over a record source.
pub struct Pipeline<'a, I> {
    firewall: &'a Firewall,
    records: I,
    summary: RunSummary,
    finished: bool,
}

impl<'a, I> Pipeline<'a, I>
where
    I: RecordSource,
{
    pub fn new(firewall: &'a Firewall, records: I) -> Self {
        Self {
            firewall,
            records,
            summary: RunSummary::default(),
            finished: false,
        }
    }

    /// Counters for the records consumed so far.
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// True once the source has ended.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The read error that cut the run short, if any.
    pub fn failure(&self) -> Option<&SourceError> {
        self.records.failure()
    }

    fn process(&self, record: TrafficRecord) -> DecisionEvent {
        let fw = self.firewall;

        let Some(ip) = record.ip.clone() else {
            warn!(zone = ?record.zone, path = ?record.path, "Record without client IP");
            fw.audit(
                AuditKind::MalformedRecord,
                format!("Malformed record, missing client IP: {}", to_json(&record)),
            );
            return DecisionEvent {
                ip: None,
                zone: record.zone,
                path: record.path,
                ip_status: None,
                threat_detected: false,
                diagnostic: Some(Diagnostic::MalformedRecord),
            };
        };

        let ip_status = fw.classify(&ip);
        fw.audit(
            AuditKind::Status,
            format!("IP: {} - Status: {}", ip, ip_status),
        );

        let (threat_detected, diagnostic) = match (record.zone.as_deref(), record.path.as_deref()) {
            (Some(zone), Some(path)) => {
                let detected = fw.inspect(zone, path, &ip);
                if detected {
                    fw.audit(
                        AuditKind::Verdict,
                        format!("Blocked: {} - malicious pattern detected", path),
                    );
                } else {
                    fw.audit(AuditKind::Verdict, format!("Allowed: {}", path));
                }
                (detected, None)
            }
            _ => {
                debug!(ip = %ip, "Record lacks zone or path, skipping inspection");
                fw.audit(
                    AuditKind::InsufficientData,
                    format!("Insufficient data in record: {}", to_json(&record)),
                );
                (false, Some(Diagnostic::InsufficientData))
            }
        };

        let settings = fw.settings();
        if threat_detected || ip_status == IpStatus::Blocked {
            if settings.log_blocked {
                info!(
                    ip = %ip,
                    zone = ?record.zone,
                    path = ?record.path,
                    status = %ip_status,
                    threat = threat_detected,
                    "Blocked traffic"
                );
            }
        } else if settings.log_allowed {
            debug!(ip = %ip, status = %ip_status, "Permitted traffic");
        }

        DecisionEvent {
            ip: Some(ip),
            zone: record.zone,
            path: record.path,
            ip_status: Some(ip_status),
            threat_detected,
            diagnostic,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        let blocked = self.firewall.blocked_ips();

        match self.records.failure() {
            Some(error) => {
                warn!(
                    records = self.summary.records,
                    error = %error,
                    "Input processing aborted"
                );
                self.firewall.audit(
                    AuditKind::RunAborted,
                    format!(
                        "Input processing aborted after {} records: {}",
                        self.summary.records, error
                    ),
                );
            }
            None => {
                info!(
                    records = self.summary.records,
                    malformed = self.summary.malformed,
                    insufficient = self.summary.insufficient,
                    threats = self.summary.threats,
                    blocked_ips = blocked.len(),
                    "Input processed"
                );
                self.firewall.audit(
                    AuditKind::RunCompleted,
                    format!("Input processed successfully ({} records).", self.summary.records),
                );
            }
        }
        self.firewall.audit(
            AuditKind::BlockListSnapshot,
            format!("Block list updated: {}", blocked.join(", ")),
        );
    }
}

impl<'a, I> Iterator for Pipeline<'a, I>
where
    I: RecordSource,
{
    type Item = DecisionEvent;

    fn next(&mut self) -> Option<DecisionEvent> {
        if self.finished {
            return None;
        }

        match self.records.next() {
            Some(record) => {
                let event = self.process(record);
                self.summary.count(&event);
                Some(event)
            }
            None => {
                self.finish();
                None
            }
        }
    }
}

impl<'a, I> FusedIterator for Pipeline<'a, I> where I: RecordSource {}

fn to_json(record: &TrafficRecord) -> String {
    serde_json::to_string(record).unwrap_or_else(|_| format!("{:?}", record))
}
