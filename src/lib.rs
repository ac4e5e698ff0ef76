//! Zone Firewall Agent for Zentinel.
//!
//! Classifies HTTP traffic records against an IP allow-list and a
//! self-expiring block list, and inspects request paths with per-zone
//! patterns. Sources caught sending malicious paths are blocked for a
//! fixed retention window.
//!
//! # Features
//!
//! - **Allow-list Precedence** - Allow-listed IPs and networks are always allowed
//! - **Self-expiring Block List** - Entries age out after 12 hours by default
//! - **Per-zone Rules** - Case-insensitive patterns keyed by zone name
//! - **Audit Trail** - Every block-list change and verdict is appended to an audit log
//! - **Fail-Open Input** - Records with missing fields produce diagnostics, never abort a run
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   retention_seconds: 43200
//!
//! allowlist:
//!   - "42.143.155.128"
//!   - "10.0.0.0/8"
//!
//! zones:
//!   infinitepay.io:
//!     - "' OR 1=1--"
//!     - "union.*select.*from"
//! ```

pub mod audit;
pub mod blocklist;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod detector;
pub mod firewall;
pub mod pipeline;
pub mod rules;
pub mod source;

pub use classifier::IpStatus;
pub use config::Config;
pub use firewall::Firewall;
pub use pipeline::{DecisionEvent, Pipeline};
pub use source::TrafficRecord;
