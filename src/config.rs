//! Configuration types for the zone firewall.

use crate::classifier::AllowList;
use crate::rules::RuleSet;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// IPs and CIDR networks that are always allowed.
    #[serde(default = "default_allowlist")]
    pub allowlist: Vec<String>,

    /// Malicious path patterns per zone, evaluated in order.
    #[serde(default = "default_zones")]
    pub zones: BTreeMap<String, Vec<String>>,

    /// Input column mapping.
    #[serde(default)]
    pub input: InputConfig,

    /// Audit log settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            allowlist: default_allowlist(),
            zones: default_zones(),
            input: InputConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// How long an IP stays blocked (seconds).
    #[serde(default = "default_retention")]
    pub retention_seconds: u64,

    /// Log blocked records.
    #[serde(default = "default_true")]
    pub log_blocked: bool,

    /// Log allowed and unknown records.
    #[serde(default)]
    pub log_allowed: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retention_seconds: default_retention(),
            log_blocked: true,
            log_allowed: false,
        }
    }
}

impl Settings {
    pub fn retention(&self) -> Duration {
        Duration::seconds(self.retention_seconds as i64)
    }
}

/// Names of the input columns the pipeline reads.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputConfig {
    #[serde(default = "default_ip_column")]
    pub ip_column: String,

    #[serde(default = "default_zone_column")]
    pub zone_column: String,

    #[serde(default = "default_path_column")]
    pub path_column: String,

    /// Field delimiter.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            ip_column: default_ip_column(),
            zone_column: default_zone_column(),
            path_column: default_path_column(),
            delimiter: default_delimiter(),
        }
    }
}

/// Audit log configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    /// File the audit events are appended to.
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
        }
    }
}

fn default_retention() -> u64 {
    crate::blocklist::DEFAULT_RETENTION_SECONDS
}

fn default_allowlist() -> Vec<String> {
    [
        "42.143.155.128",
        "50.97.88.31",
        "167.156.227.203",
        "151.104.73.27",
        "144.79.40.8",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_zones() -> BTreeMap<String, Vec<String>> {
    let mut zones = BTreeMap::new();
    zones.insert(
        "infinitepay.io".to_string(),
        vec!["' OR 1=1--".to_string(), "union.*select.*from".to_string()],
    );
    zones.insert("otherzone.io".to_string(), Vec::new());
    zones
}

fn default_ip_column() -> String {
    "ClientIP".to_string()
}

fn default_zone_column() -> String {
    "ZoneName".to_string()
}

fn default_path_column() -> String {
    "ClientRequestPath".to_string()
}

fn default_delimiter() -> char {
    ','
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("firewall-log.txt")
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.settings.retention_seconds == 0 {
            anyhow::bail!("retention_seconds must be greater than 0");
        }
        if self.settings.retention_seconds > i64::MAX as u64 / 1000 {
            anyhow::bail!(
                "retention_seconds ({}) is too large",
                self.settings.retention_seconds
            );
        }

        let columns = [
            &self.input.ip_column,
            &self.input.zone_column,
            &self.input.path_column,
        ];
        if columns.iter().any(|c| c.trim().is_empty()) {
            anyhow::bail!("input column names must not be empty");
        }
        if self.input.delimiter == '"' || self.input.delimiter == '\n' {
            anyhow::bail!("invalid input delimiter {:?}", self.input.delimiter);
        }

        self.parse_allowlist()?;
        self.compile_rules()?;

        Ok(())
    }

    /// Parse allowlist entries into IPs and networks.
    pub fn parse_allowlist(&self) -> anyhow::Result<AllowList> {
        Ok(AllowList::parse(self.allowlist.as_slice())?)
    }

    /// Compile zone patterns.
    pub fn compile_rules(&self) -> anyhow::Result<RuleSet> {
        Ok(RuleSet::new(&self.zones)?)
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# Zone Firewall Configuration

settings:
  retention_seconds: 43200     # Blocked IPs expire after 12 hours
  log_blocked: true
  log_allowed: false

# IP allowlist - always allowed, even if blocked
# Supports single IPs and CIDR notation
allowlist:
  - "42.143.155.128"
  - "50.97.88.31"
  - "167.156.227.203"
  - "151.104.73.27"
  - "144.79.40.8"

# Malicious request path patterns per zone (case-insensitive regex)
zones:
  infinitepay.io:
    - "' OR 1=1--"
    - "union.*select.*from"
  otherzone.io: []

# Input columns
input:
  ip_column: "ClientIP"
  zone_column: "ZoneName"
  path_column: "ClientRequestPath"
  delimiter: ","

# Audit log
audit:
  path: "firewall-log.txt"     # Supports ${ENV_VAR} expansion
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid");

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let var_value = std::env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
