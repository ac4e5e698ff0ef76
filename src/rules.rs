//! Per-zone malicious pattern rules.

use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use thiserror::Error;

/// Error compiling a zone rule.
#[derive(Debug, Error)]
#[error("invalid pattern {pattern:?} for zone '{zone}': {source}")]
pub struct RuleError {
    pub zone: String,
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// A single compiled, case-insensitive pattern.
#[derive(Debug, Clone)]
pub struct ZoneRule {
    pattern: String,
    regex: Regex,
}

impl ZoneRule {
    /// Compile `pattern` for `zone`.
    pub fn new(zone: &str, pattern: &str) -> Result<Self, RuleError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| RuleError {
                zone: zone.to_string(),
                pattern: pattern.to_string(),
                source,
            })?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// The pattern as written in configuration.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Static mapping from zone to its ordered rules.
///
/// A zone without an entry has no rules; lookups for it never match.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    zones: HashMap<String, Vec<ZoneRule>>,
}

impl RuleSet {
    /// Compile every zone's patterns.
    pub fn new<'a, Z, P>(zones: Z) -> Result<Self, RuleError>
    where
        Z: IntoIterator<Item = (&'a String, P)>,
        P: IntoIterator<Item = &'a String>,
    {
        let mut compiled = HashMap::new();
        for (zone, patterns) in zones {
            let rules = patterns
                .into_iter()
                .map(|p| ZoneRule::new(zone, p))
                .collect::<Result<Vec<_>, _>>()?;
            compiled.insert(zone.clone(), rules);
        }
        Ok(Self { zones: compiled })
    }

    /// True iff any rule of `zone` matches `path`.
    pub fn matches(&self, zone: &str, path: &str) -> bool {
        self.first_match(zone, path).is_some()
    }

    /// The first rule of `zone`, in configured order, that matches `path`.
    pub fn first_match(&self, zone: &str, path: &str) -> Option<&ZoneRule> {
        self.zones
            .get(zone)?
            .iter()
            .find(|rule| rule.is_match(path))
    }

    /// Rules configured for `zone` (empty for unknown zones).
    pub fn rules_for(&self, zone: &str) -> &[ZoneRule] {
        self.zones.get(zone).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn rule_count(&self) -> usize {
        self.zones.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample() -> RuleSet {
        let mut zones = BTreeMap::new();
        zones.insert(
            "infinitepay.io".to_string(),
            vec!["' OR 1=1--".to_string(), "union.*select.*from".to_string()],
        );
        zones.insert("otherzone.io".to_string(), vec![]);
        RuleSet::new(&zones).unwrap()
    }

    #[test]
    fn test_tautology_matches() {
        let rules = sample();
        assert!(rules.matches("infinitepay.io", "id=1' OR 1=1--"));
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let rules = sample();
        assert!(rules.matches("infinitepay.io", "/q?id=1' or 1=1--"));
        assert!(rules.matches("infinitepay.io", "/x?q=1 UNION ALL SELECT pass FROM users"));
        assert!(rules.matches("infinitepay.io", "/x?q=UnIoN sElEcT * fRoM t"));
    }

    #[test]
    fn test_clean_path_does_not_match() {
        let rules = sample();
        assert!(!rules.matches("infinitepay.io", "/checkout?id=42"));
        assert!(!rules.matches("infinitepay.io", "/select/from/union"));
    }

    #[test]
    fn test_empty_zone_never_matches() {
        let rules = sample();
        assert!(!rules.matches("otherzone.io", "id=1' OR 1=1--"));
        assert!(rules.rules_for("otherzone.io").is_empty());
    }

    #[test]
    fn test_unknown_zone_is_not_an_error() {
        let rules = sample();
        assert!(!rules.matches("unknown.example", "id=1' OR 1=1--"));
        assert!(rules.rules_for("unknown.example").is_empty());
    }

    #[test]
    fn test_first_match_respects_order() {
        let rules = sample();
        let hit = rules
            .first_match("infinitepay.io", "1' OR 1=1-- union select a from b")
            .unwrap();
        assert_eq!(hit.pattern(), "' OR 1=1--");
    }

    #[test]
    fn test_counts() {
        let rules = sample();
        assert_eq!(rules.zone_count(), 2);
        assert_eq!(rules.rule_count(), 2);
    }

    #[test]
    fn test_invalid_pattern() {
        let mut zones = BTreeMap::new();
        zones.insert("bad.io".to_string(), vec!["(unclosed".to_string()]);
        let err = RuleSet::new(&zones).unwrap_err();
        assert_eq!(err.zone, "bad.io");
        assert_eq!(err.pattern, "(unclosed");
    }
}
