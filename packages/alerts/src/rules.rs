//! Threshold rules, loaded from TOML.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::RuleError;

/// Default rule table, embedded at compile time.
const DEFAULT_RULES: &str = include_str!("../rules.toml");

/// Which side of the thresholds is bad.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Direction {
    /// Values under the thresholds breach.
    Below,
    /// Values over the thresholds breach.
    Above,
}

impl Direction {
    /// Suffix used in alert types: `low` or `high`.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Below => "low",
            Self::Above => "high",
        }
    }
}

/// A warning/critical pair in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub direction: Direction,
    pub warning: f64,
    pub critical: f64,
}

/// All limits for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    /// Parameter code (e.g. `"dissolved_oxygen"`).
    pub parameter: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Unit the thresholds are expressed in.
    pub unit: String,
    /// Other names readings may use for this parameter.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Limits checked in order.
    pub limits: Vec<Limit>,
}

impl ThresholdRule {
    /// Returns `true` if `parameter` names this rule's parameter.
    #[must_use]
    pub fn matches(&self, parameter: &str) -> bool {
        let parameter = parameter.trim();
        self.parameter.eq_ignore_ascii_case(parameter)
            || self
                .aliases
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(parameter))
    }

    fn validate(&self) -> Result<(), RuleError> {
        let invalid = |message: String| RuleError::Invalid {
            parameter: self.parameter.clone(),
            message,
        };

        if self.parameter.trim().is_empty() {
            return Err(invalid("parameter code is empty".to_string()));
        }
        if self.limits.is_empty() {
            return Err(invalid("no limits".to_string()));
        }
        for limit in &self.limits {
            if !limit.warning.is_finite() || !limit.critical.is_finite() {
                return Err(invalid(format!("{} thresholds must be finite", limit.direction)));
            }
            let ordered = match limit.direction {
                Direction::Below => limit.critical <= limit.warning,
                Direction::Above => limit.critical >= limit.warning,
            };
            if !ordered {
                return Err(invalid(format!(
                    "{} critical {} is less severe than warning {}",
                    limit.direction, limit.critical, limit.warning
                )));
            }
        }
        if self.limits.iter().enumerate().any(|(i, a)| {
            self.limits[i + 1..]
                .iter()
                .any(|b| b.direction == a.direction)
        }) {
            return Err(invalid("duplicate direction".to_string()));
        }
        Ok(())
    }
}

/// A validated set of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    rules: Vec<ThresholdRule>,
}

impl RuleSet {
    /// Parses and validates a rule table.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::Toml`] if the TOML is malformed, or
    /// [`RuleError::Invalid`] if a rule has inverted thresholds, no
    /// limits, or a parameter code used twice.
    pub fn parse(toml_str: &str) -> Result<Self, RuleError> {
        let set: Self = toml::de::from_str(toml_str)?;
        for (i, rule) in set.rules.iter().enumerate() {
            rule.validate()?;
            if set.rules[..i]
                .iter()
                .any(|other| other.parameter.eq_ignore_ascii_case(&rule.parameter))
            {
                return Err(RuleError::Invalid {
                    parameter: rule.parameter.clone(),
                    message: "defined twice".to_string(),
                });
            }
        }
        Ok(set)
    }

    /// The embedded default rules.
    ///
    /// # Panics
    ///
    /// Panics if the embedded `rules.toml` is invalid (caught by tests).
    #[must_use]
    pub fn builtin() -> Self {
        Self::parse(DEFAULT_RULES).unwrap_or_else(|e| panic!("Failed to parse rules.toml: {e}"))
    }

    /// All rules.
    #[must_use]
    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    /// Rules matching `parameter` by code or alias.
    pub fn matching<'a>(&'a self, parameter: &'a str) -> impl Iterator<Item = &'a ThresholdRule> {
        self.rules.iter().filter(move |r| r.matches(parameter))
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rules_parse() {
        let rules = RuleSet::builtin();
        assert_eq!(rules.rules().len(), 9);
        let ph: Vec<_> = rules.matching("pH").collect();
        assert_eq!(ph.len(), 1);
        assert_eq!(ph[0].limits.len(), 2);
    }

    #[test]
    fn aliases_match_case_insensitively() {
        let rules = RuleSet::builtin();
        let rule = rules.matching("dissolved oxygen (do)").next().unwrap();
        assert_eq!(rule.parameter, "dissolved_oxygen");
        assert_eq!(rules.matching("chlorophyll").count(), 0);
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let err = RuleSet::parse(
            r#"
            [[rules]]
            parameter = "do"
            unit = "mg/L"
            limits = [{ direction = "below", warning = 4.0, critical = 5.0 }]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::Invalid { .. }));
    }

    #[test]
    fn duplicate_parameters_are_rejected() {
        let rule = r#"
            [[rules]]
            parameter = "turbidity"
            unit = "NTU"
            limits = [{ direction = "above", warning = 1.0, critical = 2.0 }]
        "#;
        assert!(RuleSet::parse(&format!("{rule}\n{rule}")).is_err());
    }

    #[test]
    fn malformed_toml_is_a_toml_error() {
        assert!(matches!(
            RuleSet::parse("[[rules]\n"),
            Err(RuleError::Toml(_))
        ));
    }
}
