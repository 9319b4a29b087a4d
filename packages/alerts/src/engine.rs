//! Reading evaluation and the caller-side dedup/expiry helpers.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use uuid::Uuid;

use crate::rules::{Direction, Limit, RuleSet};

/// Alerts older than this are dropped by [`expire`].
pub const EXPIRY_HOURS: i64 = 24;

/// The default expiry window.
#[must_use]
pub fn expiry_window() -> TimeDelta {
    TimeDelta::hours(EXPIRY_HOURS)
}

/// One measurement at one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    /// Monitoring site identifier.
    pub site_id: String,
    /// Parameter name or alias, e.g. `"pH"` or `"Escherichia coli"`.
    pub parameter: String,
    /// Measured value in the rule's unit.
    pub value: f64,
}

/// Where a value sits relative to one limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Level {
    Nominal,
    Warning,
    Critical,
}

/// Severity of an emitted alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Level {
    /// Alert severity, or `None` for nominal values.
    #[must_use]
    pub const fn severity(self) -> Option<Severity> {
        match self {
            Self::Nominal => None,
            Self::Warning => Some(Severity::Warning),
            Self::Critical => Some(Severity::Critical),
        }
    }
}

/// A threshold crossing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Random v4 id.
    pub id: Uuid,
    /// Site the reading came from.
    pub site_id: String,
    /// Display name; the site id when no name is known.
    pub site_name: String,
    /// State code, if known.
    pub state: Option<String>,
    /// Canonical parameter code from the rule.
    pub parameter: String,
    /// The reading's value.
    pub value: f64,
    /// Unit of `value` and `threshold`.
    pub unit: String,
    /// The threshold that was crossed.
    pub threshold: f64,
    /// Warning or critical.
    pub severity: Severity,
    /// `"{parameter}_{low|high}"`.
    pub alert_type: String,
    /// When the alert was evaluated.
    pub fired_at: DateTime<Utc>,
}

/// Classifies `value` against one limit. Thresholds are exclusive and
/// non-finite values are nominal.
#[must_use]
pub fn classify(value: f64, limit: &Limit) -> Level {
    if !value.is_finite() {
        return Level::Nominal;
    }
    let breaches = |threshold: f64| match limit.direction {
        Direction::Below => value < threshold,
        Direction::Above => value > threshold,
    };
    if breaches(limit.critical) {
        Level::Critical
    } else if breaches(limit.warning) {
        Level::Warning
    } else {
        Level::Nominal
    }
}

/// Checks every reading against every matching rule.
///
/// Emits at most one alert per `(reading, limit)`: critical supersedes
/// warning. Unknown parameters and nominal values emit nothing. Site names
/// fall back to the site id.
#[must_use]
pub fn evaluate(
    readings: &[Reading],
    rules: &RuleSet,
    site_names: &BTreeMap<String, String>,
    site_states: &BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    for reading in readings {
        for rule in rules.matching(&reading.parameter) {
            for limit in &rule.limits {
                let level = classify(reading.value, limit);
                let Some(severity) = level.severity() else {
                    continue;
                };
                let threshold = match severity {
                    Severity::Critical => limit.critical,
                    Severity::Warning => limit.warning,
                };

                alerts.push(Alert {
                    id: Uuid::new_v4(),
                    site_id: reading.site_id.clone(),
                    site_name: site_names
                        .get(&reading.site_id)
                        .cloned()
                        .unwrap_or_else(|| reading.site_id.clone()),
                    state: site_states.get(&reading.site_id).cloned(),
                    parameter: rule.parameter.clone(),
                    value: reading.value,
                    unit: rule.unit.clone(),
                    threshold,
                    severity,
                    alert_type: format!("{}_{}", rule.parameter, limit.direction.suffix()),
                    fired_at: now,
                });
            }
        }
    }

    log::debug!(
        "Evaluated {} readings against {} rules: {} alerts",
        readings.len(),
        rules.rules().len(),
        alerts.len()
    );
    alerts
}

/// Keeps the most recently fired alert per `(site, parameter, alert_type)`.
/// Ties go to the later alert in `alerts`. Output is newest first.
#[must_use]
pub fn dedup_latest(alerts: Vec<Alert>) -> Vec<Alert> {
    let mut latest: BTreeMap<(String, String, String), Alert> = BTreeMap::new();
    for alert in alerts {
        let key = (
            alert.site_id.clone(),
            alert.parameter.clone(),
            alert.alert_type.clone(),
        );
        match latest.get(&key) {
            Some(kept) if kept.fired_at > alert.fired_at => {}
            _ => {
                latest.insert(key, alert);
            }
        }
    }

    let mut kept: Vec<Alert> = latest.into_values().collect();
    kept.sort_by(|a, b| b.fired_at.cmp(&a.fired_at));
    kept
}

/// Drops alerts fired more than `window` before `now`.
#[must_use]
pub fn expire(alerts: Vec<Alert>, now: DateTime<Utc>, window: TimeDelta) -> Vec<Alert> {
    alerts
        .into_iter()
        .filter(|a| now.signed_duration_since(a.fired_at) <= window)
        .collect()
}

/// Merges `incoming` into `existing`, deduplicating then expiring.
#[must_use]
pub fn merge_alerts(
    existing: Vec<Alert>,
    incoming: Vec<Alert>,
    now: DateTime<Utc>,
    window: TimeDelta,
) -> Vec<Alert> {
    let mut all = existing;
    all.extend(incoming);
    expire(dedup_latest(all), now, window)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(site: &str, parameter: &str, value: f64) -> Reading {
        Reading {
            site_id: site.to_string(),
            parameter: parameter.to_string(),
            value,
        }
    }

    fn evaluate_one(parameter: &str, value: f64) -> Vec<Alert> {
        evaluate(
            &[reading("site-1", parameter, value)],
            &RuleSet::builtin(),
            &BTreeMap::from([("site-1".to_string(), "Back River".to_string())]),
            &BTreeMap::from([("site-1".to_string(), "MD".to_string())]),
            Utc::now(),
        )
    }

    #[test]
    fn critical_supersedes_warning() {
        let limit = Limit {
            direction: Direction::Below,
            warning: 5.0,
            critical: 4.0,
        };
        assert_eq!(classify(3.0, &limit), Level::Critical);
        assert_eq!(classify(4.5, &limit), Level::Warning);
        assert_eq!(classify(5.0, &limit), Level::Nominal);
        assert_eq!(classify(f64::NAN, &limit), Level::Nominal);

        let alerts = evaluate_one("dissolved_oxygen", 3.0);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert!((alerts[0].threshold - 4.0).abs() < f64::EPSILON);
        assert_eq!(alerts[0].alert_type, "dissolved_oxygen_low");
        assert_eq!(alerts[0].site_name, "Back River");
        assert_eq!(alerts[0].state.as_deref(), Some("MD"));
        assert_eq!(alerts[0].unit, "mg/L");
    }

    #[test]
    fn nominal_and_unknown_readings_emit_nothing() {
        assert!(evaluate_one("dissolved_oxygen", 7.5).is_empty());
        assert!(evaluate_one("chlorophyll", 1000.0).is_empty());
    }

    #[test]
    fn ph_checks_each_direction() {
        let high = evaluate_one("pH", 8.7);
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].alert_type, "ph_high");
        assert_eq!(high[0].severity, Severity::Warning);

        let low = evaluate_one("ph", 5.5);
        assert_eq!(low[0].alert_type, "ph_low");
        assert_eq!(low[0].severity, Severity::Critical);
    }

    #[test]
    fn alias_readings_use_the_rule_code() {
        let alerts = evaluate_one("Escherichia coli", 500.0);
        assert_eq!(alerts[0].parameter, "e_coli");
        assert_eq!(alerts[0].alert_type, "e_coli_high");
    }

    #[test]
    fn dedup_keeps_latest() {
        let now = Utc::now();
        let mut older = evaluate_one("turbidity", 60.0).remove(0);
        older.fired_at = now - TimeDelta::hours(2);
        let mut newer = older.clone();
        newer.id = Uuid::new_v4();
        newer.fired_at = now;

        let kept = dedup_latest(vec![newer.clone(), older]);
        assert_eq!(kept, vec![newer]);
    }

    #[test]
    fn dedup_separates_alert_types() {
        let mut low = evaluate_one("ph", 6.2).remove(0);
        let high = evaluate_one("ph", 8.7).remove(0);
        low.site_id = high.site_id.clone();
        assert_eq!(dedup_latest(vec![low, high]).len(), 2);
    }

    #[test]
    fn expiry_window_is_inclusive_of_24_hours() {
        let now = Utc::now();
        let base = evaluate_one("turbidity", 60.0).remove(0);
        let mut stale = base.clone();
        stale.fired_at = now - TimeDelta::hours(24) - TimeDelta::seconds(1);
        let mut recent = base;
        recent.fired_at = now - TimeDelta::hours(23) - TimeDelta::minutes(59);
        recent.site_id = "site-2".to_string();

        let kept = expire(vec![stale, recent.clone()], now, expiry_window());
        assert_eq!(kept, vec![recent]);
    }

    #[test]
    fn merge_dedups_then_expires() {
        let now = Utc::now();
        let mut existing = evaluate_one("turbidity", 60.0).remove(0);
        existing.fired_at = now - TimeDelta::hours(1);
        let mut expired = evaluate_one("tss", 30.0).remove(0);
        expired.fired_at = now - TimeDelta::hours(30);
        let incoming = evaluate_one("turbidity", 120.0);

        let merged = merge_alerts(vec![existing, expired], incoming.clone(), now, expiry_window());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, incoming[0].id);
    }

    #[test]
    fn alerts_serialize_camel_case() {
        let alert = evaluate_one("turbidity", 60.0).remove(0);
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["alertType"], "turbidity_high");
        assert_eq!(json["severity"], "warning");
        assert!(json["firedAt"].is_string());
    }
}
