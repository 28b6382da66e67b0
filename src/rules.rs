//! Alert rule evaluation
//!
//! The engine matches a metric against the configured rules and decides which
//! ones fire. A rule's scope fields (`device_id`, `device_type`, `room_id`)
//! are each optional; `None` is a wildcard. All matching rules are evaluated
//! independently, sorted by priority descending.
//!
//! ## Duration gating
//!
//! A rule with `duration_secs > 0` must hold continuously before it produces
//! an alarm-creating match. The engine tracks, per (rule, device) pair, when
//! the condition first fired; any evaluation where the condition does not fire
//! clears that state.
//!
//! ## Silence windows
//!
//! A rule inside its daily `[silence_start, silence_end)` window still fires
//! for record-keeping, but the match is flagged `silenced` so that no
//! notification is dispatched.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::{Metric, MetricStatus};

/// Comparison applied to the metric value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    Gt,
    Lt,
    Eq,
    Ge,
    Le,
    Ne,
    Between,
    NotBetween,
}

impl AlertCondition {
    /// Whether the condition fires for `value` against the rule thresholds.
    ///
    /// `Between`/`NotBetween` need a lower threshold; a rule missing it never
    /// fires.
    pub fn fires(&self, value: f64, upper: f64, lower: Option<f64>) -> bool {
        match self {
            AlertCondition::Gt => value > upper,
            AlertCondition::Lt => value < upper,
            AlertCondition::Eq => value == upper,
            AlertCondition::Ge => value >= upper,
            AlertCondition::Le => value <= upper,
            AlertCondition::Ne => value != upper,
            AlertCondition::Between => lower.is_some_and(|lo| lo <= value && value <= upper),
            AlertCondition::NotBetween => lower.is_some_and(|lo| value < lo || value > upper),
        }
    }
}

/// Configured condition over a metric type and scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub name: String,

    /// Scope: `None` is a wildcard
    pub device_id: Option<i64>,
    pub device_type: Option<String>,
    pub room_id: Option<i64>,

    /// Must match the metric's `metric_type`
    pub alert_type: String,

    pub condition: AlertCondition,
    pub threshold_upper: f64,
    pub threshold_lower: Option<f64>,

    /// Seconds the condition must hold continuously before firing
    #[serde(default)]
    pub duration_secs: u64,

    #[serde(default)]
    pub priority: i32,

    /// Severity of alarms raised by this rule
    #[serde(default = "default_level")]
    pub level: MetricStatus,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Daily wall-clock silence window `[start, end)`; `start > end` wraps
    /// past midnight
    pub silence_start: Option<NaiveTime>,
    pub silence_end: Option<NaiveTime>,

    /// Whether a recovery notification is sent when the condition clears
    #[serde(default)]
    pub recovery_notify: bool,
}

fn default_level() -> MetricStatus {
    MetricStatus::Warning
}

fn default_enabled() -> bool {
    true
}

impl AlertRule {
    fn applies_to(&self, metric: &Metric) -> bool {
        if !self.enabled || self.alert_type != metric.metric_type {
            return false;
        }
        if self.device_id.is_some_and(|id| id != metric.device_id) {
            return false;
        }
        if self
            .device_type
            .as_ref()
            .is_some_and(|t| *t != metric.device_type)
        {
            return false;
        }
        if self.room_id.is_some() && self.room_id != metric.room_id {
            return false;
        }
        true
    }

    /// Whether `at` falls inside the daily silence window
    pub fn is_silenced(&self, at: DateTime<Utc>) -> bool {
        let (Some(start), Some(end)) = (self.silence_start, self.silence_end) else {
            return false;
        };
        let time = at.time();
        if start <= end {
            start <= time && time < end
        } else {
            // window wraps past midnight
            time >= start || time < end
        }
    }
}

/// A rule that fired for a metric
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule: AlertRule,
    /// Inside the rule's silence window: record, but do not notify
    pub silenced: bool,
}

/// Evaluates metrics against the rule set
///
/// Evaluation for one device is linearized by the scheduler's per-device
/// single-flight guarantee; the internal locks only arbitrate between
/// different devices' workers.
#[derive(Debug, Default)]
pub struct AlertRuleEngine {
    rules: RwLock<Vec<AlertRule>>,

    /// When the condition first fired, per (rule_id, device_id)
    held_since: Mutex<HashMap<(i64, i64), DateTime<Utc>>>,
}

impl AlertRuleEngine {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
            held_since: Mutex::new(HashMap::new()),
        }
    }

    /// Swap in a new rule set (rules are edited externally). Hold state for
    /// rules that no longer exist is dropped.
    pub fn replace_rules(&self, rules: Vec<AlertRule>) {
        let ids: std::collections::HashSet<i64> = rules.iter().map(|r| r.id).collect();
        let mut guard = self.rules.write().expect("rule set lock poisoned");
        *guard = rules;
        self.held_since
            .lock()
            .expect("hold state lock poisoned")
            .retain(|(rule_id, _), _| ids.contains(rule_id));
    }

    /// Evaluate a metric against all applicable rules; returns the rules that
    /// fire (alarm-creating matches only, after duration gating).
    pub fn evaluate(&self, metric: &Metric) -> Vec<RuleMatch> {
        self.evaluate_at(metric, Utc::now())
    }

    pub fn evaluate_at(&self, metric: &Metric, now: DateTime<Utc>) -> Vec<RuleMatch> {
        let mut candidates: Vec<AlertRule> = self
            .rules
            .read()
            .expect("rule set lock poisoned")
            .iter()
            .filter(|r| r.applies_to(metric))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut held = self.held_since.lock().expect("hold state lock poisoned");
        let mut matches = Vec::new();

        for rule in candidates {
            if (rule.condition == AlertCondition::Between
                || rule.condition == AlertCondition::NotBetween)
                && rule.threshold_lower.is_none()
            {
                warn!("rule {} ({}) has no lower threshold, skipping", rule.id, rule.name);
                continue;
            }

            let fired = rule
                .condition
                .fires(metric.value, rule.threshold_upper, rule.threshold_lower);
            let key = (rule.id, metric.device_id);

            if !fired {
                held.remove(&key);
                continue;
            }

            let since = *held.entry(key).or_insert(now);
            let held_secs = (now - since).num_seconds().max(0) as u64;
            if held_secs < rule.duration_secs {
                trace!(
                    "rule {} held {}s of required {}s for device {}",
                    rule.id, held_secs, rule.duration_secs, metric.device_id
                );
                continue;
            }

            let silenced = rule.is_silenced(now);
            trace!(
                "rule {} fires for device {} (value {}, silenced: {silenced})",
                rule.id, metric.device_id, metric.value
            );
            matches.push(RuleMatch { rule, silenced });
        }

        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn rule(condition: AlertCondition, upper: f64, lower: Option<f64>) -> AlertRule {
        AlertRule {
            id: 1,
            name: "test rule".to_string(),
            device_id: None,
            device_type: None,
            room_id: None,
            alert_type: "temperature".to_string(),
            condition,
            threshold_upper: upper,
            threshold_lower: lower,
            duration_secs: 0,
            priority: 5,
            level: MetricStatus::Warning,
            enabled: true,
            silence_start: None,
            silence_end: None,
            recovery_notify: false,
        }
    }

    fn metric(value: f64) -> Metric {
        Metric {
            device_id: 10,
            device_type: "SENSOR".to_string(),
            room_id: Some(3),
            metric_type: "temperature".to_string(),
            value,
            unit: "°C".to_string(),
            collected_at: Utc::now(),
            status: MetricStatus::Normal,
        }
    }

    #[test]
    fn condition_table() {
        assert!(AlertCondition::Gt.fires(85.0, 80.0, None));
        assert!(!AlertCondition::Gt.fires(80.0, 80.0, None));
        assert!(AlertCondition::Ge.fires(80.0, 80.0, None));
        assert!(AlertCondition::Lt.fires(79.9, 80.0, None));
        assert!(!AlertCondition::Lt.fires(80.0, 80.0, None));
        assert!(AlertCondition::Le.fires(80.0, 80.0, None));
        assert!(AlertCondition::Eq.fires(80.0, 80.0, None));
        assert!(AlertCondition::Ne.fires(80.1, 80.0, None));
        assert!(AlertCondition::Between.fires(20.0, 28.0, Some(18.0)));
        assert!(AlertCondition::Between.fires(18.0, 28.0, Some(18.0)));
        assert!(AlertCondition::Between.fires(28.0, 28.0, Some(18.0)));
        assert!(!AlertCondition::Between.fires(17.0, 28.0, Some(18.0)));
        assert!(AlertCondition::NotBetween.fires(17.0, 28.0, Some(18.0)));
        assert!(AlertCondition::NotBetween.fires(30.0, 28.0, Some(18.0)));
        assert!(!AlertCondition::NotBetween.fires(20.0, 28.0, Some(18.0)));
    }

    #[test]
    fn temperature_band_sequence_fires_only_out_of_range() {
        // alert when temperature leaves the 18..=28 comfort band
        let engine = AlertRuleEngine::new(vec![rule(
            AlertCondition::NotBetween,
            28.0,
            Some(18.0),
        )]);

        let fired: Vec<f64> = [17.0, 19.0, 30.0, 20.0]
            .into_iter()
            .filter(|v| !engine.evaluate(&metric(*v)).is_empty())
            .collect();
        assert_eq!(fired, vec![17.0, 30.0]);
    }

    #[test]
    fn scope_wildcards_and_mismatches() {
        let mut scoped = rule(AlertCondition::Gt, 80.0, None);
        scoped.device_type = Some("SENSOR".to_string());
        scoped.room_id = Some(3);
        let engine = AlertRuleEngine::new(vec![scoped]);

        assert_eq!(engine.evaluate(&metric(85.0)).len(), 1);

        let mut other_room = metric(85.0);
        other_room.room_id = Some(4);
        assert!(engine.evaluate(&other_room).is_empty());

        let mut other_type = metric(85.0);
        other_type.device_type = "UPS".to_string();
        assert!(engine.evaluate(&other_type).is_empty());
    }

    #[test]
    fn disabled_and_wrong_type_rules_are_not_candidates() {
        let mut disabled = rule(AlertCondition::Gt, 80.0, None);
        disabled.enabled = false;
        let mut wrong_type = rule(AlertCondition::Gt, 80.0, None);
        wrong_type.id = 2;
        wrong_type.alert_type = "humidity".to_string();

        let engine = AlertRuleEngine::new(vec![disabled, wrong_type]);
        assert!(engine.evaluate(&metric(95.0)).is_empty());
    }

    #[test]
    fn all_matching_rules_fire_sorted_by_priority() {
        let mut low = rule(AlertCondition::Gt, 80.0, None);
        low.priority = 1;
        let mut high = rule(AlertCondition::Gt, 70.0, None);
        high.id = 2;
        high.priority = 9;

        let engine = AlertRuleEngine::new(vec![low, high]);
        let matches = engine.evaluate(&metric(85.0));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].rule.id, 2); // highest priority first
        assert_eq!(matches[1].rule.id, 1);
    }

    #[test]
    fn duration_gating_requires_continuous_hold() {
        let mut gated = rule(AlertCondition::Gt, 80.0, None);
        gated.duration_secs = 60;
        let engine = AlertRuleEngine::new(vec![gated]);

        let t0 = Utc::now();
        // first firing observation starts the hold, does not fire yet
        assert!(engine.evaluate_at(&metric(85.0), t0).is_empty());
        // still inside the hold window
        assert!(
            engine
                .evaluate_at(&metric(85.0), t0 + Duration::seconds(30))
                .is_empty()
        );
        // held for the full duration
        assert_eq!(
            engine
                .evaluate_at(&metric(85.0), t0 + Duration::seconds(60))
                .len(),
            1
        );
    }

    #[test]
    fn duration_hold_resets_when_condition_clears() {
        let mut gated = rule(AlertCondition::Gt, 80.0, None);
        gated.duration_secs = 60;
        let engine = AlertRuleEngine::new(vec![gated]);

        let t0 = Utc::now();
        assert!(engine.evaluate_at(&metric(85.0), t0).is_empty());
        // dips below the threshold: hold state cleared
        assert!(
            engine
                .evaluate_at(&metric(75.0), t0 + Duration::seconds(30))
                .is_empty()
        );
        // firing again restarts the clock
        assert!(
            engine
                .evaluate_at(&metric(85.0), t0 + Duration::seconds(61))
                .is_empty()
        );
        assert_eq!(
            engine
                .evaluate_at(&metric(85.0), t0 + Duration::seconds(121))
                .len(),
            1
        );
    }

    #[test]
    fn duration_hold_is_per_device() {
        let mut gated = rule(AlertCondition::Gt, 80.0, None);
        gated.duration_secs = 60;
        let engine = AlertRuleEngine::new(vec![gated]);

        let t0 = Utc::now();
        assert!(engine.evaluate_at(&metric(85.0), t0).is_empty());

        let mut other = metric(85.0);
        other.device_id = 11;
        // a different device starts its own hold
        assert!(engine.evaluate_at(&other, t0 + Duration::seconds(60)).is_empty());
        // the first device has now held long enough
        assert_eq!(
            engine
                .evaluate_at(&metric(85.0), t0 + Duration::seconds(60))
                .len(),
            1
        );
    }

    #[test]
    fn silence_window_flags_match_but_still_fires() {
        let mut silenced = rule(AlertCondition::Gt, 80.0, None);
        silenced.silence_start = Some(NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        silenced.silence_end = Some(NaiveTime::from_hms_opt(23, 59, 59).unwrap());
        let engine = AlertRuleEngine::new(vec![silenced]);

        let matches = engine.evaluate(&metric(85.0));
        assert_eq!(matches.len(), 1);
        assert!(matches[0].silenced);
    }

    #[test]
    fn silence_window_wraps_past_midnight() {
        let mut r = rule(AlertCondition::Gt, 80.0, None);
        r.silence_start = Some(NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        r.silence_end = Some(NaiveTime::from_hms_opt(6, 0, 0).unwrap());

        let at = |h: u32| {
            Utc::now()
                .date_naive()
                .and_hms_opt(h, 0, 0)
                .unwrap()
                .and_utc()
        };
        assert!(r.is_silenced(at(23)));
        assert!(r.is_silenced(at(3)));
        assert!(!r.is_silenced(at(12)));
        // half-open: the end bound itself is outside the window
        assert!(!r.is_silenced(at(6)));
    }

    #[test]
    fn replace_rules_drops_stale_hold_state() {
        let mut gated = rule(AlertCondition::Gt, 80.0, None);
        gated.duration_secs = 60;
        let engine = AlertRuleEngine::new(vec![gated.clone()]);

        let t0 = Utc::now();
        assert!(engine.evaluate_at(&metric(85.0), t0).is_empty());

        // removing the rule clears its hold; re-adding starts fresh
        engine.replace_rules(vec![]);
        engine.replace_rules(vec![gated]);
        assert!(
            engine
                .evaluate_at(&metric(85.0), t0 + Duration::seconds(90))
                .is_empty()
        );
    }
}
