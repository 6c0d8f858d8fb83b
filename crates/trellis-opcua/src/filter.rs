// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Monitored item filters.
//!
//! A data-change filter decides whether a new sample differs enough from
//! the last queued one to be worth reporting:
//!
//! ```text
//!   status changed? ──yes──► report
//!        │no
//!   trigger == Status ──────► suppress
//!        │
//!   value equal? ──yes──► report only if trigger includes timestamp and it moved
//!        │no
//!   deadband:  None     ──► report
//!              Absolute ──► report if |new - old| >= value
//!              Percent  ──► report if |new - old| >= percent/100 * (high - low)
//! ```
//!
//! Deadband comparison uses the declared data kind of the node; values of
//! non-numeric kinds are never suppressed by a deadband.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use trellis_core::{AttributeId, DataKind, DataValue, StatusCode, Variant};

// =============================================================================
// Filter Definitions
// =============================================================================

/// The filter attached to a monitored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitoringFilter {
    /// No filter: report on status or value change.
    #[default]
    None,
    /// Data-change filter for Value items.
    DataChange(DataChangeFilter),
    /// Event filter for EventNotifier items.
    Event(EventFilter),
}

impl MonitoringFilter {
    /// Creates an absolute deadband filter.
    pub fn absolute_deadband(value: f64) -> Self {
        Self::DataChange(DataChangeFilter {
            trigger: DataChangeTrigger::StatusValue,
            deadband: Deadband::Absolute { value },
        })
    }

    /// Creates a percent deadband filter.
    pub fn percent_deadband(percent: f64) -> Self {
        Self::DataChange(DataChangeFilter {
            trigger: DataChangeTrigger::StatusValue,
            deadband: Deadband::Percent { percent },
        })
    }

    /// Creates an event filter selecting the given fields.
    pub fn events<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Event(EventFilter {
            select_clauses: fields.into_iter().map(Into::into).collect(),
        })
    }

    /// Checks parameter ranges that can be verified without the server.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::None => Ok(()),
            Self::DataChange(f) => f.deadband.validate(),
            Self::Event(f) if f.select_clauses.is_empty() => {
                Err("event filter must select at least one field".into())
            }
            Self::Event(_) => Ok(()),
        }
    }
}

/// Data-change filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataChangeFilter {
    /// What counts as a change.
    #[serde(default)]
    pub trigger: DataChangeTrigger,
    /// Deadband applied to value changes.
    #[serde(default)]
    pub deadband: Deadband,
}

/// What counts as a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataChangeTrigger {
    /// Status changes only.
    Status,
    /// Status or value changes.
    #[default]
    StatusValue,
    /// Status, value or source timestamp changes.
    StatusValueTimestamp,
}

/// Deadband settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Deadband {
    /// No deadband.
    #[default]
    None,
    /// Absolute deadband.
    Absolute {
        /// Minimum reported change.
        value: f64,
    },
    /// Percent of the engineering-units range.
    Percent {
        /// Percentage (0-100).
        percent: f64,
    },
}

impl Deadband {
    fn validate(&self) -> Result<(), String> {
        match *self {
            Self::None => Ok(()),
            Self::Absolute { value } if value.is_finite() && value >= 0.0 => Ok(()),
            Self::Absolute { .. } => Err("absolute deadband must be finite and >= 0".into()),
            Self::Percent { percent } if (0.0..=100.0).contains(&percent) => Ok(()),
            Self::Percent { .. } => Err("percent deadband must be within 0..=100".into()),
        }
    }
}

/// Event filter: the event fields to report, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventFilter {
    /// Field names to select.
    pub select_clauses: Vec<String>,
}

impl EventFilter {
    /// Projects an event onto the select clauses; absent fields become `Null`.
    pub fn project(&self, fields: &HashMap<String, Variant>) -> Vec<Variant> {
        self.select_clauses
            .iter()
            .map(|clause| fields.get(clause).cloned().unwrap_or(Variant::Null))
            .collect()
    }
}

/// Outcome of filter validation, returned with create/modify results.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterResult {
    /// Per-clause outcome of an event filter.
    Event {
        /// One status per select clause.
        select_clause_results: Vec<StatusCode>,
    },
}

/// Engineering-units range of an analog node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EuRange {
    /// Low limit.
    pub low: f64,
    /// High limit.
    pub high: f64,
}

// =============================================================================
// Server-side Resolution
// =============================================================================

/// A filter checked against its target and ready to evaluate samples.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedFilter {
    /// Value item.
    DataChange(ChangeDetector),
    /// Event item.
    Event(EventFilter),
}

impl ResolvedFilter {
    /// Validates `filter` for the target attribute and resolves the deadband.
    pub fn resolve(
        filter: &MonitoringFilter,
        attribute: AttributeId,
        kind: Option<DataKind>,
        eu_range: Option<EuRange>,
    ) -> Result<(Self, Option<FilterResult>), StatusCode> {
        if attribute == AttributeId::EventNotifier {
            return match filter {
                MonitoringFilter::Event(f) if !f.select_clauses.is_empty() => {
                    let results = f
                        .select_clauses
                        .iter()
                        .map(|c| {
                            if c.trim().is_empty() {
                                StatusCode::BAD_EVENT_FILTER_INVALID
                            } else {
                                StatusCode::GOOD
                            }
                        })
                        .collect();
                    Ok((
                        Self::Event(f.clone()),
                        Some(FilterResult::Event {
                            select_clause_results: results,
                        }),
                    ))
                }
                MonitoringFilter::Event(_) | MonitoringFilter::None => {
                    Err(StatusCode::BAD_MONITORED_ITEM_FILTER_INVALID)
                }
                MonitoringFilter::DataChange(_) => Err(StatusCode::BAD_FILTER_NOT_ALLOWED),
            };
        }

        match filter {
            MonitoringFilter::None => Ok((Self::DataChange(ChangeDetector::plain(kind)), None)),
            MonitoringFilter::Event(_) => Err(StatusCode::BAD_FILTER_NOT_ALLOWED),
            MonitoringFilter::DataChange(_) if attribute != AttributeId::Value => {
                Err(StatusCode::BAD_FILTER_NOT_ALLOWED)
            }
            MonitoringFilter::DataChange(f) => {
                let threshold = match f.deadband {
                    Deadband::None => None,
                    Deadband::Absolute { value } => {
                        if !value.is_finite() || value < 0.0 {
                            return Err(StatusCode::BAD_DEADBAND_FILTER_INVALID);
                        }
                        Some(value)
                    }
                    Deadband::Percent { percent } => {
                        if !(0.0..=100.0).contains(&percent) {
                            return Err(StatusCode::BAD_DEADBAND_FILTER_INVALID);
                        }
                        let range = eu_range.ok_or(StatusCode::BAD_MONITORED_ITEM_FILTER_UNSUPPORTED)?;
                        Some(percent / 100.0 * (range.high - range.low).abs())
                    }
                };
                Ok((
                    Self::DataChange(ChangeDetector {
                        trigger: f.trigger,
                        threshold,
                        kind,
                    }),
                    None,
                ))
            }
        }
    }
}

/// Decides whether a value sample is a reportable change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeDetector {
    trigger: DataChangeTrigger,
    threshold: Option<f64>,
    kind: Option<DataKind>,
}

impl ChangeDetector {
    /// A detector with the default trigger and no deadband.
    pub fn plain(kind: Option<DataKind>) -> Self {
        Self {
            trigger: DataChangeTrigger::StatusValue,
            threshold: None,
            kind,
        }
    }

    /// Returns `true` if `candidate` should be queued given the last queued value.
    pub fn is_change(&self, previous: Option<&DataValue>, candidate: &DataValue) -> bool {
        let Some(previous) = previous else {
            return true;
        };

        if previous.status != candidate.status {
            return true;
        }
        if self.trigger == DataChangeTrigger::Status {
            return false;
        }

        if previous.value == candidate.value {
            return self.trigger == DataChangeTrigger::StatusValueTimestamp
                && previous.source_timestamp != candidate.source_timestamp;
        }

        match (self.threshold, &previous.value, &candidate.value) {
            (Some(threshold), Some(old), Some(new)) => self.exceeds(old, new, threshold),
            _ => true,
        }
    }

    fn exceeds(&self, old: &Variant, new: &Variant, threshold: f64) -> bool {
        if let Some(kind) = self.kind {
            if !kind.is_numeric() && kind != DataKind::Array {
                return true;
            }
        }

        match (old, new) {
            (Variant::Array(a), Variant::Array(b)) => {
                a.len() != b.len()
                    || a.iter()
                        .zip(b.iter())
                        .any(|(x, y)| scalar_delta(x, y).map_or(x != y, |d| d >= threshold))
            }
            _ => match scalar_delta(old, new) {
                Some(delta) => delta >= threshold,
                None => true,
            },
        }
    }
}

/// Absolute difference of two numeric scalars; integers are subtracted exactly.
fn scalar_delta(old: &Variant, new: &Variant) -> Option<f64> {
    if let (Some(a), Some(b)) = (old.as_i128(), new.as_i128()) {
        return Some((a - b).unsigned_abs() as f64);
    }
    let delta = (old.as_f64()? - new.as_f64()?).abs();
    // NaN compares false against any threshold, so it would be suppressed.
    if delta.is_nan() {
        return Some(f64::INFINITY);
    }
    Some(delta)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn value(v: impl Into<Variant>) -> DataValue {
        DataValue {
            value: Some(v.into()),
            status: StatusCode::GOOD,
            source_timestamp: None,
            server_timestamp: None,
        }
    }

    fn detector(filter: MonitoringFilter, kind: DataKind) -> ChangeDetector {
        match ResolvedFilter::resolve(&filter, AttributeId::Value, Some(kind), None) {
            Ok((ResolvedFilter::DataChange(d), _)) => d,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_absolute_deadband_boundary_is_reported() {
        let d = detector(MonitoringFilter::absolute_deadband(5.0), DataKind::Int32);
        let old = value(100i32);
        assert!(d.is_change(Some(&old), &value(105i32)));
        assert!(d.is_change(Some(&old), &value(95i32)));
        assert!(!d.is_change(Some(&old), &value(104i32)));
        assert!(!d.is_change(Some(&old), &value(96i32)));
    }

    #[test]
    fn test_deadband_on_float() {
        let d = detector(MonitoringFilter::absolute_deadband(0.5), DataKind::Double);
        let old = value(1.0f64);
        assert!(!d.is_change(Some(&old), &value(1.25f64)));
        assert!(d.is_change(Some(&old), &value(1.5f64)));
        assert!(d.is_change(Some(&old), &value(f64::NAN)));
    }

    #[test]
    fn test_non_numeric_never_suppressed() {
        let d = detector(MonitoringFilter::absolute_deadband(100.0), DataKind::String);
        assert!(d.is_change(Some(&value("a")), &value("b")));
        assert!(!d.is_change(Some(&value("a")), &value("a")));
    }

    #[test]
    fn test_status_change_bypasses_deadband() {
        let d = detector(MonitoringFilter::absolute_deadband(10.0), DataKind::Int32);
        let old = value(1i32);
        let mut bad = value(1i32);
        bad.status = StatusCode::BAD_WAITING_FOR_INITIAL_DATA;
        assert!(d.is_change(Some(&old), &bad));
    }

    #[test]
    fn test_percent_deadband_uses_eu_range() {
        let filter = MonitoringFilter::percent_deadband(10.0);
        let range = EuRange {
            low: 0.0,
            high: 200.0,
        };
        let (resolved, _) =
            ResolvedFilter::resolve(&filter, AttributeId::Value, Some(DataKind::Double), Some(range))
                .unwrap();
        let ResolvedFilter::DataChange(d) = resolved else {
            panic!("expected data change filter");
        };
        assert!(!d.is_change(Some(&value(50.0f64)), &value(69.0f64)));
        assert!(d.is_change(Some(&value(50.0f64)), &value(70.0f64)));

        assert_eq!(
            ResolvedFilter::resolve(&filter, AttributeId::Value, Some(DataKind::Double), None)
                .unwrap_err(),
            StatusCode::BAD_MONITORED_ITEM_FILTER_UNSUPPORTED
        );
    }

    #[test]
    fn test_filter_attribute_compatibility() {
        let deadband = MonitoringFilter::absolute_deadband(1.0);
        assert_eq!(
            ResolvedFilter::resolve(&deadband, AttributeId::DisplayName, None, None).unwrap_err(),
            StatusCode::BAD_FILTER_NOT_ALLOWED
        );
        assert_eq!(
            ResolvedFilter::resolve(&deadband, AttributeId::EventNotifier, None, None).unwrap_err(),
            StatusCode::BAD_FILTER_NOT_ALLOWED
        );
        let events = MonitoringFilter::events(["Message"]);
        assert_eq!(
            ResolvedFilter::resolve(&events, AttributeId::Value, None, None).unwrap_err(),
            StatusCode::BAD_FILTER_NOT_ALLOWED
        );
        assert_eq!(
            ResolvedFilter::resolve(&MonitoringFilter::None, AttributeId::EventNotifier, None, None)
                .unwrap_err(),
            StatusCode::BAD_MONITORED_ITEM_FILTER_INVALID
        );
        assert!(ResolvedFilter::resolve(&events, AttributeId::EventNotifier, None, None).is_ok());
    }

    #[test]
    fn test_trigger_modes() {
        let status_only = detector(
            MonitoringFilter::DataChange(DataChangeFilter {
                trigger: DataChangeTrigger::Status,
                deadband: Deadband::None,
            }),
            DataKind::Int32,
        );
        assert!(!status_only.is_change(Some(&value(1i32)), &value(2i32)));

        let with_timestamp = detector(
            MonitoringFilter::DataChange(DataChangeFilter {
                trigger: DataChangeTrigger::StatusValueTimestamp,
                deadband: Deadband::None,
            }),
            DataKind::Int32,
        );
        let mut later = value(1i32);
        later.source_timestamp = Some(chrono::Utc::now());
        assert!(with_timestamp.is_change(Some(&value(1i32)), &later));
        assert!(!ChangeDetector::plain(None).is_change(Some(&value(1i32)), &later));
    }

    #[test]
    fn test_event_projection() {
        let filter = EventFilter {
            select_clauses: vec!["Severity".into(), "Missing".into()],
        };
        let mut fields = HashMap::new();
        fields.insert("Severity".to_string(), Variant::UInt16(500));
        assert_eq!(
            filter.project(&fields),
            vec![Variant::UInt16(500), Variant::Null]
        );
    }

    #[test]
    fn test_client_side_validation() {
        assert!(MonitoringFilter::absolute_deadband(-1.0).validate().is_err());
        assert!(MonitoringFilter::percent_deadband(101.0).validate().is_err());
        assert!(MonitoringFilter::events(Vec::<String>::new()).validate().is_err());
        assert!(MonitoringFilter::absolute_deadband(5.0).validate().is_ok());
    }
}
