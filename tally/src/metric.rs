//! Metric model: the two metric kinds and their merge rules.
//!
//! A metric is identified by its name *and* its kind, so a gauge and a
//! counter may share a name without colliding.
//!
//! - **Gauge**: an `f64` snapshot. An update replaces the stored value.
//! - **Counter**: an `i64` delta. An update is added to the stored total
//!   (an unseen counter starts at 0). Deltas may be negative.
//!
//! # Wire format
//!
//! Metrics serialize as the JSON objects used by snapshot files and the
//! collector's HTTP API. Exactly one of `value`/`delta` is written, matching
//! `type`; the other one is ignored when reading.
//!
//! ```json
//! [
//!   { "id": "Alloc", "type": "gauge", "value": 123.45 },
//!   { "id": "PollCount", "type": "counter", "delta": 5 }
//! ]
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MetricError;

/// The kind of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Last write wins.
    Gauge,
    /// Updates accumulate.
    Counter,
}

impl MetricKind {
    /// The lowercase name used on the wire and in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(Self::Gauge),
            "counter" => Ok(Self::Counter),
            other => Err(MetricError::InvalidKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// A metric value tagged with its kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    /// Gauge snapshot.
    Gauge(f64),
    /// Counter delta or accumulated total.
    Counter(i64),
}

impl MetricValue {
    /// Returns the kind of this value.
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Counter(_) => MetricKind::Counter,
        }
    }

    /// Parses a textual value as the numeric type of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricError::InvalidValue`] if the text does not parse.
    pub fn parse(kind: MetricKind, text: &str) -> Result<Self, MetricError> {
        let invalid = || MetricError::InvalidValue {
            kind: kind.as_str(),
            value: text.to_string(),
        };
        match kind {
            MetricKind::Gauge => match text.parse::<f64>() {
                Ok(value) if value.is_finite() => Ok(Self::Gauge(value)),
                _ => Err(invalid()),
            },
            MetricKind::Counter => text.parse().map(Self::Counter).map_err(|_| invalid()),
        }
    }

    /// Checks that the value can be stored.
    ///
    /// Gauges must be finite: NaN and infinities have no JSON or SQL
    /// representation that reads back as the same number.
    ///
    /// # Errors
    ///
    /// Returns [`MetricError::InvalidValue`] for a non-finite gauge.
    pub fn validate(&self) -> Result<(), MetricError> {
        match *self {
            Self::Gauge(value) if !value.is_finite() => Err(MetricError::InvalidValue {
                kind: MetricKind::Gauge.as_str(),
                value: value.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Applies `update` to this stored value.
    ///
    /// A gauge is replaced, a counter is incremented by the update's delta.
    /// Returns `false` and leaves `self` untouched if the kinds differ.
    pub fn merge(&mut self, update: MetricValue) -> bool {
        match (self, update) {
            (Self::Gauge(stored), Self::Gauge(value)) => {
                *stored = value;
                true
            }
            (Self::Counter(stored), Self::Counter(delta)) => {
                *stored = stored.wrapping_add(delta);
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gauge(value) => write!(f, "{value}"),
            Self::Counter(delta) => write!(f, "{delta}"),
        }
    }
}

/// A named metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MetricRecord", into = "MetricRecord")]
pub struct Metric {
    /// The metric name.
    pub id: String,
    /// The kind-tagged value.
    pub value: MetricValue,
}

impl Metric {
    /// Creates a gauge metric.
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Gauge(value),
        }
    }

    /// Creates a counter metric.
    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Counter(delta),
        }
    }

    /// Returns the kind of this metric.
    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Returns `true` if this metric has the given identity.
    pub fn is(&self, id: &str, kind: MetricKind) -> bool {
        self.id == id && self.kind() == kind
    }

    /// Checks every metric of a batch with [`MetricValue::validate`].
    ///
    /// # Errors
    ///
    /// Returns the first invalid value.
    pub fn validate_all(metrics: &[Metric]) -> Result<(), MetricError> {
        metrics.iter().try_for_each(|m| m.value.validate())
    }
}

/// Serialized shape of a [`Metric`].
#[derive(Serialize, Deserialize)]
struct MetricRecord {
    id: String,
    #[serde(rename = "type")]
    kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
}

impl TryFrom<MetricRecord> for Metric {
    type Error = MetricError;

    fn try_from(record: MetricRecord) -> Result<Self, Self::Error> {
        let value = match (record.kind, record.value, record.delta) {
            (MetricKind::Gauge, Some(value), _) => MetricValue::Gauge(value),
            (MetricKind::Counter, _, Some(delta)) => MetricValue::Counter(delta),
            (kind, _, _) => {
                return Err(MetricError::MissingValue {
                    id: record.id,
                    kind: kind.as_str(),
                    field: match kind {
                        MetricKind::Gauge => "value",
                        MetricKind::Counter => "delta",
                    },
                });
            }
        };
        value.validate()?;
        Ok(Self {
            id: record.id,
            value,
        })
    }
}

impl From<Metric> for MetricRecord {
    fn from(metric: Metric) -> Self {
        let (value, delta) = match metric.value {
            MetricValue::Gauge(value) => (Some(value), None),
            MetricValue::Counter(delta) => (None, Some(delta)),
        };
        Self {
            id: metric.id,
            kind: metric.value.kind(),
            delta,
            value,
        }
    }
}
