use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// External "set schedule" command. The zone is named by `area_id`, or by
/// `area_name` (case-insensitive) when no id is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_name: Option<String>,
    pub target: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_at: Option<DateTime<Utc>>,
}

impl ScheduleRequest {
    pub fn for_area(area_id: impl Into<String>, target: f64) -> Self {
        Self {
            area_id: Some(area_id.into()),
            area_name: None,
            target,
            effective_at: None,
        }
    }

    pub fn for_area_name(area_name: impl Into<String>, target: f64) -> Self {
        Self {
            area_id: None,
            area_name: Some(area_name.into()),
            target,
            effective_at: None,
        }
    }

    pub fn effective_at(mut self, at: DateTime<Utc>) -> Self {
        self.effective_at = Some(at);
        self
    }

    /// Parse a loosely typed payload. Malformed payloads are dropped.
    pub fn from_value(value: Value) -> Option<Self> {
        match serde_json::from_value::<Self>(value) {
            Ok(request) if request.target.is_finite() => Some(request),
            Ok(request) => {
                debug!(target = request.target, "schedule request with non-finite target ignored");
                None
            }
            Err(e) => {
                debug!(error = %e, "malformed schedule request ignored");
                None
            }
        }
    }
}

/// A calendar lookup result: the target of the current event, or of the next
/// one and when it starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalendarDecision {
    pub target: f64,
    pub start: DateTime<Utc>,
    pub is_active: bool,
}

impl CalendarDecision {
    pub fn signature(&self) -> (DateTime<Utc>, f64) {
        (self.start, self.target)
    }
}

/// De-duplicates upcoming calendar events so the same event is not scheduled
/// twice, and so an event the user has overridden is not re-applied.
#[derive(Debug, Clone, Default)]
pub struct ScheduleSignatures {
    last: Option<(DateTime<Utc>, f64)>,
    suppressed: Option<(DateTime<Utc>, f64)>,
}

impl ScheduleSignatures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop re-applying the most recently accepted event.
    pub fn suppress_last(&mut self) {
        if let Some(last) = self.last {
            self.suppressed = Some(last);
        }
    }

    /// Accept an upcoming event unless it is the last accepted or the
    /// suppressed one.
    pub fn accept(&mut self, decision: &CalendarDecision) -> bool {
        let signature = decision.signature();
        if self.suppressed == Some(signature) || self.last == Some(signature) {
            return false;
        }
        self.last = Some(signature);
        true
    }

    pub fn last(&self) -> Option<(DateTime<Utc>, f64)> {
        self.last
    }
}
