use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::types::{EventId, StreamId, Tracking};

/// Metadata for a file attached to an event. The file body lives in the
/// file store under the attachment id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

/// A time-stamped datum belonging to one or more streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub stream_ids: Vec<StreamId>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_data: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub trashed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    /// Set on heads kept after deletion in `keep-everything` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<f64>,
    /// Links a history entry to its head; absent on heads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_id: Option<EventId>,
    #[serde(flatten)]
    pub tracking: Tracking,
}

impl Event {
    /// Validate invariants that need no store context: a non-empty stream id
    /// set with at least one non-system member, a non-empty type, and a
    /// duration that only makes sense as a span.
    pub fn validate_shape(&self) -> Result<(), ApiError> {
        if self.stream_ids.is_empty() {
            return Err(ApiError::invalid_parameters_format(
                "Event must reference at least one stream",
            ));
        }
        if self.stream_ids.iter().all(StreamId::is_system) {
            return Err(ApiError::invalid_operation(
                "Event must reference at least one non-system stream",
            ));
        }
        if self.event_type.is_empty() {
            return Err(ApiError::invalid_parameters_format(
                "Event type must not be empty",
            ));
        }
        if let Some(d) = self.duration
            && d < 0.0
        {
            return Err(ApiError::invalid_parameters_format(
                "Event duration must not be negative",
            ));
        }
        Ok(())
    }

    /// Whether this event carries a duration (spans overlap-check territory
    /// on `singleActivity` streams).
    #[must_use]
    pub fn has_duration(&self) -> bool {
        self.duration.is_some()
    }

    /// The end of this event's span; equal to `time` for point events.
    #[must_use]
    pub fn end_time(&self) -> f64 {
        self.time + self.duration.unwrap_or(0.0)
    }

    /// Whether two duration-bearing events overlap in time.
    #[must_use]
    pub fn overlaps(&self, other: &Event) -> bool {
        self.has_duration()
            && other.has_duration()
            && self.time < other.end_time()
            && other.time < self.end_time()
    }
}

/// Tombstone left where a deleted event head used to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDeletion {
    pub id: EventId,
    pub deleted: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<crate::types::AccessId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccessId;

    pub(crate) fn event(streams: &[&str], time: f64, duration: Option<f64>) -> Event {
        Event {
            id: EventId::new("e1"),
            stream_ids: streams.iter().map(|s| StreamId::from(*s)).collect(),
            event_type: "activity/plain".to_owned(),
            time,
            duration,
            content: None,
            attachments: Vec::new(),
            tags: Vec::new(),
            client_data: None,
            trashed: false,
            integrity: None,
            deleted: None,
            head_id: None,
            tracking: Tracking::init(time, &AccessId::new("test")),
        }
    }

    #[test]
    fn empty_stream_ids_rejected() {
        let e = event(&[], 10.0, None);
        assert_eq!(e.validate_shape().unwrap_err().http_status(), 400);
    }

    #[test]
    fn all_system_stream_ids_rejected() {
        let e = event(&[":_system:email", ":system:language"], 10.0, None);
        assert!(e.validate_shape().is_err());
        let ok = event(&[":system:language", "diary"], 10.0, None);
        assert!(ok.validate_shape().is_ok());
    }

    #[test]
    fn overlap_requires_duration_on_both() {
        let a = event(&["x"], 10.0, Some(5.0));
        let b = event(&["x"], 12.0, Some(5.0));
        let point = event(&["x"], 12.0, None);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&point));
    }

    #[test]
    fn adjacent_spans_do_not_overlap() {
        let a = event(&["x"], 10.0, Some(5.0));
        let b = event(&["x"], 15.0, Some(5.0));
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn serde_omits_empty_optionals() {
        let e = event(&["x"], 10.0, None);
        let json = serde_json::to_value(&e).unwrap();
        assert!(json.get("duration").is_none());
        assert!(json.get("attachments").is_none());
        assert!(json.get("trashed").is_none());
        assert_eq!(json["type"], "activity/plain");
        assert_eq!(json["streamIds"][0], "x");
    }
}
