//! Events produced by connectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ResourceId;

/// An occurrence reported by a connector for a job's trigger.
///
/// Connectors insert events unprocessed; the event processor reads each one
/// exactly once and marks it processed whether or not it started a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: ResourceId,
    pub project_id: ResourceId,
    pub job_id: Option<ResourceId>,
    pub creation_time: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
    pub connector: String,
    pub name: String,
    pub data: Value,
    pub processed: bool,
    /// Set on replayed copies of an event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_event_id: Option<ResourceId>,
}

impl Event {
    pub fn new(
        project_id: ResourceId,
        job_id: ResourceId,
        connector: impl Into<String>,
        name: impl Into<String>,
        data: Value,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            project_id,
            job_id: Some(job_id),
            creation_time: Utc::now(),
            event_time,
            connector: connector.into(),
            name: name.into(),
            data,
            processed: false,
            original_event_id: None,
        }
    }

    /// An unprocessed copy of this event pointing back at the original.
    pub fn replay(&self, now: DateTime<Utc>) -> Self {
        Self {
            id: ResourceId::new(),
            creation_time: now,
            processed: false,
            original_event_id: Some(self.original_event_id.unwrap_or(self.id)),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_replay_points_at_the_first_event() {
        let mut event = Event::new(
            ResourceId::new(),
            ResourceId::new(),
            "github",
            "push",
            json!({"ref": "main"}),
            Utc::now(),
        );
        event.processed = true;

        let replay = event.replay(Utc::now());
        assert_ne!(replay.id, event.id);
        assert!(!replay.processed);
        assert_eq!(replay.original_event_id, Some(event.id));
        assert_eq!(replay.event_time, event.event_time);
        assert_eq!(replay.data, event.data);

        let second = replay.replay(Utc::now());
        assert_eq!(second.original_event_id, Some(event.id));
    }
}
