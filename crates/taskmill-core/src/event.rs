//! Lifecycle event model.
//!
//! An [`Event`] is one lifecycle transition contributed toward a task. Events
//! are immutable once constructed: the pipeline only copies and trims them,
//! never mutates them in place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskStatus;

/// Separates the logical name from the random part of a generated task id.
pub const TASK_ID_DELIMITER: &str = "___";

/// Common payload shared by every event variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    /// Id of the task this event belongs to.
    pub task_id: String,
    /// Id of the root task of the trace, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_id: Option<String>,
    /// Id of the direct parent task. `None` means orphan-until-resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Logical name of the unit of work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Creation timestamp.
    pub time: DateTime<Utc>,
    /// Exact-match (non-analyzed) attributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strings: Option<BTreeMap<String, String>>,
    /// Free-text (analyzed) attributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texts: Option<BTreeMap<String, String>>,
    /// Trace-scoped context attributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, String>>,
    /// Numeric measurements. Values stay as raw JSON numbers so the reader
    /// side can repair their integer/float representation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, serde_json::Number>>,
    /// Ordered log lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
    /// Ordered ancestor chain, once ancestry has been resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parents_path: Option<Vec<String>>,
    /// Tenant/environment tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

impl EventData {
    /// Creates an event payload for the given task.
    ///
    /// When `task_id` is `None` a new id is generated from `name` as
    /// `<name>___<uuid>`.
    pub fn new(task_id: Option<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let task_id = task_id.unwrap_or_else(|| generate_task_id(&name));
        Self {
            task_id,
            primary_id: None,
            parent_id: None,
            name: Some(name),
            time: Utc::now(),
            strings: None,
            texts: None,
            context: None,
            metrics: None,
            logs: None,
            parents_path: None,
            env: None,
        }
    }

    /// Recovers the logical name from the task id when `name` is absent.
    pub fn name_from_id(&self) -> Option<&str> {
        match &self.name {
            Some(name) => Some(name.as_str()),
            None => self.task_id.split(TASK_ID_DELIMITER).next(),
        }
    }

    /// Character-count estimate of the encoded payload, used for batch
    /// sizing. A threshold check, not a wire-exact measure.
    pub fn estimated_size(&self) -> usize {
        fn map_size(map: &Option<BTreeMap<String, String>>) -> usize {
            map.iter()
                .flatten()
                .map(|(k, v)| k.len() + v.len())
                .sum()
        }
        let mut size = self.task_id.len();
        size += self.name.as_deref().map_or(0, str::len);
        size += self.primary_id.as_deref().map_or(0, str::len);
        size += self.parent_id.as_deref().map_or(0, str::len);
        size += map_size(&self.strings);
        size += map_size(&self.texts);
        size += map_size(&self.context);
        size += self
            .metrics
            .iter()
            .flatten()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum::<usize>();
        size += self.logs.iter().flatten().map(String::len).sum::<usize>();
        size
    }
}

/// Payload of a spot event: a self-contained trace point that starts and
/// terminates its task in one shot, carrying the terminal status explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotData {
    #[serde(flatten)]
    pub data: EventData,
    pub status: TaskStatus,
}

/// One lifecycle transition for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The task began.
    Start(EventData),
    /// Progress information for a running task.
    Info(EventData),
    /// The task terminated successfully.
    Success(EventData),
    /// The task terminated with an error.
    Error(EventData),
    /// A one-shot task that starts and terminates at once.
    Spot(SpotData),
}

impl Event {
    /// Creates a start event. Start events are roots unless a parent is
    /// attached later, so `primary_id` defaults to the task's own id.
    pub fn start(task_id: Option<String>, name: impl Into<String>) -> Self {
        let mut data = EventData::new(task_id, name);
        data.primary_id = Some(data.task_id.clone());
        Event::Start(data)
    }

    /// Creates an info event.
    pub fn info(task_id: Option<String>, name: impl Into<String>) -> Self {
        Event::Info(EventData::new(task_id, name))
    }

    /// Creates a success event.
    pub fn success(task_id: Option<String>, name: impl Into<String>) -> Self {
        Event::Success(EventData::new(task_id, name))
    }

    /// Creates an error event.
    pub fn error(task_id: Option<String>, name: impl Into<String>) -> Self {
        Event::Error(EventData::new(task_id, name))
    }

    /// Creates a spot event carrying its terminal status.
    pub fn spot(task_id: Option<String>, name: impl Into<String>, status: TaskStatus) -> Self {
        let mut data = EventData::new(task_id, name);
        data.primary_id = Some(data.task_id.clone());
        Event::Spot(SpotData { data, status })
    }

    /// Shared payload of any variant.
    pub fn data(&self) -> &EventData {
        match self {
            Event::Start(data)
            | Event::Info(data)
            | Event::Success(data)
            | Event::Error(data) => data,
            Event::Spot(spot) => &spot.data,
        }
    }

    /// Mutable access to the shared payload.
    pub fn data_mut(&mut self) -> &mut EventData {
        match self {
            Event::Start(data)
            | Event::Info(data)
            | Event::Success(data)
            | Event::Error(data) => data,
            Event::Spot(spot) => &mut spot.data,
        }
    }

    /// Id of the task this event belongs to.
    pub fn task_id(&self) -> &str {
        &self.data().task_id
    }

    /// Whether this event establishes the task (start or spot).
    pub fn is_start_event(&self) -> bool {
        matches!(self, Event::Start(_) | Event::Spot(_))
    }

    /// Termination timestamp contributed by this event, if any.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Event::Success(data) | Event::Error(data) => Some(data.time),
            Event::Spot(spot) => Some(spot.data.time),
            Event::Start(_) | Event::Info(_) => None,
        }
    }

    /// Derives the task status that results from merging this event into a
    /// task currently holding `existing` (or no task at all).
    ///
    /// A "partial" status records a transition observed before the matching
    /// start event arrived; the start event later upgrades it.
    pub fn status_from_existing(&self, existing: Option<TaskStatus>) -> TaskStatus {
        use TaskStatus::*;
        match self {
            Event::Start(_) => match existing {
                None => Unterminated,
                Some(PartialSuccess) => Success,
                Some(PartialError) => Error,
                Some(PartialInfoOnly) => Unterminated,
                // A second start for a task that already started.
                Some(Unterminated) => Corrupted,
                Some(terminal) => terminal,
            },
            Event::Info(_) => existing.unwrap_or(PartialInfoOnly),
            Event::Success(_) => match existing {
                Some(Unterminated) => Success,
                None | Some(PartialInfoOnly) => PartialSuccess,
                Some(other) => other,
            },
            Event::Error(_) => match existing {
                Some(Unterminated) => Error,
                None | Some(PartialInfoOnly) => PartialError,
                // A late error overrides an observed success.
                Some(Success) | Some(PartialSuccess) => Error,
                Some(other) => other,
            },
            Event::Spot(spot) => spot.status,
        }
    }

    /// Character-count estimate for batch sizing.
    pub fn estimated_size(&self) -> usize {
        self.data().estimated_size()
    }
}

/// A finite, immutable batch of events: the unit of network transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsWrapper {
    pub events: Vec<Event>,
}

impl EventsWrapper {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Generates a fresh task id as `<name>___<uuid>` (dashes replaced with
/// underscores so the id splits cleanly on the delimiter).
pub fn generate_task_id(name: &str) -> String {
    let uuid = Uuid::new_v4().to_string().replace('-', "_");
    format!("{name}{TASK_ID_DELIMITER}{uuid}")
}
