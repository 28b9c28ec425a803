//! Task aggregate model.
//!
//! A [`Task`] is the record built by merging all events sharing one task id.
//! It is created and updated by the bulk persistence engine and deleted by
//! the index lifecycle manager (after migration) or the expiration sweeper.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Status of a task aggregate.
///
/// The `Partial*` states record a transition that was observed before the
/// matching start event arrived; they are non-terminal and eligible for
/// migration across an index rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Started but no terminal event merged yet.
    Unterminated,
    /// Terminated successfully.
    Success,
    /// Terminated with an error.
    Error,
    /// Success observed without a start.
    PartialSuccess,
    /// Error observed without a start.
    PartialError,
    /// Only info events observed so far.
    PartialInfoOnly,
    /// Conflicting events merged (e.g. a duplicate start).
    Corrupted,
}

impl TaskStatus {
    /// The non-terminal statuses swept forward on index rollover.
    pub const PARTIAL_SET: [TaskStatus; 4] = [
        TaskStatus::Unterminated,
        TaskStatus::PartialSuccess,
        TaskStatus::PartialError,
        TaskStatus::PartialInfoOnly,
    ];

    /// Whether a task in this status still awaits its terminal event.
    pub fn is_partial(&self) -> bool {
        Self::PARTIAL_SET.contains(self)
    }
}

/// Retention metadata stored under the task document's `meta` field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMeta {
    /// TTL instant; the expiration sweeper deletes the document once this
    /// has passed, regardless of status.
    #[serde(
        rename = "dateToDelete",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub date_to_delete: Option<DateTime<Utc>>,
}

/// Aggregate trace record for one logical unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parents_path: Option<Vec<String>>,
    /// True while the task has a parent id that has not been resolved to a
    /// known ancestor chain.
    #[serde(default)]
    pub orphan: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between start and end, once both are known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<BTreeMap<String, serde_json::Number>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(default)]
    pub meta: TaskMeta,
}

impl Task {
    /// Builds a fresh task from the first event observed for its id.
    ///
    /// `retention_days` seeds the TTL instant relative to the event time.
    pub fn from_event(event: &Event, retention_days: i64) -> Self {
        let data = event.data();
        let mut task = Self {
            status: event.status_from_existing(None),
            name: data.name_from_id().map(str::to_string),
            primary_id: data.primary_id.clone(),
            parent_id: data.parent_id.clone(),
            parents_path: data.parents_path.clone(),
            orphan: data.parent_id.is_some() && data.parents_path.is_none(),
            start_time: event.is_start_event().then_some(data.time),
            end_time: event.end_time(),
            duration_ms: None,
            ctx: data.context.clone(),
            string: data.strings.clone(),
            text: data.texts.clone(),
            metric: data.metrics.clone(),
            log: data.logs.clone(),
            env: data.env.clone(),
            meta: TaskMeta {
                date_to_delete: Some(data.time + Duration::days(retention_days)),
            },
        };
        task.update_duration();
        task
    }

    /// Merges a later event for the same task id into this aggregate.
    ///
    /// Attribute maps merge key-wise (later events win per key), logs append
    /// in arrival order, and the status follows the event's transition rule.
    pub fn apply_event(&mut self, event: &Event) {
        let data = event.data();
        self.status = event.status_from_existing(Some(self.status));

        if event.is_start_event() {
            self.start_time = Some(data.time);
            if self.primary_id.is_none() {
                self.primary_id = data.primary_id.clone();
            }
        }
        if let Some(end) = event.end_time() {
            self.end_time = Some(end);
        }
        if self.name.is_none() {
            self.name = data.name_from_id().map(str::to_string);
        }
        if self.parent_id.is_none() {
            self.parent_id = data.parent_id.clone();
        }
        // Ancestry resolution clears the orphan flag retroactively.
        if let Some(path) = &data.parents_path {
            self.parents_path = Some(path.clone());
            self.orphan = false;
        } else {
            self.orphan = self.parent_id.is_some() && self.parents_path.is_none();
        }
        if self.env.is_none() {
            self.env = data.env.clone();
        }

        merge_map(&mut self.ctx, &data.context);
        merge_map(&mut self.string, &data.strings);
        merge_map(&mut self.text, &data.texts);
        merge_map(&mut self.metric, &data.metrics);
        if let Some(logs) = &data.logs {
            self.log.get_or_insert_with(Vec::new).extend(logs.iter().cloned());
        }

        self.update_duration();
    }

    fn update_duration(&mut self) {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            self.duration_ms = Some((end - start).num_milliseconds());
        }
    }
}

fn merge_map<V: Clone>(
    target: &mut Option<BTreeMap<String, V>>,
    incoming: &Option<BTreeMap<String, V>>,
) {
    if let Some(incoming) = incoming {
        let target = target.get_or_insert_with(BTreeMap::new);
        for (key, value) in incoming {
            target.insert(key.clone(), value.clone());
        }
    }
}
