use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub type TaskId = i64;

pub const DEFAULT_PROJECT: &str = "inbox";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Todoist,
    AppleReminders,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Todoist, Provider::AppleReminders];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Todoist => "todoist",
            Provider::AppleReminders => "apple_reminders",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownVariant> {
        match value {
            "todoist" => Ok(Provider::Todoist),
            "apple_reminders" => Ok(Provider::AppleReminders),
            other => Err(UnknownVariant::new("provider", other)),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Zero-based rank, least urgent first.
    pub fn rank(&self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

/// A locally stored task.
///
/// `notes` and `time_spent` are local-only and never leave the machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due: Option<OffsetDateTime>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub time_spent: u32,
}

fn default_project() -> String {
    DEFAULT_PROJECT.to_string()
}

impl Task {
    pub fn new(id: TaskId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            description: String::new(),
            due: None,
            priority: Priority::default(),
            tags: Vec::new(),
            project: default_project(),
            completed: false,
            modified: OffsetDateTime::now_utc(),
            notes: Vec::new(),
            time_spent: 0,
        }
    }

    pub fn sync_fields(&self) -> SyncFields {
        SyncFields {
            text: self.text.clone(),
            description: self.description.clone(),
            due: self.due,
            priority: self.priority,
            tags: self.tags.iter().cloned().collect(),
            project: self.project.clone(),
            completed: self.completed,
        }
    }

    /// Overwrites the synchronizable fields, leaving id and local-only
    /// fields untouched.
    pub fn apply_fields(&mut self, fields: &SyncFields) {
        self.text = fields.text.clone();
        self.description = fields.description.clone();
        self.due = fields.due;
        self.priority = fields.priority;
        self.tags = fields.tags.iter().cloned().collect();
        self.project = fields.project.clone();
        self.completed = fields.completed;
    }
}

/// The subset of a task that participates in sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFields {
    pub text: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due: Option<OffsetDateTime>,
    pub priority: Priority,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub project: String,
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncField {
    Text,
    Description,
    Due,
    Priority,
    Tags,
    Project,
    Completed,
}

impl SyncField {
    pub const ALL: [SyncField; 7] = [
        SyncField::Text,
        SyncField::Description,
        SyncField::Due,
        SyncField::Priority,
        SyncField::Tags,
        SyncField::Project,
        SyncField::Completed,
    ];
}

impl SyncFields {
    /// Compares one field the way the hasher sees it: text is compared after
    /// whitespace normalization and due dates at second precision.
    pub fn same_field(&self, other: &Self, field: SyncField) -> bool {
        match field {
            SyncField::Text => normalize_text(&self.text) == normalize_text(&other.text),
            SyncField::Description => {
                normalize_text(&self.description) == normalize_text(&other.description)
            }
            SyncField::Due => {
                self.due.map(|d| d.unix_timestamp()) == other.due.map(|d| d.unix_timestamp())
            }
            SyncField::Priority => self.priority == other.priority,
            SyncField::Tags => self.tags == other.tags,
            SyncField::Project => self.project == other.project,
            SyncField::Completed => self.completed == other.completed,
        }
    }

    pub fn copy_field(&mut self, from: &Self, field: SyncField) {
        match field {
            SyncField::Text => self.text = from.text.clone(),
            SyncField::Description => self.description = from.description.clone(),
            SyncField::Due => self.due = from.due,
            SyncField::Priority => self.priority = from.priority,
            SyncField::Tags => self.tags = from.tags.clone(),
            SyncField::Project => self.project = from.project.clone(),
            SyncField::Completed => self.completed = from.completed,
        }
    }
}

/// Collapses runs of whitespace and trims both ends.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A task as materialized by a provider during one sync pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalItem {
    pub external_id: String,
    pub provider: Provider,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due: Option<OffsetDateTime>,
    /// Priority on the provider's own scale.
    pub priority: u8,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub modified: Option<OffsetDateTime>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncMapping {
    pub provider: Provider,
    pub local_id: TaskId,
    pub external_id: String,
    pub local_hash: String,
    pub remote_hash: String,
    /// Fields both sides agreed on at `last_synced`.
    pub snapshot: Option<SyncFields>,
    pub last_synced: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub sync_count: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    Bidirectional,
    PushOnly,
    PullOnly,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Bidirectional => "bidirectional",
            SyncDirection::PushOnly => "push_only",
            SyncDirection::PullOnly => "pull_only",
        }
    }

    pub fn allows_push(&self) -> bool {
        !matches!(self, SyncDirection::PullOnly)
    }

    pub fn allows_pull(&self) -> bool {
        !matches!(self, SyncDirection::PushOnly)
    }
}
