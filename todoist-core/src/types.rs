use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A task as returned by either the REST API or the Sync API.
///
/// The two APIs disagree on a few field names (`is_completed` vs `checked`),
/// so both are accepted. Fields this crate does not model are kept in
/// `extra` and serialized back unchanged.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TodoistTask {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub due: Option<Due>,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub added_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TodoistTask {
    pub fn completed(&self) -> bool {
        self.is_completed || self.checked
    }

    /// Most recent timestamp the payload carries, as sent by the API.
    pub fn last_modified(&self) -> Option<&str> {
        self.updated_at
            .as_deref()
            .or(self.added_at.as_deref())
            .or(self.created_at.as_deref())
    }
}

fn default_priority() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Due {
    pub date: String,
    #[serde(default)]
    pub datetime: Option<String>,
    #[serde(default)]
    pub string: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub is_recurring: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_inbox_project: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct SyncResponse {
    pub sync_token: String,
    #[serde(default)]
    pub full_sync: bool,
    #[serde(default)]
    pub items: Vec<TodoistTask>,
    #[serde(default)]
    pub projects: Vec<Project>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct NewTask {
    pub content: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_datetime: Option<String>,
}

/// Body of a REST task update. Every synced field is always sent so the
/// update fully replaces the remote values; `due_string = "no date"` clears
/// the due date.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TaskUpdate {
    pub content: String,
    pub description: String,
    pub labels: Vec<String>,
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_datetime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_string: Option<String>,
}
