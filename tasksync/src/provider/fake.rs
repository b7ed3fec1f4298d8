use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use super::{PriorityScale, ProviderAdapter, ProviderError};
use crate::model::{DEFAULT_PROJECT, ExternalItem, Provider, Task};

const PRIORITY: PriorityScale = PriorityScale::new(4);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Authenticate,
    Fetch { full: bool },
    Create(String),
    Update(String),
    Delete(String),
    Verify(String),
}

#[derive(Default)]
struct FakeState {
    items: BTreeMap<String, ExternalItem>,
    next_id: u64,
    calls: Vec<Call>,
    unavailable: u32,
    reject_auth: bool,
    rejected_titles: HashSet<String>,
    latency: Option<Duration>,
}

/// In-memory provider with a lossless mapping. Remote state is edited
/// directly by tests between passes.
#[derive(Default)]
pub(crate) struct FakeAdapter {
    state: Mutex<FakeState>,
}

impl FakeAdapter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn insert_remote(&self, id: &str, title: &str) -> ExternalItem {
        let item = ExternalItem {
            external_id: id.to_string(),
            provider: Provider::Todoist,
            title: title.to_string(),
            description: String::new(),
            due: None,
            priority: PRIORITY.to_provider(Default::default()),
            labels: Vec::new(),
            project: Some(DEFAULT_PROJECT.to_string()),
            completed: false,
            modified: Some(OffsetDateTime::now_utc()),
            raw: serde_json::Value::Null,
        };
        self.state().items.insert(id.to_string(), item.clone());
        item
    }

    /// Stamps the item as modified now, then applies `edit`.
    pub(crate) fn edit_remote(&self, id: &str, edit: impl FnOnce(&mut ExternalItem)) {
        let mut state = self.state();
        let item = state.items.get_mut(id).expect("remote item exists");
        item.modified = Some(OffsetDateTime::now_utc());
        edit(item);
    }

    pub(crate) fn remove_remote(&self, id: &str) {
        self.state().items.remove(id);
    }

    pub(crate) fn remote(&self, id: &str) -> Option<ExternalItem> {
        self.state().items.get(id).cloned()
    }

    pub(crate) fn remote_items(&self) -> Vec<ExternalItem> {
        self.state().items.values().cloned().collect()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub(crate) fn write_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Create(_) | Call::Update(_) | Call::Delete(_)))
            .count()
    }

    /// The next `count` calls fail as if the service were down.
    pub(crate) fn fail_unavailable(&self, count: u32) {
        self.state().unavailable = count;
    }

    pub(crate) fn reject_auth(&self) {
        self.state().reject_auth = true;
    }

    pub(crate) fn reject_title(&self, title: &str) {
        self.state().rejected_titles.insert(title.to_string());
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    async fn enter(&self, call: Call) -> Result<(), ProviderError> {
        let latency = {
            let mut state = self.state();
            state.calls.push(call);
            if state.unavailable > 0 {
                state.unavailable -= 1;
                return Err(ProviderError::Unavailable("fake outage".into()));
            }
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn check_title(&self, task: &Task) -> Result<(), ProviderError> {
        if self.state().rejected_titles.contains(&task.text) {
            return Err(ProviderError::Provider(format!("rejected {:?}", task.text)));
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn provider(&self) -> Provider {
        Provider::Todoist
    }

    async fn authenticate(&self) -> Result<bool, ProviderError> {
        self.enter(Call::Authenticate).await?;
        if self.state().reject_auth {
            return Err(ProviderError::Authentication("token revoked".into()));
        }
        Ok(true)
    }

    async fn fetch_items(
        &self,
        since: Option<OffsetDateTime>,
    ) -> Result<Vec<ExternalItem>, ProviderError> {
        self.enter(Call::Fetch {
            full: since.is_none(),
        })
        .await?;
        let state = self.state();
        Ok(state
            .items
            .values()
            .filter(|item| match (since, item.modified) {
                (Some(since), Some(modified)) => modified >= since,
                _ => true,
            })
            .cloned()
            .collect())
    }

    async fn create_item(&self, task: &Task) -> Result<String, ProviderError> {
        self.enter(Call::Create(task.text.clone())).await?;
        self.check_title(task)?;
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("r{}", state.next_id);
        let mut item = self.map_to_external(task);
        item.external_id = id.clone();
        item.modified = Some(OffsetDateTime::now_utc());
        state.items.insert(id.clone(), item);
        Ok(id)
    }

    async fn update_item(&self, external_id: &str, task: &Task) -> Result<bool, ProviderError> {
        self.enter(Call::Update(external_id.to_string())).await?;
        self.check_title(task)?;
        let mut item = self.map_to_external(task);
        let mut state = self.state();
        let Some(existing) = state.items.get_mut(external_id) else {
            return Ok(false);
        };
        item.external_id = external_id.to_string();
        item.modified = Some(OffsetDateTime::now_utc());
        *existing = item;
        Ok(true)
    }

    async fn delete_item(&self, external_id: &str) -> Result<bool, ProviderError> {
        self.enter(Call::Delete(external_id.to_string())).await?;
        self.state().items.remove(external_id);
        Ok(true)
    }

    async fn verify_item_exists(&self, external_id: &str) -> Result<bool, ProviderError> {
        self.enter(Call::Verify(external_id.to_string())).await?;
        Ok(self.state().items.contains_key(external_id))
    }

    fn map_to_external(&self, task: &Task) -> ExternalItem {
        ExternalItem {
            external_id: String::new(),
            provider: Provider::Todoist,
            title: task.text.clone(),
            description: task.description.clone(),
            due: task.due,
            priority: PRIORITY.to_provider(task.priority),
            labels: task.tags.clone(),
            project: Some(task.project.clone()),
            completed: task.completed,
            modified: Some(task.modified),
            raw: serde_json::Value::Null,
        }
    }

    fn map_from_external(&self, item: &ExternalItem) -> Task {
        let mut task = Task::new(0, item.title.clone());
        task.description = item.description.clone();
        task.due = item.due;
        task.priority = PRIORITY.to_local(item.priority);
        task.tags = item.labels.clone();
        task.project = item
            .project
            .clone()
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string());
        task.completed = item.completed;
        task.modified = item.modified.unwrap_or(OffsetDateTime::UNIX_EPOCH);
        task
    }
}
