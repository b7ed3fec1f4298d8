use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use time::format_description::FormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::{format_description, time};
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use todoist_core::{
    ApiErrorClass, Due, NewTask, Project, TaskUpdate, TodoistClient, TodoistError, TodoistTask,
};
use tokio::sync::{Mutex, RwLock};

use super::{Pacer, PriorityScale, ProviderAdapter, ProviderError};
use crate::config::ProviderConfig;
use crate::hasher::hash_fields;
use crate::model::{DEFAULT_PROJECT, ExternalItem, Provider, Task};
use crate::storage::CredentialStore;

pub const TOKEN_KEY: &str = "api_token";
pub const TOKEN_ENV: &str = "TODOIST_API_TOKEN";
const FULL_SYNC_TOKEN: &str = "*";
const RESOURCE_TYPES: [&str; 2] = ["items", "projects"];
const CLEAR_DUE: &str = "no date";
/// Todoist uses 1 (normal) to 4 (urgent), one step per local level.
const PRIORITY: PriorityScale = PriorityScale::new(4);
/// All-day due dates are represented locally at this UTC time.
const END_OF_DAY: Time = time!(23:59:59);
const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const FLOATING_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

impl From<TodoistError> for ProviderError {
    fn from(err: TodoistError) -> Self {
        match err.classification() {
            Some(ApiErrorClass::Auth) => ProviderError::Authentication(err.to_string()),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient) => {
                ProviderError::Unavailable(err.to_string())
            }
            Some(ApiErrorClass::Permanent) => ProviderError::Provider(err.to_string()),
            None => match &err {
                TodoistError::Request(inner) if !inner.is_decode() => {
                    ProviderError::Unavailable(err.to_string())
                }
                _ => ProviderError::Provider(err.to_string()),
            },
        }
    }
}

#[derive(Default)]
struct ProjectCache {
    by_id: HashMap<String, Project>,
}

impl ProjectCache {
    fn merge(&mut self, projects: Vec<Project>) {
        for project in projects {
            if project.is_deleted {
                self.by_id.remove(&project.id);
            } else {
                self.by_id.insert(project.id.clone(), project);
            }
        }
    }

    fn inbox(&self) -> Option<&Project> {
        self.by_id.values().find(|project| project.is_inbox_project)
    }

    fn find_by_name(&self, name: &str) -> Option<&Project> {
        self.by_id
            .values()
            .find(|project| !project.is_inbox_project && project.name.eq_ignore_ascii_case(name))
    }
}

/// Reference adapter for Todoist.
///
/// Reads go through the Sync API so later passes can ask for changes only;
/// writes go through the REST API. The incremental sync token lives in
/// memory, so the first pass of a process always fetches everything.
///
/// Unless `sync_completed_tasks` is set, completed items are left out of
/// every fetch. Their ids are remembered so they still count as existing.
pub struct TodoistAdapter {
    credentials: Arc<dyn CredentialStore>,
    base_url: Option<String>,
    project_mappings: BTreeMap<String, String>,
    include_completed: bool,
    pacer: Pacer,
    client: RwLock<Option<TodoistClient>>,
    sync_token: Mutex<Option<String>>,
    projects: RwLock<ProjectCache>,
    completed_ids: Mutex<HashSet<String>>,
}

impl TodoistAdapter {
    pub fn new(settings: &ProviderConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            credentials,
            base_url: settings.base_url.clone(),
            project_mappings: settings.project_mappings.clone(),
            include_completed: settings.sync_completed_tasks,
            pacer: Pacer::new(settings.rate_limit_delay()),
            client: RwLock::new(None),
            sync_token: Mutex::new(None),
            projects: RwLock::new(ProjectCache::default()),
            completed_ids: Mutex::new(HashSet::new()),
        }
    }

    fn resolve_token(&self) -> Result<String, ProviderError> {
        if let Ok(token) = std::env::var(TOKEN_ENV)
            && !token.trim().is_empty()
        {
            return Ok(token);
        }
        self.credentials
            .get(Provider::Todoist, TOKEN_KEY)?
            .ok_or_else(|| ProviderError::Authentication("no Todoist API token stored".into()))
    }

    async fn client(&self) -> Result<TodoistClient, ProviderError> {
        if let Some(client) = self.client.read().await.as_ref() {
            return Ok(client.clone());
        }
        self.authenticate().await?;
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| ProviderError::Authentication("client not initialized".into()))
    }

    fn is_hidden_completed(&self, task: &TodoistTask) -> bool {
        !self.include_completed && !task.is_deleted && task.completed()
    }

    fn local_project_name(&self, cache: &ProjectCache, project_id: Option<&str>) -> String {
        let Some(project_id) = project_id else {
            return DEFAULT_PROJECT.to_string();
        };
        if let Some((local, _)) = self
            .project_mappings
            .iter()
            .find(|(_, remote)| remote.as_str() == project_id)
        {
            return local.clone();
        }
        match cache.by_id.get(project_id) {
            Some(project) if !project.is_inbox_project => project.name.clone(),
            _ => DEFAULT_PROJECT.to_string(),
        }
    }

    /// Remote project id for a local project name, creating the project when
    /// Todoist does not know it yet. `None` means the account inbox.
    async fn remote_project_id(
        &self,
        client: &TodoistClient,
        local: &str,
    ) -> Result<Option<String>, ProviderError> {
        if let Some(id) = self.project_mappings.get(local) {
            return Ok(Some(id.clone()));
        }
        {
            let cache = self.projects.read().await;
            if local.eq_ignore_ascii_case(DEFAULT_PROJECT) {
                return Ok(cache.inbox().map(|project| project.id.clone()));
            }
            if let Some(project) = cache.find_by_name(local) {
                return Ok(Some(project.id.clone()));
            }
        }
        self.pacer.wait().await;
        let project = client.create_project(local).await?;
        tracing::info!(project = %project.name, id = %project.id, "created Todoist project");
        let id = project.id.clone();
        self.projects.write().await.merge(vec![project]);
        Ok(Some(id))
    }

    fn to_external(&self, cache: &ProjectCache, task: TodoistTask) -> ExternalItem {
        let raw = serde_json::to_value(&task).unwrap_or(serde_json::Value::Null);
        ExternalItem {
            project: Some(self.local_project_name(cache, task.project_id.as_deref())),
            due: task.due.as_ref().and_then(parse_due),
            modified: task
                .last_modified()
                .and_then(|value| OffsetDateTime::parse(value, &Rfc3339).ok()),
            completed: task.completed(),
            external_id: task.id,
            provider: Provider::Todoist,
            title: task.content,
            description: task.description,
            priority: task.priority,
            labels: task.labels,
            raw,
        }
    }
}

#[async_trait]
impl ProviderAdapter for TodoistAdapter {
    fn provider(&self) -> Provider {
        Provider::Todoist
    }

    async fn authenticate(&self) -> Result<bool, ProviderError> {
        let token = self.resolve_token()?;
        let client = match &self.base_url {
            Some(base_url) => TodoistClient::with_base_url(base_url, token)?,
            None => TodoistClient::new(token)?,
        };
        self.pacer.wait().await;
        let projects = client.list_projects().await?;
        self.projects.write().await.merge(projects);
        *self.client.write().await = Some(client);
        Ok(true)
    }

    async fn fetch_items(
        &self,
        since: Option<OffsetDateTime>,
    ) -> Result<Vec<ExternalItem>, ProviderError> {
        let client = self.client().await?;
        let token = match since {
            Some(_) => self.sync_token.lock().await.clone(),
            None => None,
        }
        .unwrap_or_else(|| FULL_SYNC_TOKEN.to_string());

        self.pacer.wait().await;
        let response = client.sync(&token, &RESOURCE_TYPES).await?;
        *self.sync_token.lock().await = Some(response.sync_token.clone());

        let mut cache = self.projects.write().await;
        cache.merge(response.projects);
        let mut completed_ids = self.completed_ids.lock().await;
        if response.full_sync {
            completed_ids.clear();
        }
        let mut items = Vec::with_capacity(response.items.len());
        for task in response.items {
            if self.is_hidden_completed(&task) {
                completed_ids.insert(task.id);
                continue;
            }
            completed_ids.remove(&task.id);
            if !task.is_deleted {
                items.push(self.to_external(&cache, task));
            }
        }
        tracing::debug!(
            count = items.len(),
            hidden_completed = completed_ids.len(),
            full = response.full_sync,
            "fetched Todoist tasks"
        );
        Ok(items)
    }

    async fn create_item(&self, task: &Task) -> Result<String, ProviderError> {
        let client = self.client().await?;
        let project_id = self.remote_project_id(&client, &task.project).await?;
        let (due_date, due_datetime) = format_due(task.due)?;
        let new_task = NewTask {
            content: task.text.clone(),
            description: task.description.clone(),
            project_id,
            labels: task.tags.clone(),
            priority: PRIORITY.to_provider(task.priority),
            due_date,
            due_datetime,
        };

        self.pacer.wait().await;
        let created = client
            .create_task(&new_task, Some(&request_id(task)))
            .await?;
        if task.completed && !created.completed() {
            self.pacer.wait().await;
            client.close_task(&created.id).await?;
        }
        Ok(created.id)
    }

    async fn update_item(&self, external_id: &str, task: &Task) -> Result<bool, ProviderError> {
        let client = self.client().await?;
        let (due_date, due_datetime) = format_due(task.due)?;
        let update = TaskUpdate {
            content: task.text.clone(),
            description: task.description.clone(),
            labels: task.tags.clone(),
            priority: PRIORITY.to_provider(task.priority),
            due_date,
            due_datetime,
            due_string: task.due.is_none().then(|| CLEAR_DUE.to_string()),
        };

        self.pacer.wait().await;
        let updated = match client.update_task(external_id, &update).await {
            Ok(updated) => updated,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        if let Some(project_id) = self.remote_project_id(&client, &task.project).await?
            && updated.project_id.as_deref() != Some(project_id.as_str())
        {
            self.pacer.wait().await;
            client
                .move_task(
                    external_id,
                    &project_id,
                    &command_uuid(external_id, &project_id),
                )
                .await?;
        }

        match (task.completed, updated.completed()) {
            (true, false) => {
                self.pacer.wait().await;
                client.close_task(external_id).await?;
            }
            (false, true) => {
                self.pacer.wait().await;
                client.reopen_task(external_id).await?;
            }
            _ => {}
        }
        Ok(true)
    }

    async fn delete_item(&self, external_id: &str) -> Result<bool, ProviderError> {
        let client = self.client().await?;
        self.pacer.wait().await;
        match client.delete_task(external_id).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(true),
            Err(err) => Err(err.into()),
        }
    }

    fn full_fetch_is_complete(&self) -> bool {
        self.include_completed
    }

    async fn verify_item_exists(&self, external_id: &str) -> Result<bool, ProviderError> {
        if self.completed_ids.lock().await.contains(external_id) {
            return Ok(true);
        }
        let client = self.client().await?;
        self.pacer.wait().await;
        match client.get_task(external_id).await {
            Ok(task) => Ok(!task.is_deleted),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
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

fn parse_due(due: &Due) -> Option<OffsetDateTime> {
    if let Some(datetime) = due.datetime.as_deref() {
        return parse_datetime(datetime);
    }
    if due.date.contains('T') {
        return parse_datetime(&due.date);
    }
    let date = Date::parse(&due.date, DATE_FORMAT).ok()?;
    Some(date.with_time(END_OF_DAY).assume_utc())
}

/// Floating times (no offset) are read as UTC.
fn parse_datetime(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).ok().or_else(|| {
        PrimitiveDateTime::parse(value, FLOATING_FORMAT)
            .ok()
            .map(PrimitiveDateTime::assume_utc)
    })
}

/// Splits a due timestamp into Todoist's `due_date` / `due_datetime` pair.
fn format_due(
    due: Option<OffsetDateTime>,
) -> Result<(Option<String>, Option<String>), ProviderError> {
    let Some(due) = due else {
        return Ok((None, None));
    };
    let invalid = |err: time::error::Format| ProviderError::Provider(format!("bad due date: {err}"));
    let utc = due.to_offset(UtcOffset::UTC);
    if utc.time() == END_OF_DAY {
        return Ok((Some(utc.date().format(DATE_FORMAT).map_err(invalid)?), None));
    }
    let whole_seconds = utc.replace_nanosecond(0).unwrap_or(utc);
    Ok((None, Some(whole_seconds.format(&Rfc3339).map_err(invalid)?)))
}

fn request_id(task: &Task) -> String {
    let digest = Sha256::digest(format!("{}:{}", task.id, hash_fields(&task.sync_fields())));
    hex_prefix(&digest, 32)
}

fn command_uuid(external_id: &str, project_id: &str) -> String {
    let digest = Sha256::digest(format!("move:{external_id}:{project_id}"));
    let hex = hex_prefix(&digest, 32);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    hex.truncate(len);
    hex
}

#[cfg(test)]
#[path = "todoist_tests.rs"]
mod tests;
