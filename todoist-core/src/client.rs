use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

use crate::types::{NewTask, Project, SyncResponse, TaskUpdate, TodoistTask};

const DEFAULT_BASE_URL: &str = "https://api.todoist.com";

#[derive(Debug, Error)]
pub enum TodoistError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("sync command {uuid} failed: {detail}")]
    CommandFailed { uuid: String, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct TodoistClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl TodoistClient {
    pub fn new(token: impl Into<String>) -> Result<Self, TodoistError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, TodoistError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, TodoistError> {
        let url = self.endpoint("/rest/v2/projects")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_project(&self, name: &str) -> Result<Project, TodoistError> {
        let url = self.endpoint("/rest/v2/projects")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_task(&self, id: &str) -> Result<TodoistTask, TodoistError> {
        let url = self.endpoint(&format!("/rest/v2/tasks/{id}"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Creates a task. Todoist drops a replayed request carrying the same
    /// `X-Request-Id`, so callers pass a key derived from the logical change.
    pub async fn create_task(
        &self,
        task: &NewTask,
        request_id: Option<&str>,
    ) -> Result<TodoistTask, TodoistError> {
        let url = self.endpoint("/rest/v2/tasks")?;
        let mut request = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(task);
        if let Some(request_id) = request_id {
            request = request.header("X-Request-Id", request_id);
        }
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    pub async fn update_task(
        &self,
        id: &str,
        update: &TaskUpdate,
    ) -> Result<TodoistTask, TodoistError> {
        let url = self.endpoint(&format!("/rest/v2/tasks/{id}"))?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(update)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn close_task(&self, id: &str) -> Result<(), TodoistError> {
        let url = self.endpoint(&format!("/rest/v2/tasks/{id}/close"))?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    pub async fn reopen_task(&self, id: &str) -> Result<(), TodoistError> {
        let url = self.endpoint(&format!("/rest/v2/tasks/{id}/reopen"))?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    pub async fn delete_task(&self, id: &str) -> Result<(), TodoistError> {
        let url = self.endpoint(&format!("/rest/v2/tasks/{id}"))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    /// Calls the Sync API read endpoint. `"*"` requests a full snapshot;
    /// any other token returns only resources changed since it was issued.
    pub async fn sync(
        &self,
        sync_token: &str,
        resource_types: &[&str],
    ) -> Result<SyncResponse, TodoistError> {
        let url = self.endpoint("/sync/v9/sync")?;
        let resource_types = serde_json::to_string(resource_types)?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .form(&[
                ("sync_token", sync_token),
                ("resource_types", resource_types.as_str()),
            ])
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Moves a task to another project. The REST API cannot change a task's
    /// project, so this goes through an `item_move` Sync API command.
    pub async fn move_task(
        &self,
        id: &str,
        project_id: &str,
        command_uuid: &str,
    ) -> Result<(), TodoistError> {
        let url = self.endpoint("/sync/v9/sync")?;
        let commands = serde_json::to_string(&[serde_json::json!({
            "type": "item_move",
            "uuid": command_uuid,
            "args": { "id": id, "project_id": project_id },
        })])?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .form(&[("commands", commands.as_str())])
            .send()
            .await?;
        let result: CommandResponse = Self::handle_response(response).await?;
        match result.sync_status.get(command_uuid) {
            Some(Value::String(status)) if status == "ok" => Ok(()),
            Some(other) => Err(TodoistError::CommandFailed {
                uuid: command_uuid.to_string(),
                detail: other.to_string(),
            }),
            None => Err(TodoistError::CommandFailed {
                uuid: command_uuid.to_string(),
                detail: "missing from sync_status".to_string(),
            }),
        }
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, TodoistError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TodoistError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(TodoistError::Api { status, body })
        }
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), TodoistError> {
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(TodoistError::Api { status, body })
        }
    }
}

impl TodoistError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            TodoistError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            TodoistError::Request(err) => err.is_timeout() || err.is_connect(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TodoistError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    sync_status: HashMap<String, Value>,
}
