mod client;
mod types;

pub use client::{ApiErrorClass, TodoistClient, TodoistError};
pub use types::{Due, NewTask, Project, SyncResponse, TaskUpdate, TodoistTask};
