use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::model::{Task, TaskId};

const FRONTMATTER_FENCE: &str = "---";

#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid frontmatter in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("missing frontmatter in {0}")]
    MissingFrontmatter(PathBuf),
    #[error("task file {path} holds id {found}")]
    IdMismatch { path: PathBuf, found: TaskId },
}

/// Local task storage as seen by the sync engine. Implementations are
/// expected to make each call atomic on their own.
pub trait TaskStore: Send + Sync {
    fn list_todos(&self) -> Result<Vec<Task>, TaskStoreError>;
    fn load_todo(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError>;
    fn save_todo(&self, task: &Task) -> Result<(), TaskStoreError>;
    /// Returns false when there was nothing to delete.
    fn delete_todo(&self, id: TaskId) -> Result<bool, TaskStoreError>;
    fn next_id(&self) -> Result<TaskId, TaskStoreError>;
}

/// One Markdown file per task: YAML frontmatter with the task fields,
/// followed by the description as the document body.
pub struct MarkdownTaskStore {
    root: PathBuf,
}

impl MarkdownTaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, TaskStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, id: TaskId) -> PathBuf {
        self.root.join(format!("{id}.md"))
    }

    fn read_file(&self, path: &Path) -> Result<Task, TaskStoreError> {
        let content = fs::read_to_string(path)?;
        parse_document(path, &content)
    }
}

impl TaskStore for MarkdownTaskStore {
    fn list_todos(&self) -> Result<Vec<Task>, TaskStoreError> {
        let mut tasks = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_task_file = path.extension().is_some_and(|ext| ext == "md")
                && path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .is_some_and(|stem| stem.parse::<TaskId>().is_ok());
            if is_task_file {
                tasks.push(self.read_file(&path)?);
            }
        }
        tasks.sort_by_key(|task| task.id);
        Ok(tasks)
    }

    fn load_todo(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        let path = self.path_for(id);
        match fs::read_to_string(&path) {
            Ok(content) => {
                let task = parse_document(&path, &content)?;
                if task.id != id {
                    return Err(TaskStoreError::IdMismatch {
                        path,
                        found: task.id,
                    });
                }
                Ok(Some(task))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save_todo(&self, task: &Task) -> Result<(), TaskStoreError> {
        let path = self.path_for(task.id);
        let document = render_document(&path, task)?;
        let tmp = path.with_extension("md.tmp");
        fs::write(&tmp, document)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete_todo(&self, id: TaskId) -> Result<bool, TaskStoreError> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn next_id(&self) -> Result<TaskId, TaskStoreError> {
        let max = self.list_todos()?.iter().map(|task| task.id).max();
        Ok(max.map_or(1, |id| id + 1))
    }
}

fn render_document(path: &Path, task: &Task) -> Result<String, TaskStoreError> {
    let mut header = task.clone();
    let body = std::mem::take(&mut header.description);
    let yaml = serde_yaml::to_string(&header).map_err(|source| TaskStoreError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    let mut out = format!("{FRONTMATTER_FENCE}\n{yaml}{FRONTMATTER_FENCE}\n");
    if !body.is_empty() {
        out.push_str(&body);
        out.push('\n');
    }
    Ok(out)
}

fn parse_document(path: &Path, content: &str) -> Result<Task, TaskStoreError> {
    let missing = || TaskStoreError::MissingFrontmatter(path.to_path_buf());
    let rest = content
        .strip_prefix(FRONTMATTER_FENCE)
        .and_then(|rest| rest.strip_prefix('\n'))
        .ok_or_else(missing)?;
    let (yaml, body) = match rest.find("\n---\n") {
        Some(end) => (&rest[..end + 1], &rest[end + 5..]),
        None => match rest.strip_suffix("\n---") {
            Some(yaml) => (yaml, ""),
            None => return Err(missing()),
        },
    };
    let mut task: Task = serde_yaml::from_str(yaml).map_err(|source| TaskStoreError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    task.description = body.strip_suffix('\n').unwrap_or(body).to_string();
    Ok(task)
}

/// Keeps tasks in memory. Used by tests.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
}

impl MemoryTaskStore {
    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks.into_iter().map(|task| (task.id, task)).collect()),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, BTreeMap<TaskId, Task>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TaskStore for MemoryTaskStore {
    fn list_todos(&self) -> Result<Vec<Task>, TaskStoreError> {
        Ok(self.guard().values().cloned().collect())
    }

    fn load_todo(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        Ok(self.guard().get(&id).cloned())
    }

    fn save_todo(&self, task: &Task) -> Result<(), TaskStoreError> {
        self.guard().insert(task.id, task.clone());
        Ok(())
    }

    fn delete_todo(&self, id: TaskId) -> Result<bool, TaskStoreError> {
        Ok(self.guard().remove(&id).is_some())
    }

    fn next_id(&self) -> Result<TaskId, TaskStoreError> {
        Ok(self.guard().keys().next_back().map_or(1, |id| id + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use tempfile::tempdir;
    use time::macros::datetime;

    fn sample() -> Task {
        let mut task = Task::new(7, "Buy milk");
        task.description = "Two litres\n\nSemi-skimmed".into();
        task.priority = Priority::High;
        task.tags = vec!["errand".into()];
        task.due = Some(datetime!(2024-05-01 23:59:59 UTC));
        task.modified = datetime!(2024-04-30 08:00 UTC);
        task.notes = vec!["ask about oat milk".into()];
        task
    }

    #[test]
    fn markdown_store_persists_frontmatter_and_body() {
        let dir = tempdir().unwrap();
        let store = MarkdownTaskStore::new(dir.path()).unwrap();
        let task = sample();

        store.save_todo(&task).unwrap();

        let raw = fs::read_to_string(dir.path().join("7.md")).unwrap();
        assert!(raw.starts_with("---\n"));
        assert!(raw.contains("text: Buy milk"));
        assert!(raw.ends_with("Semi-skimmed\n"));
        assert_eq!(store.load_todo(7).unwrap(), Some(task));
    }

    #[test]
    fn markdown_store_lists_deletes_and_allocates_ids() {
        let dir = tempdir().unwrap();
        let store = MarkdownTaskStore::new(dir.path()).unwrap();
        assert_eq!(store.next_id().unwrap(), 1);

        store.save_todo(&sample()).unwrap();
        store.save_todo(&Task::new(2, "Call mom")).unwrap();
        fs::write(dir.path().join("README.md"), "not a task").unwrap();

        let ids: Vec<_> = store.list_todos().unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 7]);
        assert_eq!(store.next_id().unwrap(), 8);

        assert!(store.delete_todo(7).unwrap());
        assert!(!store.delete_todo(7).unwrap());
        assert_eq!(store.load_todo(7).unwrap(), None);
    }

    #[test]
    fn task_without_body_round_trips() {
        let dir = tempdir().unwrap();
        let store = MarkdownTaskStore::new(dir.path()).unwrap();
        let mut task = Task::new(3, "No body");
        task.modified = datetime!(2024-01-01 00:00 UTC);

        store.save_todo(&task).unwrap();

        assert_eq!(store.load_todo(3).unwrap(), Some(task));
    }

    #[test]
    fn rejects_file_without_frontmatter() {
        let dir = tempdir().unwrap();
        let store = MarkdownTaskStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("4.md"), "just text").unwrap();

        assert!(matches!(
            store.load_todo(4),
            Err(TaskStoreError::MissingFrontmatter(_))
        ));
    }

    #[test]
    fn memory_store_behaves_like_a_store() {
        let store = MemoryTaskStore::with_tasks([Task::new(5, "a")]);
        assert_eq!(store.next_id().unwrap(), 6);
        store.save_todo(&Task::new(6, "b")).unwrap();
        assert_eq!(store.list_todos().unwrap().len(), 2);
        assert!(store.delete_todo(5).unwrap());
        assert!(store.load_todo(5).unwrap().is_none());
    }
}
