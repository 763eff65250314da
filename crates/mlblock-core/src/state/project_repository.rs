//! Project repository - persistent project records.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::db::{off_thread, Db, StoreError};
use super::{BindingStatus, Project};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    kernel_id     TEXT,
    kernel_url    TEXT,
    kernel_status TEXT NOT NULL,
    graph         TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_projects_kernel_id ON projects (kernel_id);
";

const COLUMNS: &str =
    "id, name, kernel_id, kernel_url, kernel_status, graph, created_at, updated_at";

/// Project records in SQLite.
#[derive(Clone)]
pub struct ProjectRepository {
    db: Db,
}

impl ProjectRepository {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            db: Db::open(path, SCHEMA)?,
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            db: Db::open_in_memory(SCHEMA)?,
        })
    }

    /// Run `work` against a clone of this repository off the async threads.
    pub async fn blocking<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Self) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let repo = self.clone();
        off_thread(move || work(&repo)).await
    }

    pub fn insert(&self, project: &Project) -> Result<(), StoreError> {
        self.db.lock()?.execute(
            "INSERT INTO projects (id, name, kernel_id, kernel_url, kernel_status, graph, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                project.id,
                project.name,
                project.kernel_id,
                project.kernel_url,
                project.kernel_status,
                project.graph,
                project.created_at,
                project.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Project>, StoreError> {
        let conn = self.db.lock()?;
        let project = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM projects WHERE id = ?1"),
                params![id],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    /// Newest first.
    pub fn list(&self, skip: u32, limit: u32) -> Result<Vec<Project>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM projects ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let projects = stmt
            .query_map(params![limit, skip], project_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    pub fn find_by_kernel_id(&self, kernel_id: &str) -> Result<Option<Project>, StoreError> {
        let conn = self.db.lock()?;
        let project = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM projects WHERE kernel_id = ?1"),
                params![kernel_id],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    /// Atomically move an unbound project to CONNECTING.
    ///
    /// Returns false when the project is absent, already has a kernel,
    /// or is CONNECTED/CONNECTING. Exactly one of any number of
    /// concurrent callers wins.
    pub fn begin_connect(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self.db.lock()?.execute(
            "UPDATE projects SET kernel_status = ?2, updated_at = ?3
             WHERE id = ?1 AND kernel_id IS NULL AND kernel_status NOT IN (?4, ?2)",
            params![
                id,
                BindingStatus::Connecting,
                Utc::now(),
                BindingStatus::Connected,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Bind a started kernel and mark the project CONNECTED.
    pub fn bind_kernel(&self, id: &str, kernel_id: &str, kernel_url: &str) -> Result<bool, StoreError> {
        let changed = self.db.lock()?.execute(
            "UPDATE projects SET kernel_id = ?2, kernel_url = ?3, kernel_status = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, kernel_id, kernel_url, BindingStatus::Connected, Utc::now()],
        )?;
        Ok(changed > 0)
    }

    /// Clear the binding and mark the project DISCONNECTED, unless a
    /// connection is in flight.
    pub fn release_binding(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self.db.lock()?.execute(
            "UPDATE projects SET kernel_id = NULL, kernel_url = NULL, kernel_status = ?2, updated_at = ?3
             WHERE id = ?1 AND kernel_status != ?4",
            params![
                id,
                BindingStatus::Disconnected,
                Utc::now(),
                BindingStatus::Connecting,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn save_graph(&self, id: &str, graph: &serde_json::Value) -> Result<bool, StoreError> {
        let changed = self.db.lock()?.execute(
            "UPDATE projects SET graph = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, graph, Utc::now()],
        )?;
        Ok(changed > 0)
    }

    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self
            .db
            .lock()?
            .execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        kernel_id: row.get(2)?,
        kernel_url: row.get(3)?,
        kernel_status: row.get(4)?,
        graph: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_with_project() -> (ProjectRepository, Project) {
        let repo = ProjectRepository::in_memory().unwrap();
        let project = Project::new();
        repo.insert(&project).unwrap();
        (repo, project)
    }

    #[test]
    fn begin_connect_wins_once() {
        let (repo, project) = repo_with_project();

        assert!(repo.begin_connect(&project.id).unwrap());
        assert!(!repo.begin_connect(&project.id).unwrap());

        let stored = repo.get(&project.id).unwrap().unwrap();
        assert_eq!(stored.kernel_status, BindingStatus::Connecting);
        assert!(stored.kernel_id.is_none());
    }

    #[test]
    fn begin_connect_refuses_bound_projects() {
        let (repo, project) = repo_with_project();
        repo.bind_kernel(&project.id, "k1", "http://h:1").unwrap();

        assert!(!repo.begin_connect(&project.id).unwrap());
        assert!(!repo.begin_connect("missing").unwrap());
    }

    #[test]
    fn errored_projects_can_reconnect() {
        let (repo, mut project) = repo_with_project();
        project.id = "p-err".to_string();
        project.kernel_status = BindingStatus::Error;
        repo.insert(&project).unwrap();

        assert!(repo.begin_connect("p-err").unwrap());
    }

    #[test]
    fn bind_then_release() {
        let (repo, project) = repo_with_project();
        assert!(repo.bind_kernel(&project.id, "k1", "http://h:1").unwrap());

        let bound = repo.find_by_kernel_id("k1").unwrap().unwrap();
        assert_eq!(bound.kernel_status, BindingStatus::Connected);
        assert_eq!(bound.kernel_url.as_deref(), Some("http://h:1"));

        assert!(repo.release_binding(&project.id).unwrap());
        let released = repo.get(&project.id).unwrap().unwrap();
        assert_eq!(released.kernel_status, BindingStatus::Disconnected);
        assert!(released.kernel_id.is_none() && released.kernel_url.is_none());
        assert!(repo.find_by_kernel_id("k1").unwrap().is_none());
    }

    #[test]
    fn release_leaves_connecting_projects_alone() {
        let (repo, project) = repo_with_project();
        repo.begin_connect(&project.id).unwrap();

        assert!(!repo.release_binding(&project.id).unwrap());
        assert_eq!(
            repo.get(&project.id).unwrap().unwrap().kernel_status,
            BindingStatus::Connecting
        );
    }

    #[test]
    fn graph_checkpoint_and_paging() {
        let (repo, project) = repo_with_project();
        let graph = serde_json::json!({"nodes": [{"id": "n1"}], "edges": []});
        assert!(repo.save_graph(&project.id, &graph).unwrap());
        assert_eq!(repo.get(&project.id).unwrap().unwrap().graph, Some(graph));

        for _ in 0..3 {
            repo.insert(&Project::new()).unwrap();
        }
        assert_eq!(repo.list(0, 10).unwrap().len(), 4);
        assert_eq!(repo.list(1, 2).unwrap().len(), 2);
        assert_eq!(repo.list(3, 10).unwrap().len(), 1);
    }
}
