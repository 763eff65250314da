//! Kernel repository - persistent kernel records.

use std::path::Path;

use rusqlite::{params, OptionalExtension, Row};

use super::db::{off_thread, Db, StoreError};
use super::{KernelResource, KernelStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kernels (
    id              TEXT PRIMARY KEY,
    container_id    TEXT,
    container_image TEXT NOT NULL,
    status          TEXT NOT NULL,
    url             TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_kernels_container_id ON kernels (container_id);
";

const COLUMNS: &str = "id, container_id, container_image, status, url, created_at";

/// Kernel records in SQLite.
///
/// Status updates are conditional on the current status so that a
/// record never moves backwards, whichever process writes it.
#[derive(Clone)]
pub struct KernelRepository {
    db: Db,
}

impl KernelRepository {
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

    pub fn insert(&self, kernel: &KernelResource) -> Result<(), StoreError> {
        self.db.lock()?.execute(
            "INSERT INTO kernels (id, container_id, container_image, status, url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                kernel.id,
                kernel.container_id,
                kernel.container_image,
                kernel.status,
                kernel.url,
                kernel.created_at,
            ],
        )?;
        Ok(())
    }

    /// Attach the runtime handle. Returns false if the record is gone.
    pub fn attach_container(&self, id: &str, container_id: &str) -> Result<bool, StoreError> {
        let changed = self.db.lock()?.execute(
            "UPDATE kernels SET container_id = ?2 WHERE id = ?1",
            params![id, container_id],
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<KernelResource>, StoreError> {
        let conn = self.db.lock()?;
        let kernel = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM kernels WHERE id = ?1"),
                params![id],
                kernel_from_row,
            )
            .optional()?;
        Ok(kernel)
    }

    pub fn list(&self) -> Result<Vec<KernelResource>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM kernels ORDER BY created_at DESC"
        ))?;
        let kernels = stmt
            .query_map([], kernel_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(kernels)
    }

    pub fn find_by_container_id(
        &self,
        container_id: &str,
    ) -> Result<Option<KernelResource>, StoreError> {
        let conn = self.db.lock()?;
        let kernel = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM kernels WHERE container_id = ?1"),
                params![container_id],
                kernel_from_row,
            )
            .optional()?;
        Ok(kernel)
    }

    /// STARTING -> RUNNING with the reachable address.
    ///
    /// Returns false when the record is absent or no longer STARTING.
    pub fn mark_running(&self, id: &str, url: &str) -> Result<bool, StoreError> {
        let changed = self.db.lock()?.execute(
            "UPDATE kernels SET status = ?2, url = ?3 WHERE id = ?1 AND status = ?4",
            params![id, KernelStatus::Running, url, KernelStatus::Starting],
        )?;
        Ok(changed > 0)
    }

    /// Live status -> STOPPED or ERROR, clearing the address.
    ///
    /// Returns false when the record is absent or already terminal.
    pub fn mark_exited(&self, id: &str, status: KernelStatus) -> Result<bool, StoreError> {
        debug_assert!(status.is_terminal());
        let changed = self.db.lock()?.execute(
            "UPDATE kernels SET status = ?2, url = NULL
             WHERE id = ?1 AND status IN (?3, ?4)",
            params![id, status, KernelStatus::Starting, KernelStatus::Running],
        )?;
        Ok(changed > 0)
    }

    /// Delete a record. Returns false if it was already absent.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self
            .db
            .lock()?
            .execute("DELETE FROM kernels WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

fn kernel_from_row(row: &Row<'_>) -> rusqlite::Result<KernelResource> {
    Ok(KernelResource {
        id: row.get(0)?,
        container_id: row.get(1)?,
        container_image: row.get(2)?,
        status: row.get(3)?,
        url: row.get(4)?,
        created_at: row.get(5)?,
    })
}
