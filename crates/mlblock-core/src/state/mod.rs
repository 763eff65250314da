//! State management - kernel and project records and their SQLite repositories.

mod db;
mod kernel;
mod kernel_repository;
mod project;
mod project_repository;

pub use db::StoreError;
pub use kernel::{KernelResource, KernelStatus};
pub use kernel_repository::KernelRepository;
pub use project::{BindingStatus, Project};
pub use project_repository::ProjectRepository;
