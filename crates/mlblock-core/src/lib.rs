//! mlblock Core - Kernel orchestration for project sessions
//!
//! This crate provisions isolated kernel workers in containers, tracks
//! their lifecycle through a registration handshake and runtime events,
//! binds them to projects via signed webhook callbacks, and tunnels
//! project traffic to the live worker address.

pub mod adapters;
pub mod config;
pub mod credential;
pub mod error;
pub mod event;
pub mod http;
pub mod kernel;
pub mod project;
pub mod state;

pub use adapters::{ContainerRuntime, DockerRuntime, FakeRuntime};
pub use config::ServiceConfig;
pub use credential::CredentialSigner;
pub use error::{Error, Result};
pub use event::{KernelEvent, KernelEventType};
pub use kernel::{EventReconciler, KernelManager};
pub use project::{ProjectManager, RestKernelService, Tunnel};
pub use state::{BindingStatus, KernelRepository, KernelStatus, ProjectRepository};
