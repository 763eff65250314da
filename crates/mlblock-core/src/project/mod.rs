//! Project side - sessions, their kernel binding and the tunnel to bound kernels.

mod manager;
mod provisioner;
mod tunnel;

pub use manager::{ConnectOutcome, ProjectManager};
pub use provisioner::{KernelProvisioner, RestKernelService};
pub use tunnel::{upstream_url, Tunnel, TunnelRequest, TunnelResponse};
